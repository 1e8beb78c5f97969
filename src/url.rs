//! Crawl URL value type: a parsed absolute reference plus crawl bookkeeping.

use chrono::{DateTime, Utc};
use url::Url;

#[derive(Debug, thiserror::Error)]
#[error("invalid {list} pattern: {source}")]
pub struct LinkFilterError {
    list: String,
    source: regex::Error,
}

/// Sentinel crawl time for links that have been discovered but never fetched.
pub const NOT_YET_CRAWLED: DateTime<Utc> = DateTime::UNIX_EPOCH;

/// A URL as the crawler tracks it: the parsed reference together with the
/// last time it was fetched (`NOT_YET_CRAWLED` until then).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlUrl {
    pub url: Url,
    pub last_crawled: DateTime<Utc>,
}

impl CrawlUrl {
    /// Parse an absolute reference into a `CrawlUrl` with no crawl history.
    pub fn parse(reference: &str) -> Result<Self, url::ParseError> {
        let url = Url::parse(reference)?;
        Ok(Self {
            url,
            last_crawled: NOT_YET_CRAWLED,
        })
    }

    pub fn new(url: Url) -> Self {
        Self {
            url,
            last_crawled: NOT_YET_CRAWLED,
        }
    }

    /// Reassemble a URL from store columns. The subdomain may carry a
    /// trailing dot and the path may lack its leading slash; both forms are
    /// accepted.
    pub fn from_parts(
        domain: &str,
        subdomain: &str,
        path: &str,
        scheme: &str,
        last_crawled: DateTime<Utc>,
    ) -> Result<Self, url::ParseError> {
        let mut host = String::new();
        if !subdomain.is_empty() {
            host.push_str(subdomain.trim_end_matches('.'));
            host.push('.');
        }
        host.push_str(domain);

        let sep = if path.starts_with('/') || path.is_empty() {
            ""
        } else {
            "/"
        };
        let url = Url::parse(&format!("{scheme}://{host}{sep}{path}"))?;
        Ok(Self { url, last_crawled })
    }

    /// The registered domain (effective TLD plus one label) of this URL's
    /// host, per the Public Suffix List. Hosts the list cannot answer for
    /// (IP literals, single labels) fall back to the raw host.
    pub fn tld_plus_one(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        psl::domain_str(host).unwrap_or(host).to_string()
    }

    /// The host with the registered domain removed, without a trailing dot.
    /// Empty when the host is exactly the registered domain.
    pub fn subdomain(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        let tld1 = self.tld_plus_one();
        host.strip_suffix(&tld1)
            .map(|rest| rest.trim_end_matches('.').to_string())
            .unwrap_or_default()
    }

    /// Path plus query string, the per-domain portion of the link key.
    pub fn path_with_query(&self) -> String {
        match self.url.query() {
            Some(q) => format!("{}?{}", self.url.path(), q),
            None => self.url.path().to_string(),
        }
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn was_crawled(&self) -> bool {
        self.last_crawled != NOT_YET_CRAWLED
    }
}

impl std::fmt::Display for CrawlUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.url, f)
    }
}

/// Remove query parameters whose names appear in `names` (case-insensitive).
/// Used to strip session identifiers before links are stored.
pub fn purge_session_ids(url: &mut Url, names: &[String]) {
    if names.is_empty() || url.query().is_none() {
        return;
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !names.iter().any(|n| n.eq_ignore_ascii_case(key)))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }
}

/// Include/exclude link policy. Each pattern list is aggregated into a single
/// alternation so matching stays one regex test per list.
#[derive(Debug, Clone, Default)]
pub struct LinkFilters {
    include: Option<regex::Regex>,
    exclude: Option<regex::Regex>,
}

impl LinkFilters {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self, LinkFilterError> {
        Ok(Self {
            include: Self::aggregate(include, "include_link_patterns")?,
            exclude: Self::aggregate(exclude, "exclude_link_patterns")?,
        })
    }

    fn aggregate(patterns: &[String], list: &str) -> Result<Option<regex::Regex>, LinkFilterError> {
        if patterns.is_empty() {
            return Ok(None);
        }
        let joined = patterns
            .iter()
            .map(|p| format!("(?:{p})"))
            .collect::<Vec<_>>()
            .join("|");
        regex::Regex::new(&joined)
            .map(Some)
            .map_err(|source| LinkFilterError {
                list: list.to_string(),
                source,
            })
    }

    /// A URL passes when it matches at least one include pattern (if any are
    /// configured) and none of the exclude patterns.
    pub fn accepts(&self, url: &str) -> bool {
        if let Some(include) = &self.include {
            if !include.is_match(url) {
                return false;
            }
        }
        match &self.exclude {
            Some(exclude) => !exclude.is_match(url),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tld_plus_one_uses_public_suffix_rules() {
        let u = CrawlUrl::parse("http://www.bbc.co.uk/news").unwrap();
        assert_eq!(u.tld_plus_one(), "bbc.co.uk");
        assert_eq!(u.subdomain(), "www");

        let u = CrawlUrl::parse("https://example.com/").unwrap();
        assert_eq!(u.tld_plus_one(), "example.com");
        assert_eq!(u.subdomain(), "");

        let u = CrawlUrl::parse("https://a.b.example.com/").unwrap();
        assert_eq!(u.subdomain(), "a.b");
    }

    #[test]
    fn from_parts_repairs_loose_columns() {
        let u = CrawlUrl::from_parts("test.com", "www.", "page.html", "http", NOT_YET_CRAWLED)
            .unwrap();
        assert_eq!(u.to_string(), "http://www.test.com/page.html");

        let u = CrawlUrl::from_parts("test.com", "", "/page.html?p=v", "https", NOT_YET_CRAWLED)
            .unwrap();
        assert_eq!(u.to_string(), "https://test.com/page.html?p=v");
        assert_eq!(u.path_with_query(), "/page.html?p=v");
    }

    #[test]
    fn default_ports_are_canonicalized_away() {
        let u = CrawlUrl::parse("http://test.com:80/a").unwrap();
        assert_eq!(u.to_string(), "http://test.com/a");
        let u = CrawlUrl::parse("https://test.com:443/a").unwrap();
        assert_eq!(u.to_string(), "https://test.com/a");
    }

    #[test]
    fn purge_session_ids_is_case_insensitive() {
        let names = vec!["jsessionid".to_string(), "phpsessid".to_string()];

        let mut u = Url::parse("http://t.com/p?a=1&JSESSIONID=abc&b=2").unwrap();
        purge_session_ids(&mut u, &names);
        assert_eq!(u.as_str(), "http://t.com/p?a=1&b=2");

        let mut u = Url::parse("http://t.com/p?phpsessid=x").unwrap();
        purge_session_ids(&mut u, &names);
        assert_eq!(u.as_str(), "http://t.com/p");

        let mut u = Url::parse("http://t.com/p?a=1").unwrap();
        purge_session_ids(&mut u, &names);
        assert_eq!(u.as_str(), "http://t.com/p?a=1");
    }

    #[test]
    fn link_filters_apply_include_then_exclude() {
        let filters = LinkFilters::new(
            &["/articles/".to_string(), "/news/".to_string()],
            &["\\.pdf$".to_string()],
        )
        .unwrap();

        assert!(filters.accepts("http://t.com/articles/1.html"));
        assert!(filters.accepts("http://t.com/news/2.html"));
        assert!(!filters.accepts("http://t.com/about.html"));
        assert!(!filters.accepts("http://t.com/articles/1.pdf"));

        let open = LinkFilters::new(&[], &[]).unwrap();
        assert!(open.accepts("http://anything.com/"));
    }

    #[test]
    fn link_filters_reject_bad_patterns() {
        assert!(LinkFilters::new(&["(".to_string()], &[]).is_err());
    }
}
