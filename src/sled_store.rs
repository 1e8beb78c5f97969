//! Sled-backed implementation of the link store contract.
//!
//! Three trees mirror the logical schema: `links` (append-only fetch
//! history), `segments` (per-domain work plans), and `domains` (ownership
//! and statistics). Link keys are `dom \0 subdom \0 path \0 proto \0
//! inverted-millis`, so a prefix scan yields each logical URL's rows
//! newest-first, grouped in `(subdomain, path, scheme)` order.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use uuid::Uuid;

use crate::config::CrawlerConfig;
use crate::store::{
    DispatchStore, DomainInfo, DomainStats, FetchResults, LinkRecord, LinkStore, SegmentCursor,
    StoreError,
};
use crate::url::CrawlUrl;

const SEP: u8 = 0;

#[derive(Debug, Serialize, Deserialize)]
struct SegmentRow {
    subdomain: String,
    path: String,
    scheme: String,
    crawl_time: chrono::DateTime<Utc>,
}

pub struct SledStore {
    db: sled::Db,
    links: sled::Tree,
    segments: sled::Tree,
    domains: sled::Tree,
    add_new_domains: bool,
    /// Domains recently auto-created from outlinks, so hot pages do not
    /// re-write the same domain row on every parsed link.
    added_domains: Mutex<LruCache<String, ()>>,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P, config: &CrawlerConfig) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let links = db.open_tree("links")?;
        let segments = db.open_tree("segments")?;
        let domains = db.open_tree("domains")?;

        let cache_size = NonZeroUsize::new(config.added_domains_cache_size.max(1))
            .unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            db,
            links,
            segments,
            domains,
            add_new_domains: config.add_new_domains,
            added_domains: Mutex::new(LruCache::new(cache_size)),
        })
    }

    fn url_prefix(domain: &str, subdomain: &str, path: &str, scheme: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(domain.len() + subdomain.len() + path.len() + scheme.len() + 4);
        for part in [domain, subdomain, path, scheme] {
            key.extend_from_slice(part.as_bytes());
            key.push(SEP);
        }
        key
    }

    fn link_key(record: &LinkRecord) -> Vec<u8> {
        let mut key = Self::url_prefix(
            &record.domain,
            &record.subdomain,
            &record.path,
            &record.scheme,
        );
        let millis = record.crawl_time.timestamp_millis().max(0) as u64;
        key.extend_from_slice(&(u64::MAX - millis).to_be_bytes());
        key
    }

    fn domain_prefix(domain: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(domain.len() + 1);
        key.extend_from_slice(domain.as_bytes());
        key.push(SEP);
        key
    }

    fn segment_key(domain: &str, seq: u32) -> Vec<u8> {
        let mut key = Self::domain_prefix(domain);
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    /// Direct row insert. Seeding and tests lay down history with this; the
    /// crawl path goes through the trait methods.
    pub fn insert_record(&self, record: &LinkRecord) -> Result<(), StoreError> {
        let value = serde_json::to_vec(record)?;
        self.links.insert(Self::link_key(record), value)?;
        Ok(())
    }

    /// Direct domain row write, for seeding and for tests that need
    /// `dispatched` or `excluded` preset.
    pub fn insert_domain_info(&self, info: &DomainInfo) -> Result<(), StoreError> {
        let value = serde_json::to_vec(info)?;
        self.domains.insert(info.domain.as_bytes(), value)?;
        Ok(())
    }

    fn record_for(fr: &FetchResults) -> LinkRecord {
        let url = &fr.url;
        LinkRecord {
            domain: url.tld_plus_one(),
            subdomain: url.subdomain(),
            path: url.path_with_query(),
            scheme: url.scheme().to_string(),
            crawl_time: fr.fetch_time,
            status: fr.response.as_ref().map(|r| r.status),
            error: fr.fetch_error.as_ref().map(|e| e.to_string()),
            getnow: false,
            robots_excluded: fr.excluded_by_robots,
        }
    }

    fn read_domain(&self, domain: &str) -> Result<Option<DomainInfo>, StoreError> {
        match self.domains.get(domain.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Read-modify-write one domain row with compare-and-swap retries.
    /// Returns false when the row does not exist.
    fn update_domain<F>(&self, domain: &str, mut apply: F) -> Result<bool, StoreError>
    where
        F: FnMut(&mut DomainInfo),
    {
        loop {
            let Some(raw) = self.domains.get(domain.as_bytes())? else {
                return Ok(false);
            };
            let mut info: DomainInfo = serde_json::from_slice(&raw)?;
            apply(&mut info);
            let new = serde_json::to_vec(&info)?;
            match self
                .domains
                .compare_and_swap(domain.as_bytes(), Some(raw), Some(new))?
            {
                Ok(()) => return Ok(true),
                Err(_) => continue,
            }
        }
    }

    fn clear_segment(&self, domain: &str) -> Result<(), StoreError> {
        let keys: Vec<_> = self
            .segments
            .scan_prefix(Self::domain_prefix(domain))
            .keys()
            .collect::<Result<_, _>>()?;
        for key in keys {
            self.segments.remove(key)?;
        }
        Ok(())
    }
}

#[async_trait]
impl LinkStore for SledStore {
    async fn claim_new_host(&self) -> Result<Option<String>, StoreError> {
        for entry in self.domains.iter() {
            let (key, raw) = entry?;
            let info: DomainInfo = serde_json::from_slice(&raw)?;
            if !info.dispatched || info.excluded || info.claim_token.is_some() {
                continue;
            }

            let mut claimed = info.clone();
            claimed.claim_token = Some(Uuid::new_v4());
            claimed.claim_time = Some(Utc::now());
            let new = serde_json::to_vec(&claimed)?;

            // Another fetcher may have won the row since the read; losing
            // the swap just moves us to the next candidate.
            if self
                .domains
                .compare_and_swap(&key, Some(raw), Some(new))?
                .is_ok()
            {
                return Ok(Some(info.domain));
            }
        }
        Ok(None)
    }

    async fn unclaim_host(&self, host: &str) -> Result<(), StoreError> {
        self.update_domain(host, |info| {
            info.claim_token = None;
            info.claim_time = None;
            info.dispatched = false;
        })?;
        self.clear_segment(host)
    }

    async fn unclaim_all(&self) -> Result<(), StoreError> {
        let domains: Vec<String> = self
            .domains
            .iter()
            .keys()
            .map(|key| {
                key.map(|k| String::from_utf8_lossy(&k).into_owned())
                    .map_err(StoreError::from)
            })
            .collect::<Result<_, _>>()?;

        for domain in domains {
            self.update_domain(&domain, |info| {
                info.claim_token = None;
                info.claim_time = None;
            })?;
        }
        Ok(())
    }

    async fn links_for_host(&self, host: &str) -> Result<SegmentCursor, StoreError> {
        let mut urls = Vec::new();
        for entry in self.segments.scan_prefix(Self::domain_prefix(host)) {
            let (_, raw) = entry?;
            let row: SegmentRow = serde_json::from_slice(&raw)?;
            match CrawlUrl::from_parts(host, &row.subdomain, &row.path, &row.scheme, row.crawl_time)
            {
                Ok(url) => urls.push(url),
                Err(e) => {
                    tracing::warn!(host, error = %e, "skipping unbuildable segment row");
                }
            }
        }
        Ok(SegmentCursor::from_vec(urls))
    }

    async fn store_url_fetch_results(&self, fr: &FetchResults) -> Result<(), StoreError> {
        self.insert_record(&Self::record_for(fr))
    }

    async fn store_parsed_url(&self, url: &CrawlUrl, _fr: &FetchResults) -> Result<(), StoreError> {
        let record = LinkRecord {
            domain: url.tld_plus_one(),
            subdomain: url.subdomain(),
            path: url.path_with_query(),
            scheme: url.scheme().to_string(),
            crawl_time: url.last_crawled,
            status: None,
            error: None,
            getnow: false,
            robots_excluded: false,
        };

        // Best-effort dedup: any existing row for this URL means it is
        // already known.
        let prefix =
            Self::url_prefix(&record.domain, &record.subdomain, &record.path, &record.scheme);
        if self.links.scan_prefix(prefix).next().is_some() {
            return Ok(());
        }

        if self.add_new_domains {
            let recently_added = self
                .added_domains
                .lock()
                .expect("added domains lock")
                .put(record.domain.clone(), ())
                .is_some();
            if !recently_added && self.read_domain(&record.domain)?.is_none() {
                self.insert_domain_info(&DomainInfo::new(&record.domain))?;
            }
        }

        self.insert_record(&record)
    }

    async fn keep_alive(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[async_trait]
impl DispatchStore for SledStore {
    async fn add_domain(&self, domain: &str) -> Result<(), StoreError> {
        if self.read_domain(domain)?.is_none() {
            self.insert_domain_info(&DomainInfo::new(domain))?;
        }
        Ok(())
    }

    async fn insert_link(&self, url: &CrawlUrl, getnow: bool) -> Result<(), StoreError> {
        let domain = url.tld_plus_one();
        self.add_domain(&domain).await?;
        self.insert_record(&LinkRecord {
            domain,
            subdomain: url.subdomain(),
            path: url.path_with_query(),
            scheme: url.scheme().to_string(),
            crawl_time: url.last_crawled,
            status: None,
            error: None,
            getnow,
            robots_excluded: false,
        })
    }

    async fn domain_info(&self, domain: &str) -> Result<Option<DomainInfo>, StoreError> {
        self.read_domain(domain)
    }

    async fn undispatched_domains(&self) -> Result<Vec<DomainInfo>, StoreError> {
        let mut out = Vec::new();
        for entry in self.domains.iter() {
            let (_, raw) = entry?;
            let info: DomainInfo = serde_json::from_slice(&raw)?;
            if !info.dispatched && !info.excluded {
                out.push(info);
            }
        }
        Ok(out)
    }

    async fn latest_links(&self, domain: &str) -> Result<Vec<LinkRecord>, StoreError> {
        let mut out: Vec<LinkRecord> = Vec::new();
        for entry in self.links.scan_prefix(Self::domain_prefix(domain)) {
            let (_, raw) = entry?;
            let record: LinkRecord = serde_json::from_slice(&raw)?;

            // Rows for one URL are adjacent and newest-first; keep the head
            // of each group.
            let same_url = out.last().map(|prev: &LinkRecord| {
                prev.subdomain == record.subdomain
                    && prev.path == record.path
                    && prev.scheme == record.scheme
            });
            if same_url != Some(true) {
                out.push(record);
            }
        }
        Ok(out)
    }

    async fn write_segment(
        &self,
        domain: &str,
        links: &[CrawlUrl],
        stats: DomainStats,
    ) -> Result<(), StoreError> {
        let mut rows = Vec::with_capacity(links.len());
        for (seq, link) in links.iter().enumerate() {
            let row = SegmentRow {
                subdomain: link.subdomain(),
                path: link.path_with_query(),
                scheme: link.scheme().to_string(),
                crawl_time: link.last_crawled,
            };
            rows.push((
                Self::segment_key(domain, seq as u32),
                serde_json::to_vec(&row)?,
            ));
        }

        let stale_keys: Vec<_> = self
            .segments
            .scan_prefix(Self::domain_prefix(domain))
            .keys()
            .collect::<Result<_, _>>()?;

        let result = (&self.segments, &self.domains).transaction(|(segments, domains)| {
            for key in &stale_keys {
                segments.remove(key.as_ref())?;
            }
            for (key, value) in &rows {
                segments.insert(key.as_slice(), value.as_slice())?;
            }

            let mut info = match domains.get(domain.as_bytes())? {
                Some(raw) => serde_json::from_slice::<DomainInfo>(&raw)
                    .map_err(|e| ConflictableTransactionError::Abort(StoreError::from(e)))?,
                None => DomainInfo::new(domain),
            };
            info.dispatched = true;
            info.tot_links = stats.tot_links;
            info.uncrawled_links = stats.uncrawled_links;
            info.queued_links = stats.queued_links;

            let raw = serde_json::to_vec(&info)
                .map_err(|e| ConflictableTransactionError::Abort(StoreError::from(e)))?;
            domains.insert(domain.as_bytes(), raw)?;
            Ok(())
        });

        result.map_err(|e| match e {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => e.into(),
        })
    }

    async fn update_domain_stats(
        &self,
        domain: &str,
        stats: DomainStats,
    ) -> Result<(), StoreError> {
        self.update_domain(domain, |info| {
            info.tot_links = stats.tot_links;
            info.uncrawled_links = stats.uncrawled_links;
            info.queued_links = stats.queued_links;
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PageResponse;
    use crate::url::NOT_YET_CRAWLED;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, SledStore) {
        let dir = TempDir::new().unwrap();
        let store = SledStore::open(dir.path(), &CrawlerConfig::default()).unwrap();
        (dir, store)
    }

    async fn dispatched_domain(store: &SledStore, domain: &str) {
        let url = CrawlUrl::parse(&format!("http://{domain}/")).unwrap();
        store
            .insert_record(&LinkRecord {
                domain: domain.to_string(),
                subdomain: String::new(),
                path: "/".to_string(),
                scheme: "http".to_string(),
                crawl_time: NOT_YET_CRAWLED,
                status: None,
                error: None,
                getnow: false,
                robots_excluded: false,
            })
            .unwrap();
        store.add_domain(domain).await.unwrap();
        store
            .write_segment(
                domain,
                &[url],
                DomainStats {
                    tot_links: 1,
                    uncrawled_links: 1,
                    queued_links: 1,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_released() {
        let (_dir, store) = open_store();
        dispatched_domain(&store, "test.com").await;

        assert_eq!(store.claim_new_host().await.unwrap().as_deref(), Some("test.com"));
        // Same domain cannot be claimed twice.
        assert_eq!(store.claim_new_host().await.unwrap(), None);

        store.unclaim_host("test.com").await.unwrap();
        let info = store.domain_info("test.com").await.unwrap().unwrap();
        assert!(info.claim_token.is_none());
        assert!(!info.dispatched);

        // Undispatched domains are not claimable.
        assert_eq!(store.claim_new_host().await.unwrap(), None);
        // The consumed segment is gone.
        let mut cursor = store.links_for_host("test.com").await.unwrap();
        assert!(cursor.next().is_none());
    }

    #[tokio::test]
    async fn unclaim_host_is_idempotent() {
        let (_dir, store) = open_store();
        store.unclaim_host("absent.com").await.unwrap();

        dispatched_domain(&store, "test.com").await;
        store.unclaim_host("test.com").await.unwrap();
        store.unclaim_host("test.com").await.unwrap();
    }

    #[tokio::test]
    async fn unclaim_all_clears_tokens_but_keeps_dispatch() {
        let (_dir, store) = open_store();
        dispatched_domain(&store, "test.com").await;

        assert!(store.claim_new_host().await.unwrap().is_some());
        store.unclaim_all().await.unwrap();

        let info = store.domain_info("test.com").await.unwrap().unwrap();
        assert!(info.claim_token.is_none());
        assert!(info.dispatched);

        // The domain is claimable again, segment intact.
        assert_eq!(store.claim_new_host().await.unwrap().as_deref(), Some("test.com"));
        let mut cursor = store.links_for_host("test.com").await.unwrap();
        assert!(cursor.next().is_some());
    }

    #[tokio::test]
    async fn excluded_domains_are_never_claimed() {
        let (_dir, store) = open_store();
        dispatched_domain(&store, "test.com").await;
        let mut info = store.domain_info("test.com").await.unwrap().unwrap();
        info.excluded = true;
        store.insert_domain_info(&info).unwrap();

        assert_eq!(store.claim_new_host().await.unwrap(), None);
    }

    #[tokio::test]
    async fn parsed_urls_dedup_against_history() {
        let (_dir, store) = open_store();
        let url = CrawlUrl::parse("http://test.com/a.html").unwrap();
        let fr = FetchResults::robots_excluded(
            CrawlUrl::parse("http://test.com/").unwrap(),
            Utc::now(),
        );

        store.store_parsed_url(&url, &fr).await.unwrap();
        store.store_parsed_url(&url, &fr).await.unwrap();

        let latest = store.latest_links("test.com").await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].crawl_time, NOT_YET_CRAWLED);
    }

    #[tokio::test]
    async fn new_domains_seeded_only_when_enabled() {
        let fr = FetchResults::robots_excluded(
            CrawlUrl::parse("http://test.com/").unwrap(),
            Utc::now(),
        );
        let url = CrawlUrl::parse("http://other.com/x").unwrap();

        let (_dir, store) = open_store();
        store.store_parsed_url(&url, &fr).await.unwrap();
        assert!(store.domain_info("other.com").await.unwrap().is_none());

        let dir = TempDir::new().unwrap();
        let config = CrawlerConfig {
            add_new_domains: true,
            ..CrawlerConfig::default()
        };
        let store = SledStore::open(dir.path(), &config).unwrap();
        store.store_parsed_url(&url, &fr).await.unwrap();
        assert!(store.domain_info("other.com").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn fetch_results_become_the_latest_row() {
        let (_dir, store) = open_store();
        let mut url = CrawlUrl::parse("http://test.com/a.html").unwrap();
        store.insert_link(&url, true).await.unwrap();

        url.last_crawled = Utc::now();
        let fr = FetchResults {
            url: url.clone(),
            response: Some(PageResponse {
                status: 200,
                content_type: Some("text/html".to_string()),
                body: bytes::Bytes::new(),
                truncated: false,
            }),
            fetch_error: None,
            fetch_time: url.last_crawled,
            excluded_by_robots: false,
        };
        store.store_url_fetch_results(&fr).await.unwrap();

        let latest = store.latest_links("test.com").await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].status, Some(200));
        // The one-shot boost is consumed by the newer row.
        assert!(!latest[0].getnow);
        assert!(latest[0].was_crawled());
    }

    #[tokio::test]
    async fn latest_links_orders_by_subdomain_path_scheme() {
        let (_dir, store) = open_store();
        for reference in [
            "http://test.com/b",
            "http://test.com/a",
            "http://www.test.com/a",
        ] {
            let url = CrawlUrl::parse(reference).unwrap();
            store.insert_link(&url, false).await.unwrap();
        }

        let latest = store.latest_links("test.com").await.unwrap();
        let keys: Vec<(String, String)> = latest
            .into_iter()
            .map(|r| (r.subdomain, r.path))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("".to_string(), "/a".to_string()),
                ("".to_string(), "/b".to_string()),
                ("www".to_string(), "/a".to_string()),
            ]
        );
    }
}
