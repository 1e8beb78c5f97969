//! Outlink extraction from HTML bodies, plus meta-robots hints.

use scraper::{Html, Selector};
use url::Url;

/// Tags inspected for `href` attributes, before `ignore_tags` is applied.
const DEFAULT_TAGS: &[&str] = &[
    "a", "area", "form", "frame", "iframe", "script", "link", "img",
];

/// The compiled set of start tags whose `href` attributes yield outlinks.
#[derive(Debug, Clone)]
pub struct TagSet {
    selector: Option<Selector>,
}

impl TagSet {
    pub fn from_ignore_list(ignore_tags: &[String]) -> Self {
        let parts: Vec<String> = DEFAULT_TAGS
            .iter()
            .filter(|tag| !ignore_tags.iter().any(|ig| ig.eq_ignore_ascii_case(tag)))
            .map(|tag| format!("{tag}[href]"))
            .collect();

        let selector = if parts.is_empty() {
            None
        } else {
            Selector::parse(&parts.join(", ")).ok()
        };
        Self { selector }
    }
}

/// What one page yielded: resolved outbound URLs and any meta-robots hints.
#[derive(Debug, Default)]
pub struct PageLinks {
    pub links: Vec<Url>,
    pub noindex: bool,
    pub nofollow: bool,
}

/// Tokenize `body` leniently and collect outlinks from the configured tag
/// set. References are resolved against `base`, so relative links and links
/// with no scheme or host inherit from the referring URL. Unparseable
/// references are discarded.
pub fn extract_links(body: &str, base: &Url, tags: &TagSet) -> PageLinks {
    let document = Html::parse_document(body);
    let mut result = PageLinks::default();

    let meta_selector = Selector::parse("meta[name][content]").expect("static selector");
    for meta in document.select(&meta_selector) {
        let el = meta.value();
        if el
            .attr("name")
            .map(|n| n.eq_ignore_ascii_case("robots"))
            .unwrap_or(false)
        {
            let content = el.attr("content").unwrap_or("").to_ascii_lowercase();
            result.noindex |= content.contains("noindex");
            result.nofollow |= content.contains("nofollow");
        }
    }

    let Some(selector) = &tags.selector else {
        return result;
    };

    for element in document.select(selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty() {
            continue;
        }
        if let Ok(url) = base.join(href) {
            result.links.push(url);
        }
    }

    result
}
