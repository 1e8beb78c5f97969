//! Link store contract: the persistent tables every crawler process shares,
//! expressed as capability traits so backends stay swappable.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::network::FetchError;
use crate::url::{CrawlUrl, NOT_YET_CRAWLED};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("corrupt store record: {0}")]
    Corrupt(String),
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

/// A buffered HTTP response. The body has already been read (and possibly
/// truncated at the configured cap), so handlers can consume it repeatedly.
#[derive(Debug, Clone)]
pub struct PageResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
    /// True when the body read stopped at `max_http_content_size_bytes`.
    pub truncated: bool,
}

impl PageResponse {
    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.to_ascii_lowercase().starts_with("text/html"))
            .unwrap_or(false)
    }
}

/// Everything known about one fetch attempt. Handlers receive this; the
/// store persists it as a new link row.
#[derive(Debug)]
pub struct FetchResults {
    pub url: CrawlUrl,
    /// None when the fetch errored or robots excluded the link.
    pub response: Option<PageResponse>,
    pub fetch_error: Option<FetchError>,
    pub fetch_time: DateTime<Utc>,
    pub excluded_by_robots: bool,
}

impl FetchResults {
    pub fn robots_excluded(url: CrawlUrl, fetch_time: DateTime<Utc>) -> Self {
        Self {
            url,
            response: None,
            fetch_error: None,
            fetch_time,
            excluded_by_robots: true,
        }
    }

    pub fn errored(url: CrawlUrl, fetch_time: DateTime<Utc>, error: FetchError) -> Self {
        Self {
            url,
            response: None,
            fetch_error: Some(error),
            fetch_time,
            excluded_by_robots: false,
        }
    }
}

/// One row of the `links` table. Rows are append-only; the newest row per
/// `(domain, subdomain, path, scheme)` key carries the current status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub domain: String,
    pub subdomain: String,
    /// Path plus query string.
    pub path: String,
    pub scheme: String,
    pub crawl_time: DateTime<Utc>,
    /// HTTP status of the fetch; None for parsed-but-never-fetched rows.
    pub status: Option<u16>,
    pub error: Option<String>,
    /// One-shot boost: force this link into the next segment.
    pub getnow: bool,
    pub robots_excluded: bool,
}

impl LinkRecord {
    pub fn to_url(&self) -> Result<CrawlUrl, url::ParseError> {
        CrawlUrl::from_parts(
            &self.domain,
            &self.subdomain,
            &self.path,
            &self.scheme,
            self.crawl_time,
        )
    }

    pub fn was_crawled(&self) -> bool {
        self.crawl_time != NOT_YET_CRAWLED
    }
}

/// Ownership and bookkeeping for one registered domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainInfo {
    pub domain: String,
    /// Non-null while a fetcher owns this domain. At most one at a time.
    pub claim_token: Option<Uuid>,
    pub claim_time: Option<DateTime<Utc>>,
    pub priority: i32,
    pub dispatched: bool,
    /// Excluded domains are skipped by dispatcher and fetchers alike.
    pub excluded: bool,
    pub tot_links: u64,
    pub uncrawled_links: u64,
    pub queued_links: u64,
}

impl DomainInfo {
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            claim_token: None,
            claim_time: None,
            priority: 0,
            dispatched: false,
            excluded: false,
            tot_links: 0,
            uncrawled_links: 0,
            queued_links: 0,
        }
    }
}

/// Best-effort per-domain counters refreshed on each dispatch cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainStats {
    pub tot_links: u64,
    pub uncrawled_links: u64,
    pub queued_links: u64,
}

/// Finite, ordered sequence of segment links for one claimed domain.
/// Implementable over a streamed query, an iterator, or a materialized
/// slice; callers only ever pull the next entry.
pub struct SegmentCursor {
    inner: Box<dyn Iterator<Item = CrawlUrl> + Send>,
}

impl SegmentCursor {
    pub fn from_vec(urls: Vec<CrawlUrl>) -> Self {
        Self {
            inner: Box::new(urls.into_iter()),
        }
    }

    pub fn next(&mut self) -> Option<CrawlUrl> {
        self.inner.next()
    }
}

/// The store operations fetchers consume. Implementations must make
/// `claim_new_host` linearizable across every fetcher sharing the store.
#[async_trait]
pub trait LinkStore: Send + Sync {
    /// Atomically claim one dispatched, unclaimed, non-excluded domain.
    /// Returns None when no domain is available.
    async fn claim_new_host(&self) -> Result<Option<String>, StoreError>;

    /// Release a claim and clear the dispatched flag. Idempotent.
    async fn unclaim_host(&self, host: &str) -> Result<(), StoreError>;

    /// Clear every claim token. Startup recovery after a crash.
    async fn unclaim_all(&self) -> Result<(), StoreError>;

    /// The claimed domain's current segment, in dispatch order.
    async fn links_for_host(&self, host: &str) -> Result<SegmentCursor, StoreError>;

    /// Append a link row recording this fetch attempt.
    async fn store_url_fetch_results(&self, fr: &FetchResults) -> Result<(), StoreError>;

    /// Record a parsed outlink as not-yet-crawled, unless already known.
    /// Best-effort dedup; exactly-once is not required.
    async fn store_parsed_url(&self, url: &CrawlUrl, fr: &FetchResults) -> Result<(), StoreError>;

    /// Liveness probe.
    async fn keep_alive(&self) -> Result<(), StoreError>;
}

/// Dispatcher-side operations layered on the same tables.
#[async_trait]
pub trait DispatchStore: LinkStore {
    /// Ensure a `domain_info` row exists for this domain.
    async fn add_domain(&self, domain: &str) -> Result<(), StoreError>;

    /// Seed one link (and its domain) into the store.
    async fn insert_link(&self, url: &CrawlUrl, getnow: bool) -> Result<(), StoreError>;

    async fn domain_info(&self, domain: &str) -> Result<Option<DomainInfo>, StoreError>;

    /// Domains eligible for planning: not dispatched, not excluded.
    async fn undispatched_domains(&self) -> Result<Vec<DomainInfo>, StoreError>;

    /// The newest row per logical URL for one domain, ordered by
    /// `(subdomain, path, scheme)`.
    async fn latest_links(&self, domain: &str) -> Result<Vec<LinkRecord>, StoreError>;

    /// Atomically write the planned segment, mark the domain dispatched,
    /// and refresh its statistics.
    async fn write_segment(
        &self,
        domain: &str,
        links: &[CrawlUrl],
        stats: DomainStats,
    ) -> Result<(), StoreError>;

    /// Refresh statistics without dispatching (empty-segment path).
    async fn update_domain_stats(&self, domain: &str, stats: DomainStats)
        -> Result<(), StoreError>;
}
