//! Shared test doubles: an in-memory link store and a recording handler.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crawlspace::store::{FetchResults, LinkStore, SegmentCursor, StoreError};
use crawlspace::url::CrawlUrl;
use crawlspace::Handler;

/// A fetch result row as the mock store remembers it.
#[derive(Debug, Clone)]
pub struct StoredResult {
    pub url: String,
    pub status: Option<u16>,
    pub error: Option<String>,
    pub robots_excluded: bool,
    pub fetch_time: DateTime<Utc>,
    pub body_len: usize,
    pub truncated: bool,
}

/// In-memory `LinkStore` for fetcher tests: hosts are handed out from a
/// queue, and everything written back is recorded for assertions.
#[derive(Default)]
pub struct MemStore {
    claim_queue: Mutex<VecDeque<String>>,
    segments: Mutex<HashMap<String, Vec<CrawlUrl>>>,
    /// Hosts still carrying a claim from a "crashed" process. While any
    /// exist, nothing is claimable; `unclaim_all` releases them.
    stale_claims: Mutex<Vec<String>>,

    pub claimed: Mutex<Vec<String>>,
    pub unclaimed: Mutex<Vec<String>>,
    pub unclaim_all_calls: Mutex<usize>,
    pub results: Mutex<Vec<StoredResult>>,
    pub parsed: Mutex<Vec<String>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a host with the segment a fetcher will receive for it.
    pub fn add_host(&self, host: &str, segment: Vec<CrawlUrl>) {
        self.claim_queue.lock().unwrap().push_back(host.to_string());
        self.segments
            .lock()
            .unwrap()
            .insert(host.to_string(), segment);
    }

    /// Simulate a stale claim left behind by a prior crash.
    pub fn leave_stale_claim(&self, host: &str) {
        self.stale_claims.lock().unwrap().push(host.to_string());
    }

    pub fn result_urls(&self) -> Vec<String> {
        self.results.lock().unwrap().iter().map(|r| r.url.clone()).collect()
    }

    pub fn parsed_urls(&self) -> Vec<String> {
        self.parsed.lock().unwrap().clone()
    }

    pub fn results_len(&self) -> usize {
        self.results.lock().unwrap().len()
    }
}

#[async_trait]
impl LinkStore for MemStore {
    async fn claim_new_host(&self) -> Result<Option<String>, StoreError> {
        if !self.stale_claims.lock().unwrap().is_empty() {
            return Ok(None);
        }
        let host = self.claim_queue.lock().unwrap().pop_front();
        if let Some(host) = &host {
            self.claimed.lock().unwrap().push(host.clone());
        }
        Ok(host)
    }

    async fn unclaim_host(&self, host: &str) -> Result<(), StoreError> {
        self.unclaimed.lock().unwrap().push(host.to_string());
        Ok(())
    }

    async fn unclaim_all(&self) -> Result<(), StoreError> {
        *self.unclaim_all_calls.lock().unwrap() += 1;
        self.stale_claims.lock().unwrap().clear();
        Ok(())
    }

    async fn links_for_host(&self, host: &str) -> Result<SegmentCursor, StoreError> {
        let segment = self
            .segments
            .lock()
            .unwrap()
            .get(host)
            .cloned()
            .unwrap_or_default();
        Ok(SegmentCursor::from_vec(segment))
    }

    async fn store_url_fetch_results(&self, fr: &FetchResults) -> Result<(), StoreError> {
        self.results.lock().unwrap().push(StoredResult {
            url: fr.url.to_string(),
            status: fr.response.as_ref().map(|r| r.status),
            error: fr.fetch_error.as_ref().map(|e| e.to_string()),
            robots_excluded: fr.excluded_by_robots,
            fetch_time: fr.fetch_time,
            body_len: fr.response.as_ref().map(|r| r.body.len()).unwrap_or(0),
            truncated: fr.response.as_ref().map(|r| r.truncated).unwrap_or(false),
        });
        Ok(())
    }

    async fn store_parsed_url(&self, url: &CrawlUrl, _fr: &FetchResults) -> Result<(), StoreError> {
        self.parsed.lock().unwrap().push(url.to_string());
        Ok(())
    }

    async fn keep_alive(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Handler double that remembers each delivery.
#[derive(Default)]
pub struct RecordingHandler {
    pub delivered: Mutex<Vec<(String, Option<u16>, usize)>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered_urls(&self) -> Vec<String> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|(url, _, _)| url.clone())
            .collect()
    }
}

impl Handler for RecordingHandler {
    fn handle_response(&self, fr: &FetchResults) {
        // Read the body twice to confirm it really is re-readable.
        let body = fr.response.as_ref().map(|r| r.body.clone());
        let len = body.as_ref().map(|b| b.len()).unwrap_or(0);
        let len_again = fr.response.as_ref().map(|r| r.body.len()).unwrap_or(0);
        assert_eq!(len, len_again);

        self.delivered.lock().unwrap().push((
            fr.url.to_string(),
            fr.response.as_ref().map(|r| r.status),
            len,
        ));
    }
}

/// Poll `predicate` until it holds or `timeout` elapses.
pub async fn wait_for<F>(timeout: std::time::Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    predicate()
}
