//! Fetcher workers and their supervisor.
//!
//! Each worker owns at most one claimed domain at a time and walks that
//! domain's segment in order, honoring robots rules and the politeness
//! delay. The manager owns the shared HTTP transport and coordinates
//! cooperative shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::CrawlerConfig;
use crate::extract::{extract_links, TagSet};
use crate::handler::Handler;
use crate::network::{FetchError, HttpClient};
use crate::robots::HostRobots;
use crate::store::{FetchResults, LinkStore, StoreError};
use crate::url::{purge_session_ids, CrawlUrl, LinkFilters};

/// How long an idle fetcher waits before polling for a claimable domain.
const CLAIM_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Spacing of store liveness probes while the pool is running.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Supervisor for the fetcher pool. `start` recovers stale claims and spawns
/// `num_simultaneous_fetchers` workers; `stop` returns only after every
/// worker has released its claim and exited.
pub struct FetchManager {
    shared: Arc<FetcherShared>,
    cancel: CancellationToken,
    workers: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

struct FetcherShared {
    config: CrawlerConfig,
    store: Arc<dyn LinkStore>,
    handler: Arc<dyn Handler>,
    http: HttpClient,
    tags: TagSet,
    filters: LinkFilters,
}

impl FetchManager {
    pub fn new(
        config: CrawlerConfig,
        store: Arc<dyn LinkStore>,
        handler: Arc<dyn Handler>,
    ) -> Result<Self, FetchError> {
        let http = HttpClient::new(&config)?;
        let tags = TagSet::from_ignore_list(&config.ignore_tags);
        let filters = config.link_filters();

        Ok(Self {
            shared: Arc::new(FetcherShared {
                config,
                store,
                handler,
                http,
                tags,
                filters,
            }),
            cancel: CancellationToken::new(),
            workers: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub async fn start(&self) -> Result<(), StoreError> {
        // A prior process may have crashed while holding claims.
        self.shared.store.unclaim_all().await?;

        let count = self.shared.config.num_simultaneous_fetchers;
        tracing::info!(fetchers = count, "starting fetcher pool");

        let mut workers = self.workers.lock().expect("worker list lock");
        for id in 0..count {
            let shared = Arc::clone(&self.shared);
            let cancel = self.cancel.clone();
            workers.push(tokio::spawn(run_fetcher(shared, cancel, id)));
        }

        let store = Arc::clone(&self.shared.store);
        let cancel = self.cancel.clone();
        workers.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(KEEP_ALIVE_INTERVAL) => {}
                }
                if let Err(e) = store.keep_alive().await {
                    tracing::warn!(error = %e, "store keep-alive probe failed");
                }
            }
        }));
        Ok(())
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let workers = std::mem::take(&mut *self.workers.lock().expect("worker list lock"));
        for worker in workers {
            let _ = worker.await;
        }
        tracing::info!("fetcher pool stopped");
    }
}

async fn run_fetcher(shared: Arc<FetcherShared>, cancel: CancellationToken, id: usize) {
    tracing::debug!(fetcher = id, "fetcher started");
    let mut current: Option<String> = None;

    loop {
        // Release the previous claim on every path through the loop,
        // including shutdown.
        if let Some(host) = current.take() {
            if let Err(e) = shared.store.unclaim_host(&host).await {
                tracing::error!(host = %host, error = %e, "failed to release claim");
            }
        }
        if cancel.is_cancelled() {
            break;
        }

        let host = match shared.store.claim_new_host().await {
            Ok(Some(host)) => host,
            Ok(None) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(CLAIM_POLL_INTERVAL) => {}
                }
                continue;
            }
            Err(e) => {
                tracing::error!(fetcher = id, error = %e, "claim attempt failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(CLAIM_POLL_INTERVAL) => {}
                }
                continue;
            }
        };
        current = Some(host.clone());

        let robots = HostRobots::fetch(&shared.http, &host, &shared.config.user_agent).await;
        let delay = robots.crawl_delay(
            shared.config.default_crawl_delay,
            shared.config.max_crawl_delay,
        );
        tracing::debug!(host = %host, delay_ms = delay.as_millis() as u64, "crawling host");

        let mut cursor = match shared.store.links_for_host(&host).await {
            Ok(cursor) => cursor,
            Err(e) => {
                tracing::error!(host = %host, error = %e, "could not read segment");
                continue;
            }
        };

        while let Some(link) = cursor.next() {
            if cancel.is_cancelled() {
                break;
            }
            shared.process_link(link, &robots, delay, &cancel).await;
        }
    }

    tracing::debug!(fetcher = id, "fetcher stopped");
}

impl FetcherShared {
    async fn process_link(
        &self,
        link: CrawlUrl,
        robots: &HostRobots,
        delay: Duration,
        cancel: &CancellationToken,
    ) {
        if !robots.allowed(link.url.as_str()) {
            // Recorded without sleeping: no crawl-delay gap after excluded
            // links.
            self.persist(&FetchResults::robots_excluded(link, Utc::now()))
                .await;
            return;
        }

        if !self.config.accepts_scheme(link.scheme()) {
            let error = FetchError::SchemeNotAllowed(link.scheme().to_string());
            self.persist(&FetchResults::errored(link, Utc::now(), error))
                .await;
            return;
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let fetch_time = Utc::now();
        let page = match self.http.fetch(&link.url).await {
            Ok(page) => page,
            Err(e) => {
                // Not retried this cycle; a later dispatch may re-queue it.
                tracing::debug!(url = %link, error = %e, "fetch error");
                self.persist(&FetchResults::errored(link, fetch_time, e))
                    .await;
                return;
            }
        };
        tracing::debug!(url = %link, status = page.status, bytes = page.body.len(), "fetched");

        let mut fr = FetchResults {
            url: link,
            response: None,
            fetch_error: None,
            fetch_time,
            excluded_by_robots: false,
        };

        let mut noindex = false;
        let content_type = page.content_type.clone().unwrap_or_default();
        if page.is_html() && self.config.accepts_content_type(&content_type) {
            let body = String::from_utf8_lossy(&page.body).into_owned();
            let extraction = extract_links(&body, &fr.url.url, &self.tags);
            noindex = self.config.honor_meta_noindex && extraction.noindex;
            let nofollow = self.config.honor_meta_nofollow && extraction.nofollow;

            fr.response = Some(page);
            if nofollow {
                tracing::debug!(url = %fr.url, "meta nofollow: dropping outlinks");
            } else {
                self.store_outlinks(extraction.links, &fr).await;
            }
        } else {
            fr.response = Some(page);
        }

        if noindex {
            tracing::debug!(url = %fr.url, "meta noindex: withholding from handler");
        } else {
            self.handler.handle_response(&fr);
        }
        self.persist(&fr).await;
    }

    async fn store_outlinks(&self, links: Vec<url::Url>, fr: &FetchResults) {
        let mut stored = 0;
        for mut url in links {
            if stored >= self.config.max_links_per_page {
                tracing::debug!(url = %fr.url, "max_links_per_page reached, discarding rest");
                break;
            }
            if url.host_str().is_none() || !self.config.accepts_scheme(url.scheme()) {
                continue;
            }
            if !self.filters.accepts(url.as_str()) {
                continue;
            }
            purge_session_ids(&mut url, &self.config.purge_sid_list);

            let outlink = CrawlUrl::new(url);
            match self.store.store_parsed_url(&outlink, fr).await {
                Ok(()) => stored += 1,
                Err(e) => {
                    tracing::warn!(url = %outlink, error = %e, "failed to store parsed link");
                }
            }
        }
    }

    async fn persist(&self, fr: &FetchResults) {
        if let Err(e) = self.store.store_url_fetch_results(fr).await {
            tracing::error!(url = %fr.url, error = %e, "failed to store fetch results");
        }
    }
}
