//! Work planner: periodically selects a bounded segment of links for every
//! idle domain and marks the domain dispatched for fetchers to claim.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::DispatcherConfig;
use crate::store::{DispatchStore, DomainStats, LinkRecord, StoreError};
use crate::url::CrawlUrl;

pub struct Dispatcher {
    store: Arc<dyn DispatchStore>,
    config: DispatcherConfig,
    cancel: CancellationToken,
    handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn DispatchStore>, config: DispatcherConfig) -> Self {
        Self {
            store,
            config,
            cancel: CancellationToken::new(),
            handle: std::sync::Mutex::new(None),
        }
    }

    /// Spawn the dispatch loop. The first cycle runs immediately; later
    /// cycles are spaced by `dispatch_interval`.
    pub fn start(&self) {
        let store = Arc::clone(&self.store);
        let config = self.config.clone();
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            tracing::info!("dispatcher started");
            loop {
                match run_cycle(&store, &config).await {
                    Ok(count) => {
                        if count > 0 {
                            tracing::info!(domains = count, "dispatch cycle complete");
                        }
                    }
                    Err(e) => {
                        // Store outage: abort this cycle, retry at the next
                        // interval.
                        tracing::error!(error = %e, "dispatch cycle aborted");
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.dispatch_interval) => {}
                }
            }
            tracing::info!("dispatcher stopped");
        });

        *self.handle.lock().expect("dispatcher handle lock") = Some(handle);
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().expect("dispatcher handle lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// One planning pass over every idle domain. Exposed so tests and the
    /// CLI can run a deterministic single cycle.
    pub async fn cycle(&self) -> Result<usize, StoreError> {
        run_cycle(&self.store, &self.config).await
    }
}

async fn run_cycle(
    store: &Arc<dyn DispatchStore>,
    config: &DispatcherConfig,
) -> Result<usize, StoreError> {
    let domains = store.undispatched_domains().await?;
    let mut tasks = JoinSet::new();
    let mut dispatched = 0;

    for info in domains {
        while tasks.len() >= config.num_concurrent_domains {
            if let Some(result) = tasks.join_next().await {
                dispatched += count_dispatch(result);
            }
        }

        let store = Arc::clone(store);
        let config = config.clone();
        tasks.spawn(async move {
            let domain = info.domain;
            let planned = plan_domain(&*store, &config, &domain).await;
            (domain, planned)
        });
    }

    while let Some(result) = tasks.join_next().await {
        dispatched += count_dispatch(result);
    }

    Ok(dispatched)
}

fn count_dispatch(
    result: Result<(String, Result<bool, StoreError>), tokio::task::JoinError>,
) -> usize {
    match result {
        Ok((_, Ok(true))) => 1,
        Ok((_, Ok(false))) => 0,
        Ok((domain, Err(e))) => {
            // One bad domain never stops the cycle.
            tracing::warn!(domain = %domain, error = %e, "skipping domain this cycle");
            0
        }
        Err(e) => {
            tracing::warn!(error = %e, "domain planning task failed");
            0
        }
    }
}

/// Plan one domain: compute its segment and either dispatch it or, when the
/// segment is empty, leave it idle with refreshed statistics.
async fn plan_domain(
    store: &dyn DispatchStore,
    config: &DispatcherConfig,
    domain: &str,
) -> Result<bool, StoreError> {
    let records = store.latest_links(domain).await?;
    let (segment, stats) = select_segment(&records, config, Utc::now());

    if segment.is_empty() {
        store.update_domain_stats(domain, stats).await?;
        return Ok(false);
    }

    tracing::debug!(domain, links = segment.len(), "dispatching segment");
    store.write_segment(domain, &segment, stats).await?;
    Ok(true)
}

/// Segment selection. `records` holds the newest row per logical URL in
/// `(subdomain, path, scheme)` order; the result never exceeds
/// `num_links_per_segment`.
///
/// Fill order: every getnow link first, then previously-crawled links due
/// for a refresh (oldest first) up to the refresh share of the remaining
/// room, then never-crawled links. A shortfall in either pool widens the
/// other's quota.
pub fn select_segment(
    records: &[LinkRecord],
    config: &DispatcherConfig,
    now: DateTime<Utc>,
) -> (Vec<CrawlUrl>, DomainStats) {
    let cap = config.num_links_per_segment;
    let min_refresh =
        chrono::Duration::from_std(config.min_link_refresh_time).unwrap_or(chrono::Duration::zero());

    let mut getnow = Vec::new();
    let mut uncrawled = Vec::new();
    let mut refreshable = Vec::new();
    for record in records {
        if record.getnow {
            getnow.push(record);
        } else if !record.was_crawled() {
            uncrawled.push(record);
        } else if now - record.crawl_time >= min_refresh {
            refreshable.push(record);
        }
    }
    // Oldest first. The stable sort keeps key order among equal times.
    refreshable.sort_by_key(|r| r.crawl_time);

    getnow.truncate(cap);
    let remaining = cap - getnow.len();

    let share = remaining as f64 * config.refresh_percentage / 100.0;
    let mut refresh_take = (share.round() as usize).min(refreshable.len());
    let uncrawled_take = (remaining - refresh_take).min(uncrawled.len());
    // Unused uncrawled quota flows back into the refresh pool.
    refresh_take = (remaining - uncrawled_take).min(refreshable.len());

    let stats = DomainStats {
        tot_links: records.len() as u64,
        uncrawled_links: records.iter().filter(|r| !r.was_crawled()).count() as u64,
        queued_links: 0,
    };

    let mut segment = Vec::with_capacity(getnow.len() + refresh_take + uncrawled_take);
    for record in getnow
        .iter()
        .chain(refreshable.iter().take(refresh_take))
        .chain(uncrawled.iter().take(uncrawled_take))
    {
        match record.to_url() {
            Ok(url) => segment.push(url),
            Err(e) => {
                tracing::warn!(
                    domain = %record.domain,
                    path = %record.path,
                    error = %e,
                    "dropping unbuildable link row from segment"
                );
            }
        }
    }

    let stats = DomainStats {
        queued_links: segment.len() as u64,
        ..stats
    };
    (segment, stats)
}
