//! Consumer interface for fetched content.

use crate::store::FetchResults;

/// Receives every fetch outcome a fetcher produces, synchronously. The
/// response body (when present) is already buffered, so implementations may
/// read it as often as they like.
pub trait Handler: Send + Sync {
    fn handle_response(&self, fr: &FetchResults);
}

/// Default handler for operating the crawler without a downstream consumer:
/// just logs what happened to each link.
pub struct LoggingHandler;

impl Handler for LoggingHandler {
    fn handle_response(&self, fr: &FetchResults) {
        match (&fr.response, &fr.fetch_error) {
            (Some(page), _) => {
                tracing::info!(
                    url = %fr.url,
                    status = page.status,
                    bytes = page.body.len(),
                    truncated = page.truncated,
                    "fetched"
                );
            }
            (None, Some(e)) => {
                tracing::info!(url = %fr.url, error = %e, "fetch failed");
            }
            (None, None) => {
                tracing::info!(
                    url = %fr.url,
                    excluded_by_robots = fr.excluded_by_robots,
                    "not fetched"
                );
            }
        }
    }
}
