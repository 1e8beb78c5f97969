//! Shared HTTP transport: one connection pool for every fetcher, with body
//! size caps and refusal of private-address targets.

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use bytes::BytesMut;
use lru::LruCache;
use reqwest::Client;
use url::Url;

use crate::config::CrawlerConfig;
use crate::store::PageResponse;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(String),
    #[error("request timeout")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("failed to read response body: {0}")]
    Body(String),
    #[error("refusing to fetch private address target: {0}")]
    PrivateTarget(String),
    #[error("failed to resolve host: {0}")]
    Resolve(String),
    #[error("scheme not in accept_protocols: {0}")]
    SchemeNotAllowed(String),
}

impl FetchError {
    fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return FetchError::Timeout;
        }
        if error.is_connect() {
            return FetchError::Connect(error.to_string());
        }
        FetchError::Network(error.to_string())
    }
}

/// Thread-safe HTTP client shared by all fetchers for the lifetime of the
/// fetch manager.
pub struct HttpClient {
    client: Client,
    accept_header: String,
    max_content_size: usize,
    blacklist_private_ips: bool,
    /// Host -> "resolves to a private address" verdicts, so repeated links
    /// into one host cost one resolution.
    dns_verdicts: Mutex<LruCache<String, bool>>,
}

impl HttpClient {
    pub fn new(config: &CrawlerConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.http_timeout)
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| FetchError::ClientBuild(e.to_string()))?;

        let cache_size =
            NonZeroUsize::new(config.max_dns_cache_entries.max(1)).expect("max(1) is non-zero");

        Ok(Self {
            client,
            accept_header: config.accept_formats.join(", "),
            max_content_size: config.max_http_content_size_bytes,
            blacklist_private_ips: config.blacklist_private_ips,
            dns_verdicts: Mutex::new(LruCache::new(cache_size)),
        })
    }

    /// GET a URL and buffer its body, stopping at the configured size cap.
    pub async fn fetch(&self, url: &Url) -> Result<PageResponse, FetchError> {
        if self.blacklist_private_ips {
            self.check_target(url).await?;
        }

        let mut response = self
            .client
            .get(url.as_str())
            .header("Accept", &self.accept_header)
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string());

        let mut body = BytesMut::new();
        let mut truncated = false;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| FetchError::Body(e.to_string()))?
        {
            let room = self.max_content_size - body.len();
            if chunk.len() >= room {
                body.extend_from_slice(&chunk[..room]);
                truncated = true;
                break;
            }
            body.extend_from_slice(&chunk);
        }

        Ok(PageResponse {
            status,
            content_type,
            body: body.freeze(),
            truncated,
        })
    }

    /// Fetch a plain-text resource (robots.txt). Returns None for non-200
    /// statuses; callers treat that as "no rules".
    pub async fn fetch_text(&self, url: &Url) -> Result<Option<String>, FetchError> {
        let page = self.fetch(url).await?;
        if page.status != 200 {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&page.body).into_owned()))
    }

    /// Refuse targets that are (or resolve to) loopback, RFC1918, or
    /// link-local addresses.
    async fn check_target(&self, url: &Url) -> Result<(), FetchError> {
        let host = url
            .host_str()
            .ok_or_else(|| FetchError::Resolve(url.as_str().to_string()))?;

        if let Ok(ip) = host.parse::<IpAddr>() {
            if is_private_ip(ip) {
                return Err(FetchError::PrivateTarget(host.to_string()));
            }
            return Ok(());
        }

        if let Some(private) = self.dns_verdicts.lock().expect("dns cache lock").get(host) {
            if *private {
                return Err(FetchError::PrivateTarget(host.to_string()));
            }
            return Ok(());
        }

        let port = url.port_or_known_default().unwrap_or(80);
        let addrs: Vec<_> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| FetchError::Resolve(format!("{host}: {e}")))?
            .collect();

        let private = addrs.iter().any(|addr| is_private_ip(addr.ip()));
        self.dns_verdicts
            .lock()
            .expect("dns cache lock")
            .put(host.to_string(), private);

        if private {
            return Err(FetchError::PrivateTarget(host.to_string()));
        }
        Ok(())
    }
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                || (seg[0] & 0xfe00) == 0xfc00
                || (seg[0] & 0xffc0) == 0xfe80
        }
    }
}
