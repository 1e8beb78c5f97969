//! Crawler configuration: YAML file loading, defaults, and load-time validation.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::url::LinkFilters;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
}

/// Global crawler settings. Loaded once at startup, validated, and threaded
/// through component constructors as an immutable snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Auto-seed `domain_info` for domains discovered through outlinks.
    pub add_new_domains: bool,
    pub added_domains_cache_size: usize,
    pub max_dns_cache_entries: usize,
    pub user_agent: String,
    /// Sent as the Accept header and used to filter responses for parsing.
    pub accept_formats: Vec<String>,
    pub accept_protocols: Vec<String>,
    pub max_http_content_size_bytes: usize,
    /// Tags excluded from outlink extraction.
    pub ignore_tags: Vec<String>,
    pub max_links_per_page: usize,
    pub num_simultaneous_fetchers: usize,
    pub blacklist_private_ips: bool,
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,
    pub honor_meta_noindex: bool,
    pub honor_meta_nofollow: bool,
    pub include_link_patterns: Vec<String>,
    pub exclude_link_patterns: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub default_crawl_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_crawl_delay: Duration,
    /// Query parameter names stripped from parsed URLs before storage.
    pub purge_sid_list: Vec<String>,
    pub dispatcher: DispatcherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub num_links_per_segment: usize,
    /// Share (0-100) of non-getnow segment slots reserved for re-crawls.
    pub refresh_percentage: f64,
    pub num_concurrent_domains: usize,
    #[serde(with = "humantime_serde")]
    pub min_link_refresh_time: Duration,
    #[serde(with = "humantime_serde")]
    pub dispatch_interval: Duration,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            add_new_domains: false,
            added_domains_cache_size: 20_000,
            max_dns_cache_entries: 20_000,
            user_agent: "Crawlspace/0.3".to_string(),
            accept_formats: vec!["text/html".to_string(), "text/*".to_string()],
            accept_protocols: vec!["http".to_string(), "https".to_string()],
            max_http_content_size_bytes: 20 * 1024 * 1024,
            ignore_tags: vec![
                "script".to_string(),
                "img".to_string(),
                "link".to_string(),
            ],
            max_links_per_page: 1000,
            num_simultaneous_fetchers: 10,
            blacklist_private_ips: true,
            http_timeout: Duration::from_secs(30),
            honor_meta_noindex: true,
            honor_meta_nofollow: false,
            include_link_patterns: Vec::new(),
            exclude_link_patterns: Vec::new(),
            default_crawl_delay: Duration::from_secs(1),
            max_crawl_delay: Duration::from_secs(300),
            purge_sid_list: vec![
                "jsessionid".to_string(),
                "phpsessid".to_string(),
                "aspsessionid".to_string(),
            ],
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            num_links_per_segment: 500,
            refresh_percentage: 25.0,
            num_concurrent_domains: 1,
            min_link_refresh_time: Duration::ZERO,
            dispatch_interval: Duration::from_secs(10),
        }
    }
}

impl CrawlerConfig {
    /// Read and validate a YAML config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` when it exists, otherwise fall back to defaults. Missing
    /// config files are normal for dev setups; anything else is an error.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Check every invariant, collecting all violations so the operator sees
    /// the full list at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errs = Vec::new();
        let dis = &self.dispatcher;

        if !(0.0..=100.0).contains(&dis.refresh_percentage) {
            errs.push("dispatcher.refresh_percentage must be between 0 and 100".to_string());
        }
        if dis.num_links_per_segment < 1 {
            errs.push("dispatcher.num_links_per_segment must be at least 1".to_string());
        }
        if dis.num_concurrent_domains < 1 {
            errs.push("dispatcher.num_concurrent_domains must be at least 1".to_string());
        }
        if self.num_simultaneous_fetchers < 1 {
            errs.push("num_simultaneous_fetchers must be at least 1".to_string());
        }
        if self.default_crawl_delay > self.max_crawl_delay {
            errs.push("default_crawl_delay must not exceed max_crawl_delay".to_string());
        }
        if let Err(e) = LinkFilters::new(&self.include_link_patterns, &self.exclude_link_patterns) {
            errs.push(e.to_string());
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errs))
        }
    }

    /// Compiled include/exclude filters. Only valid after `validate`.
    pub fn link_filters(&self) -> LinkFilters {
        LinkFilters::new(&self.include_link_patterns, &self.exclude_link_patterns)
            .unwrap_or_default()
    }

    /// Whether a response content type satisfies `accept_formats`. Patterns
    /// ending in `/*` match the major type; anything else is a prefix match
    /// so parameters like `; charset=utf-8` are tolerated.
    pub fn accepts_content_type(&self, content_type: &str) -> bool {
        let ct = content_type.to_ascii_lowercase();
        self.accept_formats.iter().any(|fmt| {
            let fmt = fmt.to_ascii_lowercase();
            match fmt.strip_suffix("/*") {
                Some(major) => ct.starts_with(&format!("{major}/")),
                None => ct.starts_with(fmt.trim_end_matches(';')),
            }
        })
    }

    pub fn accepts_scheme(&self, scheme: &str) -> bool {
        self.accept_protocols.iter().any(|p| p == scheme)
    }
}
