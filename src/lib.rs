pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod extract;
pub mod fetcher;
pub mod handler;
pub mod logging;
pub mod network;
pub mod robots;
pub mod sled_store;
pub mod store;
pub mod url;

// Re-export main types for library usage
pub use crate::config::{CrawlerConfig, DispatcherConfig};
pub use crate::dispatcher::Dispatcher;
pub use crate::fetcher::FetchManager;
pub use crate::handler::{Handler, LoggingHandler};
pub use crate::network::{FetchError, HttpClient};
pub use crate::robots::HostRobots;
pub use crate::sled_store::SledStore;
pub use crate::store::{
    DispatchStore, DomainInfo, DomainStats, FetchResults, LinkRecord, LinkStore, PageResponse,
    SegmentCursor, StoreError,
};
pub use crate::url::{CrawlUrl, LinkFilters, NOT_YET_CRAWLED};
