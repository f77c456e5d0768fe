//! Configuration for the index-sync engine.
//!
//! # Example
//!
//! ```
//! use index_sync::IndexSyncConfig;
//!
//! // Minimal config (uses defaults)
//! let config = IndexSyncConfig::default();
//! assert_eq!(config.bulk_size, 500);
//!
//! // Full config
//! let config = IndexSyncConfig {
//!     backend_url: Some("http://localhost:9200".into()),
//!     bulk_size: 1000,
//!     scroll_page_size: 2000,
//!     ..Default::default()
//! };
//! ```

use serde::Deserialize;

/// Configuration for the index-sync engine.
///
/// All fields have sensible defaults. At minimum, configure `backend_url`
/// for production use; without it only the in-memory backend is available.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexSyncConfig {
    /// Search backend base URL (e.g., "http://localhost:9200")
    #[serde(default)]
    pub backend_url: Option<String>,

    /// Rows per bulk write during propagation and ingestion
    #[serde(default = "default_bulk_size")]
    pub bulk_size: usize,

    /// Page size for scroll-based full iteration
    #[serde(default = "default_scroll_page_size")]
    pub scroll_page_size: usize,

    /// Scroll cursor keep-alive in seconds
    #[serde(default = "default_scroll_keep_alive_secs")]
    pub scroll_keep_alive_secs: u64,

    /// Crawler backoff bounds in milliseconds
    #[serde(default = "default_crawl_initial_delay_ms")]
    pub crawl_initial_delay_ms: u64,
    #[serde(default = "default_crawl_max_delay_ms")]
    pub crawl_max_delay_ms: u64,

    /// Page size when pulling rows from an external datasource
    #[serde(default = "default_ingest_page_size")]
    pub ingest_page_size: usize,
}

fn default_bulk_size() -> usize { 500 }
fn default_scroll_page_size() -> usize { 1000 }
fn default_scroll_keep_alive_secs() -> u64 { 60 }
fn default_crawl_initial_delay_ms() -> u64 { 1 }
fn default_crawl_max_delay_ms() -> u64 { 1000 }
fn default_ingest_page_size() -> usize { 500 }

impl Default for IndexSyncConfig {
    fn default() -> Self {
        Self {
            backend_url: None,
            bulk_size: default_bulk_size(),
            scroll_page_size: default_scroll_page_size(),
            scroll_keep_alive_secs: default_scroll_keep_alive_secs(),
            crawl_initial_delay_ms: default_crawl_initial_delay_ms(),
            crawl_max_delay_ms: default_crawl_max_delay_ms(),
            ingest_page_size: default_ingest_page_size(),
        }
    }
}
