use crate::api::{Image, ScanState};
use std::fmt::Debug;
use url::ParseError;

mod breaker;
mod http;
mod mock;

pub use breaker::{BreakerError, CircuitBreaker};
pub use http::HttpBackend;
pub use mock::MockBackend;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Failed to build URL: {0}")]
    Url(#[from] ParseError),
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Unexpected response status: {0}")]
    Status(u16),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// The scanning backend, which owns the actual scan results.
#[async_trait::async_trait]
pub trait ScanBackend: Debug + Send + Sync {
    /// Ask the backend to scan an image.
    async fn submit_scan(&self, image: &Image) -> Result<(), BackendError>;

    /// The state of a scan, `None` if the backend never heard of it.
    async fn fetch_scan_status(&self, search_key: &str) -> Result<Option<ScanState>, BackendError>;

    /// Search keys of every scan the backend knows about.
    async fn list_all_known_scans(&self) -> Result<Vec<String>, BackendError>;
}
