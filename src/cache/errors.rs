//! Cache error types

use crate::net::NetworkError;

/// Cache storage failures
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Only GET requests can be cached, got {0}")]
    MethodNotAllowed(String),

    #[error("Refusing to cache {url}: status {status}")]
    BadStatus { url: String, status: u16 },

    #[error("Fetch failed while populating cache: {0}")]
    Network(#[from] NetworkError),

    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt cache metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("Corrupt cache entry: {0}")]
    Corrupt(String),
}
