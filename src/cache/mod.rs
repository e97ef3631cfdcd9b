//! Request cache
//!
//! Named caches of GET responses. Caches are opened by name on every use;
//! entries are only ever added or overwritten, never evicted.

pub mod disk;
pub mod errors;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::net::{Fetcher, Request, Response};

pub use disk::DiskCacheStorage;
pub use errors::CacheError;
pub use memory::MemoryCacheStorage;

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheMatch {
    Found(Response),
    NotFound,
}

/// A single named cache
#[async_trait]
pub trait Cache: Send + Sync {
    /// Store `response` for `request`, replacing any existing entry
    async fn put(&self, request: &Request, response: &Response) -> Result<(), CacheError>;

    /// Look up the stored response for `request`.
    ///
    /// Non-GET requests never match.
    async fn match_request(&self, request: &Request) -> Result<CacheMatch, CacheError>;

    /// Store several entries; nothing is stored if any write fails
    async fn put_all(&self, entries: Vec<(Request, Response)>) -> Result<(), CacheError>;

    /// Fetch every request and store all responses.
    ///
    /// All-or-nothing: a network failure or non-2xx status for any request
    /// leaves the cache untouched.
    async fn add_all(&self, requests: &[Request], fetcher: &dyn Fetcher) -> Result<(), CacheError> {
        let mut entries = Vec::with_capacity(requests.len());
        for request in requests {
            ensure_get(request)?;
            let response = fetcher.fetch(request).await?;
            if !response.is_ok() {
                return Err(CacheError::BadStatus {
                    url: request.url.to_string(),
                    status: response.status,
                });
            }
            debug!(url = %request.url, size = response.body.len(), "Fetched for cache");
            entries.push((request.clone(), response));
        }
        self.put_all(entries).await
    }
}

/// Opens caches by name
#[async_trait]
pub trait CacheStorage: Send + Sync {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, CacheError>;
}

/// Reject anything but GET
pub(crate) fn ensure_get(request: &Request) -> Result<(), CacheError> {
    if request.is_get() {
        Ok(())
    } else {
        Err(CacheError::MethodNotAllowed(request.method.to_string()))
    }
}
