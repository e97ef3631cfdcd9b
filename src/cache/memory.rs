//! Memory Cache
//!
//! Ephemeral caches backed by Moka. No capacity and no TTL are configured,
//! so nothing is ever evicted; contents last as long as the process.

use std::sync::Arc;

use async_trait::async_trait;
use moka::sync::Cache as MokaCache;
use tracing::{debug, trace};

use super::{ensure_get, Cache, CacheError, CacheMatch, CacheStorage};
use crate::net::{Request, Response};

/// Named in-memory caches
pub struct MemoryCacheStorage {
    caches: MokaCache<String, Arc<MemoryCache>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self {
            caches: MokaCache::builder().name("cache_storage").build(),
        }
    }
}

impl Default for MemoryCacheStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, CacheError> {
        let cache: Arc<dyn Cache> = self
            .caches
            .get_with(name.to_string(), || Arc::new(MemoryCache::new(name)));
        Ok(cache)
    }
}

/// A named in-memory cache keyed by method and URL
pub struct MemoryCache {
    entries: MokaCache<String, Response>,
}

impl MemoryCache {
    fn new(name: &str) -> Self {
        debug!(name = name, "Created memory cache");
        Self {
            entries: MokaCache::builder().name(name).build(),
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn put(&self, request: &Request, response: &Response) -> Result<(), CacheError> {
        ensure_get(request)?;
        self.entries.insert(request.cache_key(), response.clone());
        debug!(url = %request.url, status = response.status, "Stored response in memory cache");
        Ok(())
    }

    async fn match_request(&self, request: &Request) -> Result<CacheMatch, CacheError> {
        if !request.is_get() {
            return Ok(CacheMatch::NotFound);
        }
        match self.entries.get(&request.cache_key()) {
            Some(response) => {
                trace!(url = %request.url, "Memory cache HIT");
                Ok(CacheMatch::Found(response))
            }
            None => {
                trace!(url = %request.url, "Memory cache MISS");
                Ok(CacheMatch::NotFound)
            }
        }
    }

    async fn put_all(&self, entries: Vec<(Request, Response)>) -> Result<(), CacheError> {
        // Validate first so a bad entry stores nothing
        for (request, _) in &entries {
            ensure_get(request)?;
        }
        for (request, response) in entries {
            self.entries.insert(request.cache_key(), response);
        }
        Ok(())
    }
}
