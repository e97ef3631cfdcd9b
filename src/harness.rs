//! Harness
//!
//! Application state shared by the CLI and the IPC server: the usage
//! controller, the interceptor, and the quota and permission services.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::cache::{CacheStorage, DiskCacheStorage, MemoryCacheStorage};
use crate::config::{CacheBackend, HarnessConfig};
use crate::interceptor::{CacheInterceptor, ClientRegistry};
use crate::net::{Fetcher, HttpFetcher};
use crate::quota::{
    ConfiguredPermission, LocalQuota, PermissionService, QuotaEstimate, QuotaService,
};
use crate::records::{DiskDatabase, RecordDatabase};
use crate::storage_root::StorageRoot;
use crate::usage::{to_mib, UsageController, STORE_NAME};

pub struct Harness {
    pub usage: UsageController,
    pub interceptor: CacheInterceptor,
    pub quota: Arc<dyn QuotaService>,
    pub permissions: Arc<dyn PermissionService>,
    /// Target used when a command does not name one
    pub default_target: u64,
}

impl Harness {
    /// Wire up local backends from configuration
    pub fn from_config(config: &HarnessConfig) -> Result<Self> {
        let root = StorageRoot::new(&config.storage_root);

        let database: Arc<dyn RecordDatabase> =
            Arc::new(DiskDatabase::new(root.clone(), config.quota_bytes));

        let caches: Arc<dyn CacheStorage> = match config.cache_backend {
            CacheBackend::Disk => Arc::new(DiskCacheStorage::new(root.clone())),
            CacheBackend::Memory => Arc::new(MemoryCacheStorage::new()),
        };
        let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new()?);

        let interceptor = CacheInterceptor::with_manifest(
            caches,
            fetcher,
            config.origin.clone(),
            Arc::new(ClientRegistry::new()),
            config.cache_name.clone(),
            config.manifest.clone(),
        );

        Ok(Self {
            usage: UsageController::new(database, STORE_NAME),
            interceptor,
            quota: Arc::new(LocalQuota::new(root, config.quota_bytes)),
            permissions: Arc::new(ConfiguredPermission::new(config.notification_permission)),
            default_target: config.target_bytes,
        })
    }

    /// Resolve an optional target in bytes
    pub fn target(&self, target_bytes: Option<u64>) -> u64 {
        target_bytes.unwrap_or(self.default_target)
    }
}

/// Remove temp files left by writes interrupted in an earlier run.
///
/// Call once at server startup, before anything can write; a one-shot
/// command must not, since a running server may own those files.
pub async fn cleanup_stale_writes(config: &HarnessConfig) {
    let root = StorageRoot::new(&config.storage_root);

    match DiskDatabase::new(root.clone(), None).cleanup(STORE_NAME).await {
        Ok(0) => {}
        Ok(removed) => info!(removed = removed, "Removed stale record writes"),
        Err(e) => warn!(error = %e, "Could not clean up record store"),
    }

    if config.cache_backend == CacheBackend::Disk {
        match DiskCacheStorage::new(root).cleanup(&config.cache_name).await {
            Ok(0) => {}
            Ok(removed) => info!(removed = removed, "Removed stale cache writes"),
            Err(e) => warn!(error = %e, "Could not clean up cache"),
        }
    }
}

/// Result of the startup checks; `None` where a step failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupReport {
    pub initial_estimate: Option<QuotaEstimate>,
    pub persistent: Option<bool>,
    pub final_estimate: Option<QuotaEstimate>,
}

/// Estimate, ask for persistence, estimate again.
///
/// Every step is guarded on its own; a failure is logged and the
/// remaining steps still run.
pub async fn run_startup_checks(quota: &dyn QuotaService) -> StartupReport {
    let initial_estimate = log_estimate(quota).await;

    let persistent = match quota.persisted().await {
        Ok(true) => {
            info!("Already persistent");
            Some(true)
        }
        Ok(false) => match quota.persist().await {
            Ok(true) => {
                info!("Persistent");
                Some(true)
            }
            Ok(false) => {
                info!("Temporary");
                Some(false)
            }
            Err(e) => {
                warn!(error = %e, "Persistence request failed");
                None
            }
        },
        Err(e) => {
            warn!(error = %e, "Persistence query failed");
            None
        }
    };

    let final_estimate = log_estimate(quota).await;

    StartupReport {
        initial_estimate,
        persistent,
        final_estimate,
    }
}

async fn log_estimate(quota: &dyn QuotaService) -> Option<QuotaEstimate> {
    match quota.estimate().await {
        Ok(estimate) => {
            info!(
                "Quota/Usage: {}/{} MiB",
                to_mib(estimate.quota_bytes),
                to_mib(estimate.usage_bytes)
            );
            Some(estimate)
        }
        Err(e) => {
            warn!(error = %e, "Quota estimate failed");
            None
        }
    }
}
