//! Quota and permission services
//!
//! Local stand-ins for the platform's storage quota, persistence and
//! notification permission APIs.

pub mod local;
pub mod permission;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use local::LocalQuota;
pub use permission::{ConfiguredPermission, Permission, PermissionError, PermissionService};

/// Quota service errors
#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("Quota I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Filesystem statistics unavailable: {0}")]
    Statvfs(#[from] nix::Error),
}

/// Snapshot of quota and usage, fetched fresh on every call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaEstimate {
    pub quota_bytes: u64,
    pub usage_bytes: u64,
}

/// Storage quota and persistence
#[async_trait]
pub trait QuotaService: Send + Sync {
    /// Current quota and usage of the storage root
    async fn estimate(&self) -> Result<QuotaEstimate, QuotaError>;

    /// Ask for persistent storage; returns whether it was granted
    async fn persist(&self) -> Result<bool, QuotaError>;

    /// Whether persistent storage was already granted
    async fn persisted(&self) -> Result<bool, QuotaError>;
}
