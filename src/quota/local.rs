//! Local quota service
//!
//! Usage is the size of the storage root. The quota is either configured
//! or whatever the root already uses plus the free space of its filesystem.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::sys::statvfs::statvfs;
use tracing::{debug, info};

use super::{QuotaError, QuotaEstimate, QuotaService};
use crate::storage_root::StorageRoot;

pub struct LocalQuota {
    root: StorageRoot,
    /// Fixed quota; `None` derives it from free space
    quota_bytes: Option<u64>,
}

impl LocalQuota {
    pub fn new(root: StorageRoot, quota_bytes: Option<u64>) -> Self {
        Self { root, quota_bytes }
    }

    /// Bytes available to unprivileged writers on the root's filesystem
    fn free_space(&self) -> Result<u64, QuotaError> {
        let path = existing_ancestor(self.root.path());
        let stats = statvfs(path.as_path())?;
        #[allow(clippy::unnecessary_cast)]
        let free = stats.blocks_available() as u64 * stats.fragment_size() as u64;
        Ok(free)
    }
}

/// The root may not exist yet; measure the closest directory that does
fn existing_ancestor(path: &Path) -> PathBuf {
    path.ancestors()
        .find(|p| p.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"))
}

#[async_trait]
impl QuotaService for LocalQuota {
    async fn estimate(&self) -> Result<QuotaEstimate, QuotaError> {
        let usage_bytes = self.root.usage().await?;
        let quota_bytes = match self.quota_bytes {
            Some(quota) => quota,
            None => usage_bytes + self.free_space()?,
        };
        debug!(quota = quota_bytes, usage = usage_bytes, "Quota estimate");
        Ok(QuotaEstimate {
            quota_bytes,
            usage_bytes,
        })
    }

    async fn persist(&self) -> Result<bool, QuotaError> {
        tokio::fs::create_dir_all(self.root.path()).await?;
        tokio::fs::write(self.root.persisted_marker(), b"").await?;
        info!(root = %self.root.path().display(), "Persistent storage granted");
        Ok(true)
    }

    async fn persisted(&self) -> Result<bool, QuotaError> {
        Ok(tokio::fs::try_exists(self.root.persisted_marker()).await?)
    }
}
