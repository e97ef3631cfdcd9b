//! Usage Controller
//!
//! Populate/measure/remove cycle against a record store. Each operation
//! opens the store by name, acts, and drops the handle.

use std::sync::Arc;

use tracing::{debug, error, info};

use super::random::random_fill;
use super::{to_mib, CHUNK_SIZE};
use crate::records::{NewRecord, RecordDatabase, RecordStore, StoreError};

/// Usage controller errors
#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    #[error("Target must be greater than zero")]
    InvalidTarget,

    #[error("Random source failed: {0}")]
    Random(#[from] rand::Error),

    #[error("Write rejected at {usage} bytes: {source}")]
    BackendWrite {
        /// Usage reached before the rejected append
        usage: u64,
        #[source]
        source: StoreError,
    },

    #[error("Record store error: {0}")]
    Backend(#[from] StoreError),
}

/// Outcome of a populate run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopulateReport {
    /// Usage before the first append
    pub initial_bytes: u64,
    /// Usage after the last append
    pub final_bytes: u64,
    /// Number of records appended
    pub records_added: u64,
}

/// Usage before and after a remove
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveReport {
    pub before_bytes: u64,
    pub after_bytes: u64,
}

/// Drives bulk record insertion and deletion
pub struct UsageController {
    /// Opens the record store for each operation
    database: Arc<dyn RecordDatabase>,
    /// Name of the record store
    store_name: String,
    /// Bytes per appended record
    chunk_size: usize,
}

impl UsageController {
    /// Create a controller for a named store with the default 10 MiB chunks
    pub fn new(database: Arc<dyn RecordDatabase>, store_name: impl Into<String>) -> Self {
        Self::with_chunk_size(database, store_name, CHUNK_SIZE)
    }

    /// Create a controller with a custom chunk size
    pub fn with_chunk_size(
        database: Arc<dyn RecordDatabase>,
        store_name: impl Into<String>,
        chunk_size: usize,
    ) -> Self {
        Self {
            database,
            store_name: store_name.into(),
            chunk_size,
        }
    }

    async fn open(&self) -> Result<Arc<dyn RecordStore>, StoreError> {
        self.database.open(&self.store_name).await
    }

    /// Sum of the lengths of all records
    pub async fn get_usage(&self) -> Result<u64, UsageError> {
        let store = self.open().await?;
        let lengths = store.lengths().await?;
        Ok(lengths.iter().sum())
    }

    /// Append random records until usage reaches `target_bytes`.
    ///
    /// Additive on top of whatever the store already holds. Stops at the
    /// first rejected append, leaving earlier records in place.
    pub async fn populate(&self, target_bytes: u64) -> Result<PopulateReport, UsageError> {
        if target_bytes == 0 {
            return Err(UsageError::InvalidTarget);
        }

        let initial_bytes = self.get_usage().await?;
        let mut usage = initial_bytes;
        let mut records_added = 0u64;
        debug!(
            "Usage at {}/{} MiB",
            to_mib(usage),
            to_mib(target_bytes)
        );

        let store = self.open().await?;
        while usage < target_bytes {
            let mut chunk = vec![0u8; self.chunk_size];
            random_fill(&mut chunk)?;
            let record = NewRecord::new(chunk);
            let length = record.length();

            if let Err(e) = store.insert(record).await {
                error!(
                    error = %e,
                    quota_exceeded = e.is_quota_exceeded(),
                    "Failed at {}/{} MiB",
                    to_mib(usage),
                    to_mib(target_bytes)
                );
                return Err(UsageError::BackendWrite { usage, source: e });
            }

            usage += length;
            records_added += 1;
            debug!(
                "Currently at {}/{} MiB",
                to_mib(usage),
                to_mib(target_bytes)
            );
        }

        info!(
            initial_mib = to_mib(initial_bytes),
            final_mib = to_mib(usage),
            records = records_added,
            "Populate complete"
        );

        Ok(PopulateReport {
            initial_bytes,
            final_bytes: usage,
            records_added,
        })
    }

    /// Clear the whole store.
    ///
    /// `target_bytes` is only the reference value for the progress lines.
    pub async fn remove(&self, target_bytes: u64) -> Result<RemoveReport, UsageError> {
        let before_bytes = self.get_usage().await?;
        debug!(
            "Usage at {}/{} MiB",
            to_mib(before_bytes),
            to_mib(target_bytes)
        );

        self.open().await?.clear().await?;

        let after_bytes = self.get_usage().await?;
        debug!(
            "Usage at {}/{} MiB",
            to_mib(after_bytes),
            to_mib(target_bytes)
        );

        Ok(RemoveReport {
            before_bytes,
            after_bytes,
        })
    }
}
