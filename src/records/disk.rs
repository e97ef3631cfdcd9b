//! Disk Record Store
//!
//! One file per record under the storage root. A record's length is the
//! size of its file, so enumerating lengths only touches metadata.
//! Opening a store never modifies it; temp files from interrupted inserts
//! are only removed by [`DiskDatabase::cleanup`] at startup.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, trace};

use super::{NewRecord, RecordDatabase, RecordStore, StoreError};
use crate::storage_root::{remove_temp_files, StorageRoot, TEMP_EXT};

/// File extension of committed records
const RECORD_EXT: &str = "rec";

/// Opens disk-backed record stores below a storage root
pub struct DiskDatabase {
    /// Storage root shared with the cache
    root: StorageRoot,
    /// Byte limit over the whole storage root, if any
    quota_bytes: Option<u64>,
}

impl DiskDatabase {
    /// Create a database rooted at `root`
    ///
    /// # Arguments
    /// * `root` - Storage root directory
    /// * `quota_bytes` - Reject inserts that would push the root past this size
    pub fn new(root: StorageRoot, quota_bytes: Option<u64>) -> Self {
        Self { root, quota_bytes }
    }

    /// Remove temp files left by interrupted inserts into a named store.
    ///
    /// Only safe before the store is shared with any writer.
    pub async fn cleanup(&self, name: &str) -> Result<usize, StoreError> {
        Ok(remove_temp_files(&self.root.records_dir(name)).await?)
    }
}

#[async_trait]
impl RecordDatabase for DiskDatabase {
    async fn open(&self, name: &str) -> Result<Arc<dyn RecordStore>, StoreError> {
        let dir = self.root.records_dir(name);
        let store = DiskRecordStore::open(dir, self.root.clone(), self.quota_bytes).await?;
        Ok(Arc::new(store))
    }
}

/// A single named record store on disk
pub struct DiskRecordStore {
    /// Directory holding the record files
    dir: PathBuf,
    /// Storage root, measured for quota checks
    root: StorageRoot,
    /// Byte limit over the whole storage root, if any
    quota_bytes: Option<u64>,
    /// Next id to try; other handles may take ids first
    next_id: Arc<AtomicU64>,
}

impl DiskRecordStore {
    async fn open(
        dir: PathBuf,
        root: StorageRoot,
        quota_bytes: Option<u64>,
    ) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(&dir).await?;

        let mut max_id = 0u64;
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXT) {
                let id = record_id(&path).ok_or_else(|| {
                    StoreError::Corrupt(format!("unexpected record file {}", path.display()))
                })?;
                max_id = max_id.max(id);
            }
        }

        Ok(Self {
            dir,
            root,
            quota_bytes,
            next_id: Arc::new(AtomicU64::new(max_id + 1)),
        })
    }

    /// Record files currently in the store
    async fn record_paths(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut paths = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXT) {
                paths.push(path);
            }
        }
        Ok(paths)
    }
}

#[async_trait]
impl RecordStore for DiskRecordStore {
    async fn insert(&self, record: NewRecord) -> Result<u64, StoreError> {
        let length = record.length();

        if let Some(quota) = self.quota_bytes {
            let used = self.root.usage().await?;
            let available = quota.saturating_sub(used);
            if length > available {
                return Err(StoreError::QuotaExceeded {
                    requested: length,
                    available,
                });
            }
        }

        let dir = self.dir.clone();
        let next_id = Arc::clone(&self.next_id);

        let id = tokio::task::spawn_blocking(move || write_record(&dir, &next_id, record.data()))
            .await
            .map_err(|e| StoreError::Io(io::Error::new(io::ErrorKind::Other, e)))??;

        debug!(id = id, length = length, "Appended record");
        Ok(id)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let paths = self.record_paths().await?;
        let count = paths.len();
        for path in paths {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(dir = %self.dir.display(), count = count, "Cleared record store");
        Ok(())
    }

    async fn lengths(&self) -> Result<Vec<u64>, StoreError> {
        let mut lengths = Vec::new();
        for path in self.record_paths().await? {
            match tokio::fs::metadata(&path).await {
                Ok(metadata) => lengths.push(metadata.len()),
                // Removed between listing and stat
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        lengths.sort_unstable();
        Ok(lengths)
    }
}

/// File name for a record id; zero padded so names sort by id
fn record_file_name(id: u64) -> String {
    format!("{:020}.{}", id, RECORD_EXT)
}

/// Parse the id back out of a record file path
fn record_id(path: &Path) -> Option<u64> {
    path.file_stem()?.to_str()?.parse().ok()
}

/// Write a record atomically under the next free id.
///
/// An existing record is never overwritten: when another handle took the
/// id first, the next one is tried.
fn write_record(dir: &Path, next_id: &AtomicU64, data: &[u8]) -> io::Result<u64> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".record-")
        .suffix(&format!(".{}", TEMP_EXT))
        .tempfile_in(dir)?;
    tmp.write_all(data)?;

    loop {
        let id = next_id.fetch_add(1, Ordering::SeqCst);
        match tmp.persist_noclobber(dir.join(record_file_name(id))) {
            Ok(_) => return Ok(id),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                trace!(id = id, "Record id taken, trying the next one");
                tmp = e.file;
            }
            Err(e) => return Err(e.error),
        }
    }
}
