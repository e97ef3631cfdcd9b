//! Storage root layout
//!
//! Everything the harness persists lives below one directory, standing in
//! for the storage of a single origin. Usage estimates walk this tree.

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Marker file recording that persistent storage was granted
const PERSISTED_MARKER: &str = ".persisted";

/// File extension of in-flight writes
pub const TEMP_EXT: &str = "tmp";

/// Root directory of all harness storage
#[derive(Debug, Clone)]
pub struct StorageRoot {
    path: PathBuf,
}

impl StorageRoot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Root directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the records of a named store
    pub fn records_dir(&self, name: &str) -> PathBuf {
        self.path.join("records").join(sanitize(name))
    }

    /// Directory holding the entries of a named cache
    pub fn cache_dir(&self, name: &str) -> PathBuf {
        self.path.join("caches").join(sanitize(name))
    }

    /// Path of the persistence marker
    pub fn persisted_marker(&self) -> PathBuf {
        self.path.join(PERSISTED_MARKER)
    }

    /// Total bytes of all regular files below the root.
    ///
    /// A missing root counts as empty.
    pub async fn usage(&self) -> io::Result<u64> {
        let mut total = 0u64;
        let mut pending = vec![self.path.clone()];

        while let Some(dir) = pending.pop() {
            let mut read_dir = match tokio::fs::read_dir(&dir).await {
                Ok(rd) => rd,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            while let Some(entry) = read_dir.next_entry().await? {
                // Temp files come and go while writers rename them
                let metadata = match entry.metadata().await {
                    Ok(metadata) => metadata,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e),
                };
                if metadata.is_dir() {
                    pending.push(entry.path());
                } else if metadata.is_file() {
                    total += metadata.len();
                }
            }
        }

        debug!(root = %self.path.display(), bytes = total, "Measured storage root usage");
        Ok(total)
    }
}

/// Remove temp files left in `dir` by interrupted writes.
///
/// Only safe while nothing is writing below `dir`; returns how many were
/// removed. A missing directory has none.
pub async fn remove_temp_files(dir: &Path) -> io::Result<usize> {
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(TEMP_EXT) {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Removed stale temp file");
                removed += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}

/// Keep store names usable as a single path component
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect()
}
