//! Record store errors

/// Failures reported by a record store backend
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Quota exceeded: {requested} bytes requested, {available} bytes available")]
    QuotaExceeded { requested: u64, available: u64 },

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt record store: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether the backend refused the write for lack of space
    pub fn is_quota_exceeded(&self) -> bool {
        match self {
            StoreError::QuotaExceeded { .. } => true,
            StoreError::Io(e) => e.raw_os_error() == Some(nix::libc::ENOSPC),
            StoreError::Corrupt(_) => false,
        }
    }
}
