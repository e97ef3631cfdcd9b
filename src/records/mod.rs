//! Record store
//!
//! Append/clear/enumerate storage for synthetic filler records.
//! Stores are opened by name on every operation; no handle outlives a call.

pub mod disk;
pub mod errors;
#[cfg(test)]
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

pub use disk::DiskDatabase;
pub use errors::StoreError;

/// A record about to be appended; the store assigns its id
#[derive(Debug, Clone)]
pub struct NewRecord {
    data: Vec<u8>,
}

impl NewRecord {
    /// Wrap a filled buffer
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Byte length of the payload
    pub fn length(&self) -> u64 {
        self.data.len() as u64
    }

    /// Payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// An open, named record store
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Append a record and return its assigned id
    async fn insert(&self, record: NewRecord) -> Result<u64, StoreError>;

    /// Delete every record
    async fn clear(&self) -> Result<(), StoreError>;

    /// Lengths of all records in ascending order.
    ///
    /// Must not load record payloads.
    async fn lengths(&self) -> Result<Vec<u64>, StoreError>;
}

/// Opens record stores by name
#[async_trait]
pub trait RecordDatabase: Send + Sync {
    async fn open(&self, name: &str) -> Result<Arc<dyn RecordStore>, StoreError>;
}
