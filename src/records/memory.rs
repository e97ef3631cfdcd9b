//! In-memory record store used by tests

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{NewRecord, RecordDatabase, RecordStore, StoreError};

/// A stored record
#[derive(Debug, Clone)]
pub struct Record {
    pub id: u64,
    pub length: u64,
    pub data: Vec<u8>,
}

/// Named in-memory stores; reopening a name yields the same contents
#[derive(Default)]
pub struct MemoryDatabase {
    stores: Mutex<HashMap<String, Arc<MemoryRecordStore>>>,
    capacity: Option<u64>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores opened from this database reject inserts past `capacity` bytes
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
            capacity: Some(capacity),
        }
    }

    /// Direct access to a store, for assertions
    pub fn store(&self, name: &str) -> Arc<MemoryRecordStore> {
        let mut stores = self.stores.lock().unwrap();
        Arc::clone(stores.entry(name.to_string()).or_insert_with(|| {
            Arc::new(MemoryRecordStore {
                records: Mutex::new(BTreeMap::new()),
                next_id: Mutex::new(1),
                capacity: self.capacity,
            })
        }))
    }
}

#[async_trait]
impl RecordDatabase for MemoryDatabase {
    async fn open(&self, name: &str) -> Result<Arc<dyn RecordStore>, StoreError> {
        Ok(self.store(name))
    }
}

pub struct MemoryRecordStore {
    records: Mutex<BTreeMap<u64, Record>>,
    next_id: Mutex<u64>,
    capacity: Option<u64>,
}

impl MemoryRecordStore {
    /// Snapshot of all records in id order
    pub fn records(&self) -> Vec<Record> {
        self.records.lock().unwrap().values().cloned().collect()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert(&self, record: NewRecord) -> Result<u64, StoreError> {
        let mut records = self.records.lock().unwrap();
        if let Some(capacity) = self.capacity {
            let used: u64 = records.values().map(|r| r.length).sum();
            let available = capacity.saturating_sub(used);
            if record.length() > available {
                return Err(StoreError::QuotaExceeded {
                    requested: record.length(),
                    available,
                });
            }
        }

        let mut next_id = self.next_id.lock().unwrap();
        let id = *next_id;
        *next_id += 1;
        records.insert(
            id,
            Record {
                id,
                length: record.length(),
                data: record.data().to_vec(),
            },
        );
        Ok(id)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.records.lock().unwrap().clear();
        Ok(())
    }

    async fn lengths(&self) -> Result<Vec<u64>, StoreError> {
        let mut lengths: Vec<u64> = self
            .records
            .lock()
            .unwrap()
            .values()
            .map(|r| r.length)
            .collect();
        lengths.sort_unstable();
        Ok(lengths)
    }
}
