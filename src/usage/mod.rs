//! Synthetic usage accounting
//!
//! Fills a record store with random data up to a byte target, measures it,
//! and clears it again.

pub mod controller;
pub mod random;

pub use controller::{PopulateReport, RemoveReport, UsageController, UsageError};

/// One MiB in bytes
pub const MIB: u64 = 1024 * 1024;

/// Size of every appended record: 10 MiB
pub const CHUNK_SIZE: usize = 10 * 1024 * 1024;

/// Default byte target: 12 GiB
pub const DEFAULT_TARGET: u64 = 12 * 1024 * MIB;

/// Name of the record store holding filler data
pub const STORE_NAME: &str = "rubbish";

/// Bytes rounded to whole MiB, for progress lines
pub fn to_mib(bytes: u64) -> u64 {
    (bytes + MIB / 2) / MIB
}
