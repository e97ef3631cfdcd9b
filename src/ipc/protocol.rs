//! IPC protocol definitions
//!
//! Newline-delimited JSON exchanged with an external UI over a Unix domain
//! socket. Every entry point of the harness has a command.

use serde::{Deserialize, Serialize};

use crate::quota::Permission;

/// Protocol version for future compatibility
pub const PROTOCOL_VERSION: u32 = 1;

/// Commands sent from the UI to the harness
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    /// Fill the record store up to a target
    #[serde(rename_all = "camelCase")]
    Populate {
        /// Target in MiB; the configured default when absent
        #[serde(default)]
        target_mib: Option<u64>,
    },
    /// Clear the record store
    #[serde(rename_all = "camelCase")]
    Remove {
        #[serde(default)]
        target_mib: Option<u64>,
    },
    /// Report current usage against a target
    #[serde(rename_all = "camelCase")]
    Usage {
        #[serde(default)]
        target_mib: Option<u64>,
    },
    /// Request persistent storage
    Persist,
    /// Query whether storage is persistent
    IsPersistent,
    /// Request notification permission
    Notification,
    /// Quota and usage of the storage root
    Estimate,
    /// Fetch a static resource through the interceptor
    #[serde(rename_all = "camelCase")]
    Fetch {
        /// Path relative to the origin
        path: String,
        /// HTTP method, GET when absent
        #[serde(default)]
        method: Option<String>,
    },
    /// Get harness status
    GetStatus,
}

/// Responses sent from the harness to the UI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Response {
    #[serde(rename_all = "camelCase")]
    Error { error: String },
    #[serde(rename_all = "camelCase")]
    Usage { usage_bytes: u64, target_bytes: u64 },
    #[serde(rename_all = "camelCase")]
    Populated {
        initial_bytes: u64,
        final_bytes: u64,
        records_added: u64,
    },
    #[serde(rename_all = "camelCase")]
    Removed { before_bytes: u64, after_bytes: u64 },
    #[serde(rename_all = "camelCase")]
    Persistence { persistent: bool },
    #[serde(rename_all = "camelCase")]
    Notification { permission: Permission },
    #[serde(rename_all = "camelCase")]
    Estimate { quota_bytes: u64, usage_bytes: u64 },
    /// An intercepted response; `body` is base64
    #[serde(rename_all = "camelCase")]
    Fetched {
        status: u16,
        headers: Vec<(String, String)>,
        body: String,
    },
    /// The request was not intercepted
    Passthrough,
    #[serde(rename_all = "camelCase")]
    Status {
        version: u32,
        healthy: bool,
        worker_state: String,
        clients: usize,
        usage_bytes: Option<u64>,
    },
}

/// Parse a JSON command from bytes
pub fn parse_command(data: &[u8]) -> Result<Command, serde_json::Error> {
    serde_json::from_slice(data)
}

/// Serialize a response to JSON bytes
pub fn serialize_response(response: &Response) -> Result<Vec<u8>, serde_json::Error> {
    let mut json = serde_json::to_vec(response)?;
    json.push(b'\n'); // Add newline delimiter
    Ok(json)
}
