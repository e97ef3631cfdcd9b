//! Harness configuration
//!
//! Read once from the environment at startup.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use reqwest::Url;

use crate::interceptor::{CACHE_NAME, MANIFEST};
use crate::quota::Permission;
use crate::usage::{DEFAULT_TARGET, MIB};

/// Default origin static resources are fetched from
const DEFAULT_ORIGIN: &str = "http://127.0.0.1:8080/";

/// Default socket path for IPC communication
const DEFAULT_SOCKET_PATH: &str = "/tmp/storage-harness.sock";

/// Which cache backend serves intercepted requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    /// Entries persist under the storage root
    Disk,
    /// Entries last for the process lifetime
    Memory,
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Directory holding records, caches and the persistence marker
    pub storage_root: PathBuf,
    /// Base URL manifest paths are resolved against
    pub origin: Url,
    /// Default populate/remove/usage target in bytes
    pub target_bytes: u64,
    /// Fixed storage quota in bytes
    pub quota_bytes: Option<u64>,
    pub cache_backend: CacheBackend,
    pub cache_name: String,
    pub manifest: Vec<String>,
    /// Answer to notification permission requests
    pub notification_permission: Permission,
    pub socket_path: PathBuf,
}

impl HarnessConfig {
    /// Load configuration from `HARNESS_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let storage_root = match var("HARNESS_ROOT") {
            Some(path) => PathBuf::from(path),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("storage-harness"),
        };

        let origin_str = var("HARNESS_ORIGIN").unwrap_or_else(|| DEFAULT_ORIGIN.to_string());
        let origin = parse_origin(&origin_str)?;

        let target_bytes = match var("HARNESS_TARGET_MIB") {
            Some(value) => parse_mib("HARNESS_TARGET_MIB", &value)?,
            None => DEFAULT_TARGET,
        };
        if target_bytes == 0 {
            return Err(anyhow!("HARNESS_TARGET_MIB must be greater than zero"));
        }

        let quota_bytes = var("HARNESS_QUOTA_MIB")
            .map(|value| parse_mib("HARNESS_QUOTA_MIB", &value))
            .transpose()?;

        let cache_backend = match var("HARNESS_CACHE").as_deref().map(str::trim) {
            None | Some("disk") => CacheBackend::Disk,
            Some("memory") => CacheBackend::Memory,
            Some(other) => {
                return Err(anyhow!(
                    "HARNESS_CACHE must be 'disk' or 'memory', got '{}'",
                    other
                ))
            }
        };

        let cache_name = var("HARNESS_CACHE_NAME").unwrap_or_else(|| CACHE_NAME.to_string());

        let manifest = match var("HARNESS_MANIFEST") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect(),
            None => MANIFEST.iter().map(|p| p.to_string()).collect(),
        };

        let notification_permission = match var("HARNESS_NOTIFICATIONS") {
            Some(value) => value
                .parse()
                .context("Invalid HARNESS_NOTIFICATIONS")?,
            None => Permission::Default,
        };

        let socket_path = var("HARNESS_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH));

        Ok(Self {
            storage_root,
            origin,
            target_bytes,
            quota_bytes,
            cache_backend,
            cache_name,
            manifest,
            notification_permission,
            socket_path,
        })
    }
}

/// Parse a MiB count into bytes
pub fn parse_mib(name: &str, value: &str) -> Result<u64> {
    let mib: u64 = value
        .trim()
        .parse()
        .with_context(|| format!("{} must be a whole number of MiB, got '{}'", name, value))?;
    mib.checked_mul(MIB)
        .ok_or_else(|| anyhow!("{} is too large: {} MiB", name, mib))
}

/// Origins are directories: make sure relative joins stay below them
fn parse_origin(value: &str) -> Result<Url> {
    let mut origin = Url::parse(value.trim())
        .with_context(|| format!("Invalid HARNESS_ORIGIN '{}'", value))?;
    if origin.cannot_be_a_base() {
        return Err(anyhow!("HARNESS_ORIGIN '{}' cannot be a base URL", value));
    }
    if !origin.path().ends_with('/') {
        let path = format!("{}/", origin.path());
        origin.set_path(&path);
    }
    Ok(origin)
}
