//! Notification permission

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Outcome of a permission request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Granted,
    /// The user made no decision
    Default,
    Denied,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Granted => "granted",
            Permission::Default => "default",
            Permission::Denied => "denied",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "granted" => Ok(Permission::Granted),
            "default" => Ok(Permission::Default),
            "denied" => Ok(Permission::Denied),
            other => Err(PermissionError::Unknown(other.to_string())),
        }
    }
}

/// Permission query failures
#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    #[error("Unknown permission value '{0}'")]
    Unknown(String),
}

/// Notification permission requests
#[async_trait]
pub trait PermissionService: Send + Sync {
    async fn request_permission(&self) -> Result<Permission, PermissionError>;
}

/// Answers every request with a configured decision
pub struct ConfiguredPermission {
    decision: Permission,
}

impl ConfiguredPermission {
    pub fn new(decision: Permission) -> Self {
        Self { decision }
    }
}

#[async_trait]
impl PermissionService for ConfiguredPermission {
    async fn request_permission(&self) -> Result<Permission, PermissionError> {
        info!(permission = %self.decision, "Notification permission");
        Ok(self.decision)
    }
}
