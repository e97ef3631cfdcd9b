//! Interceptor Lifecycle
//!
//! Install/activate state machine and the set of clients the interceptor
//! controls.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use tracing::debug;

/// Interceptor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Created, not yet installing
    Parsed,
    /// Populating the manifest cache
    Installing,
    /// Manifest cached, ready to activate
    Installed,
    /// Claiming clients
    Activating,
    /// Controlling clients
    Activated,
    /// Installation failed
    Redundant,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Open clients and whether the interceptor controls them
pub struct ClientRegistry {
    /// Client id -> controlled
    clients: RwLock<HashMap<ClientId, bool>>,
    /// New clients start controlled once the interceptor is active;
    /// only changed while `clients` is write-locked
    active: AtomicBool,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            active: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a newly opened client
    pub fn register(&self) -> ClientId {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut clients = self.clients.write().unwrap_or_else(|p| p.into_inner());
        let controlled = self.active.load(Ordering::SeqCst);
        clients.insert(id, controlled);
        drop(clients);
        debug!(client = %id, controlled = controlled, "Client registered");
        id
    }

    /// Forget a closed client
    pub fn unregister(&self, id: ClientId) {
        self.clients
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id);
        debug!(client = %id, "Client unregistered");
    }

    /// Take control of every open client without waiting for them to reopen.
    ///
    /// Returns the number of clients that were not controlled before.
    pub fn claim(&self) -> usize {
        let mut clients = self.clients.write().unwrap_or_else(|p| p.into_inner());
        self.active.store(true, Ordering::SeqCst);
        let mut claimed = 0;
        for controlled in clients.values_mut() {
            if !*controlled {
                *controlled = true;
                claimed += 1;
            }
        }
        claimed
    }

    pub fn is_controlled(&self, id: ClientId) -> bool {
        self.clients
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .copied()
            .unwrap_or(false)
    }

    /// Number of open clients
    pub fn len(&self) -> usize {
        self.clients.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
