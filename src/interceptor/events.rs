//! Fetch Events
//!
//! A fetch event carries the intercepted request and a lifecycle scope.
//! Work registered with `wait_until` keeps running after the response has
//! been handed back; the host awaits `settled` before treating the event
//! as finished.

use std::future::Future;
use std::sync::Mutex;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::net::Request;

/// An intercepted request and the background work it spawned
pub struct FetchEvent {
    request: Request,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Run `work` in the background and tie it to this event
    pub fn wait_until<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(work);
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle);
    }

    /// Number of registered background tasks
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Wait for every registered background task to finish
    pub async fn settled(self) {
        let handles = self
            .pending
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(url = %self.request.url, error = %e, "Background task panicked");
            }
        }
    }
}
