use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Permit held for the lifetime of one session. Dropping it returns the
/// slot to the gate, which is the only release path.
pub type SessionPermit = OwnedSemaphorePermit;

/// Counting admission gate bounding simultaneously running sessions.
///
/// `admit` is awaited from the dispatch loop itself, so a saturated gate
/// stalls scanning, status publishing and stop-file checks until a running
/// session finishes. That backpressure is deliberate.
#[derive(Clone)]
pub struct ConcurrencyGate {
    permits: Arc<Semaphore>,
}

impl ConcurrencyGate {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_sessions.max(1))),
        }
    }

    /// Block until a session slot is free.
    pub async fn admit(&self) -> Result<SessionPermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .context("concurrency gate closed")
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
