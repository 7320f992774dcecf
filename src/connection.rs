//! Per-listener connection limiting and drain tracking.
//!
//! Each listener caps its concurrent handler count at `max_conn`;
//! connections beyond the cap are refused at accept. The active count
//! also drives graceful drain: shutdown waits until every limiter
//! reports zero active connections or the deadline passes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Connection limiter shared by one listener's accept loop.
#[derive(Debug)]
pub struct ConnLimiter {
    semaphore: Arc<Semaphore>,
    active: AtomicUsize,
    rejected: AtomicUsize,
    max: usize,
}

impl ConnLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            active: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
            max,
        }
    }

    /// Attempts to admit a connection. `None` refuses it.
    pub fn try_acquire(self: &Arc<Self>) -> Option<ConnGuard> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                self.active.fetch_add(1, Ordering::Relaxed);
                Some(ConnGuard {
                    _permit: permit,
                    limiter: Arc::clone(self),
                })
            }
            Err(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(max = self.max, "connection limit reached, refusing");
                None
            }
        }
    }

    /// Connections currently being served.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Connections refused at the cap.
    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Releases the limiter slot when the connection handler finishes.
pub struct ConnGuard {
    _permit: tokio::sync::OwnedSemaphorePermit,
    limiter: Arc<ConnLimiter>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        let remaining = self.limiter.active.fetch_sub(1, Ordering::Relaxed) - 1;
        debug!(active = remaining, "connection released");
    }
}
