//! One-shot readiness latch for the audio pipeline.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Latches `true` once the producer reports it has authenticated.
///
/// Cloning is cheap and every clone observes the same latch. The scanner
/// thread calls [`latch`](Self::latch) from blocking code; async callers use
/// [`wait`](Self::wait).
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    /// Create an unlatched gate.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Latch the gate.
    ///
    /// Returns `true` only for the call that performed the false→true
    /// transition; every later call is a no-op returning `false`.
    pub fn latch(&self) -> bool {
        self.tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    /// Whether the gate has latched.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the gate latches or `timeout` elapses.
    ///
    /// Returns whether the gate latched.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let latched = tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await;
        matches!(latched, Ok(Ok(_)))
    }
}
