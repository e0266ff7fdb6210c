//! Metadata relay: persistent upstream connection with fixed-delay retry.
//!
//! ```text
//! Disconnected ──► Connecting ──ok──► Connected ──end/error──┐
//!      ▲               │                                     │
//!      │              err                                    │
//!      └──── sleep(retry_delay) ◄────────────────────────────┘
//! ```
//!
//! The delay is applied after every disconnect, clean or not, and never
//! grows. Only cancellation ends the loop.

// Rust guideline compliant 2026-02

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::registry::MetadataRegistry;
use super::upstream::EventSource;

/// Connection state of the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Waiting out the retry delay (or not started).
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// Forwarding messages.
    Connected,
}

/// Counters reported when the relay stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Connection attempts made.
    pub attempts: u64,
    /// Messages forwarded to subscribers.
    pub messages: u64,
}

/// Forwards upstream events to metadata subscribers.
#[derive(Debug)]
pub struct MetadataRelay<S> {
    source: S,
    registry: Arc<MetadataRegistry>,
    retry_delay: Duration,
    state: watch::Sender<RelayState>,
}

impl<S: EventSource> MetadataRelay<S> {
    /// Create a relay that starts out [`RelayState::Disconnected`].
    pub fn new(source: S, registry: Arc<MetadataRegistry>, retry_delay: Duration) -> Self {
        let (state, _) = watch::channel(RelayState::Disconnected);
        Self {
            source,
            registry,
            retry_delay,
            state,
        }
    }

    /// Subscribe to state transitions.
    pub fn state(&self) -> watch::Receiver<RelayState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: RelayState) {
        self.state.send_replace(next);
    }

    /// Run until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> RelayStats {
        let mut stats = RelayStats::default();
        let endpoint = self.source.endpoint().to_string();

        'session: loop {
            self.set_state(RelayState::Connecting);
            stats.attempts += 1;

            let connected = tokio::select! {
                () = cancel.cancelled() => break 'session,
                connected = self.source.connect() => connected,
            };

            match connected {
                Ok(mut stream) => {
                    self.set_state(RelayState::Connected);
                    log::info!("[Relay] Connected to {}", endpoint);

                    loop {
                        let next = tokio::select! {
                            () = cancel.cancelled() => break 'session,
                            next = stream.next_message() => next,
                        };
                        match next {
                            Ok(Some(message)) => {
                                log::debug!("[Relay] Event: {}", message);
                                self.registry.publish(&message).await;
                                stats.messages += 1;
                            }
                            Ok(None) => {
                                log::warn!("[Relay] Upstream stream ended");
                                break;
                            }
                            Err(e) => {
                                log::warn!("[Relay] Upstream stream failed: {:#}", e);
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    log::warn!("[Relay] Connection to {} failed: {:#}", endpoint, e);
                }
            }

            self.set_state(RelayState::Disconnected);
            log::info!("[Relay] Reconnecting in {}s", self.retry_delay.as_secs());
            tokio::select! {
                () = cancel.cancelled() => break 'session,
                () = tokio::time::sleep(self.retry_delay) => {}
            }
        }

        self.set_state(RelayState::Disconnected);
        log::info!(
            "[Relay] Stopped after {} attempts, {} messages relayed",
            stats.attempts,
            stats.messages
        );
        stats
    }
}
