//! Application-wide constants for the TigerTunes relay.
//!
//! Centralizes the timing and sizing numbers that shape latency and
//! failure detection. Most of them are defaults for [`Config`] fields and
//! can be overridden at runtime.
//!
//! # Categories
//!
//! - **Audio path**: chunk size, socket tuning, per-client queueing
//! - **Metadata path**: reconnect delay, subscriber write timeout
//! - **Pipeline**: readiness wait, wire format
//! - **Network**: default ports and upstream endpoint
//! - **Shutdown**: grace period for tasks and child processes
//!
//! [`Config`]: crate::config::Config

// Rust guideline compliant 2026-02

use std::time::Duration;

// ============================================================================
// Audio path
// ============================================================================

/// Maximum bytes pulled from the pipeline output per read.
///
/// 16 KiB is roughly 90 ms of 44.1 kHz stereo s16le audio.
pub const DRAIN_CHUNK_SIZE: usize = 16 * 1024;

/// Yield after a failed pipeline read before trying again.
pub const DRAIN_RETRY_YIELD: Duration = Duration::from_millis(10);

/// `SO_SNDBUF` applied to every accepted audio connection.
pub const AUDIO_SEND_BUFFER_SIZE: usize = 16 * 1024;

/// A write to an audio client that cannot complete within this window
/// evicts the client.
pub const AUDIO_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Chunks queued per audio client before it counts as dead. At 16 KiB per
/// chunk this is under a second of audio.
pub const AUDIO_CLIENT_QUEUE_DEPTH: usize = 8;

// ============================================================================
// Metadata path
// ============================================================================

/// Fixed delay between upstream event source connection attempts.
pub const RELAY_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Upper bound on a single subscriber write before it is unsubscribed.
pub const METADATA_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Pipeline
// ============================================================================

/// How long startup waits for the producer to report authentication.
///
/// First-time logins go through a browser, so this is generous.
pub const READY_TIMEOUT: Duration = Duration::from_secs(300);

/// PCM sample rate handed to the transformer.
pub const SAMPLE_RATE: u32 = 44_100;

/// PCM channel count handed to the transformer.
pub const CHANNELS: u16 = 2;

// ============================================================================
// Network
// ============================================================================

/// Default bind host for both listeners.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default audio stream port.
pub const DEFAULT_AUDIO_PORT: u16 = 5001;

/// Default metadata stream port.
pub const DEFAULT_METADATA_PORT: u16 = 5003;

/// Producer's local event WebSocket.
pub const DEFAULT_UPSTREAM_EVENTS_URL: &str = "ws://localhost:8888/events";

/// Sleep after a transient `accept()` failure.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

// ============================================================================
// Shutdown
// ============================================================================

/// How long shutdown waits for each background task and for the pipeline
/// to exit after SIGTERM.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
