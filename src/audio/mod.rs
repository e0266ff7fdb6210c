//! Raw PCM fan-out to audio clients.
//!
//! ```text
//! pipeline stdout ──► DrainEngine ──broadcast──► AudioRegistry
//!                                                  │ per-client queue
//!                                                  ▼
//!                       AudioListener ──accept──► connection task ──► TCP peer
//! ```
//!
//! The wire format is an unframed stream of interleaved s16le stereo
//! samples. There is no header and no control channel; disconnecting is the
//! only thing a client can do.

pub mod drain;
pub mod listener;
pub mod registry;

pub use drain::{DrainEngine, DrainStats};
pub use listener::{AudioListener, AudioSocketSettings, Disconnect};
pub use registry::{AudioClientHandle, AudioRegistry, BroadcastReport, ClientId, DropReason};
