//! TigerTunes relay server.
//!
//! Streams live audio from a streaming-service receiver to vintage
//! clients over two plain TCP sockets: raw PCM on one port, playback events
//! as newline-delimited text on another.
//!
//! # Architecture
//!
//! - **Pipeline** - producer process piped into a resampling transformer,
//!   plus a readiness latch driven by the producer's diagnostics
//! - **Audio** - drain engine broadcasting fixed-size PCM chunks to every
//!   connected audio client
//! - **Metadata** - relay holding a reconnecting upstream WebSocket and
//!   forwarding each event verbatim to subscribers
//! - **App** - startup order, shared context, shutdown
//!
//! # Modules
//!
//! - [`pipeline`] - process supervision and readiness
//! - [`audio`] - drain engine, client registry, audio listener
//! - [`metadata`] - relay, upstream sources, subscriber registry and listener
//! - [`config`] - configuration loading
//! - [`app`] - the running server

pub mod app;
pub mod audio;
pub mod config;
pub mod constants;
pub mod metadata;
pub mod net;
pub mod pipeline;

// Re-export commonly used types
pub use app::{AppContext, Server};
pub use config::Config;
pub use pipeline::{Pipeline, PipelineConfig, ReadinessGate, SpawnError};
