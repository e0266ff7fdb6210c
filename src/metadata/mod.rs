//! Playback event relay.
//!
//! ```text
//! upstream (WebSocket) ──► MetadataRelay ──publish──► MetadataRegistry ──► subscribers
//!                                                        ▲
//!                          MetadataListener ──accept─────┘
//! ```
//!
//! Messages are opaque text. They are never parsed or reordered, and each
//! one leaves as a single line.

pub mod listener;
pub mod registry;
pub mod relay;
pub mod upstream;

pub use listener::MetadataListener;
pub use registry::{MetadataRegistry, PublishReport, SubscriberId, Subscription};
pub use relay::{MetadataRelay, RelayState, RelayStats};
pub use upstream::{EventSource, EventStream, WebSocketSource};
