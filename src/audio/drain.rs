//! Drain & broadcast engine.
//!
//! Pulls PCM from the pipeline output one bounded chunk at a time and fans
//! each chunk out through the [`AudioRegistry`]. Reads are readiness-driven,
//! so the engine sleeps in the reactor while the pipe is empty and never
//! holds more than one chunk. No history is kept: a client that joins
//! mid-stream starts at the next chunk.

// Rust guideline compliant 2026-02

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use super::registry::AudioRegistry;
use crate::constants::DRAIN_RETRY_YIELD;

/// Counters reported when the engine stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainStats {
    /// Bytes read from the pipeline.
    pub bytes_read: u64,
    /// Nonempty reads broadcast to at least one client.
    pub chunks_broadcast: u64,
    /// Clients dropped by broadcast sweeps.
    pub clients_dropped: u64,
}

/// Reads a byte source and broadcasts it to registered audio clients.
#[derive(Debug)]
pub struct DrainEngine<R> {
    source: R,
    registry: Arc<AudioRegistry>,
    chunk_size: usize,
}

impl<R> DrainEngine<R>
where
    R: AsyncRead + Unpin,
{
    /// Create an engine reading at most `chunk_size` bytes per iteration.
    pub fn new(source: R, registry: Arc<AudioRegistry>, chunk_size: usize) -> Self {
        Self {
            source,
            registry,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Run until `cancel` fires.
    ///
    /// Read errors are logged and retried after a short yield. End of
    /// stream means the pipeline died; the engine then idles until
    /// shutdown rather than spinning on a closed pipe.
    pub async fn run(mut self, cancel: CancellationToken) -> DrainStats {
        let mut stats = DrainStats::default();
        let mut buf = vec![0u8; self.chunk_size];

        log::info!("[Drain] Broadcasting pipeline output in {}-byte chunks", self.chunk_size);

        loop {
            let read = tokio::select! {
                () = cancel.cancelled() => break,
                read = self.source.read(&mut buf) => read,
            };

            match read {
                Ok(0) => {
                    log::warn!("[Drain] Pipeline output closed; audio clients will hear silence");
                    cancel.cancelled().await;
                    break;
                }
                Ok(n) => {
                    stats.bytes_read += n as u64;
                    if self.registry.is_empty() {
                        continue;
                    }
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    let report = self.registry.broadcast(&chunk);
                    stats.chunks_broadcast += 1;
                    stats.clients_dropped += report.dropped.len() as u64;
                }
                Err(e) => {
                    log::debug!("[Drain] Pipeline read failed: {} (retrying)", e);
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(DRAIN_RETRY_YIELD) => {}
                    }
                }
            }
        }

        log::info!(
            "[Drain] Stopped after {} bytes, {} chunks broadcast",
            stats.bytes_read,
            stats.chunks_broadcast
        );
        stats
    }
}
