//! Audio stream listener and per-connection lifecycle.
//!
//! The protocol is push-only: clients connect and receive raw PCM until
//! they disconnect. Each connection runs as one task that concurrently
//!
//! - writes chunks from its registry queue, each bounded by a timeout, and
//! - parks on a read whose only job is noticing the peer going away.
//!
//! Whichever finishes first ends the connection and deregisters it.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::registry::{AudioRegistry, ClientId};
use crate::constants::{ACCEPT_ERROR_BACKOFF, AUDIO_CLIENT_TIMEOUT, AUDIO_SEND_BUFFER_SIZE};
use crate::net;

/// Socket settings applied to every accepted audio connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSocketSettings {
    /// `SO_SNDBUF` in bytes.
    pub send_buffer_size: usize,
    /// Longest a single chunk write may take before the client is evicted.
    pub write_timeout: Duration,
}

impl Default for AudioSocketSettings {
    fn default() -> Self {
        Self {
            send_buffer_size: AUDIO_SEND_BUFFER_SIZE,
            write_timeout: AUDIO_CLIENT_TIMEOUT,
        }
    }
}

/// Why an audio connection ended.
#[derive(Debug)]
pub enum Disconnect {
    /// Peer closed its side.
    PeerClosed,
    /// Reading from the peer failed (reset, etc.).
    ReadFailed(io::Error),
    /// Writing a chunk failed.
    WriteFailed(io::Error),
    /// A chunk write did not finish within the timeout.
    WriteTimedOut(Duration),
    /// The broadcast sweep dropped the client.
    Evicted,
    /// Server shutdown.
    Shutdown,
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed"),
            Self::ReadFailed(e) => write!(f, "read failed: {e}"),
            Self::WriteFailed(e) => write!(f, "write failed: {e}"),
            Self::WriteTimedOut(after) => write!(f, "write timed out after {}s", after.as_secs()),
            Self::Evicted => write!(f, "evicted"),
            Self::Shutdown => write!(f, "server shutting down"),
        }
    }
}

/// Accepts audio clients and hands them to the registry.
#[derive(Debug)]
pub struct AudioListener {
    listener: TcpListener,
    settings: AudioSocketSettings,
}

impl AudioListener {
    /// Bind the audio port.
    pub async fn bind(addr: SocketAddr, settings: AudioSocketSettings) -> Result<Self> {
        let listener = net::bind_listener(addr).await?;
        Ok(Self { listener, settings })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until `cancel` fires. Dropping out of this loop closes the
    /// listening socket; live connections observe the same token.
    pub async fn run(self, registry: Arc<AudioRegistry>, cancel: CancellationToken) {
        if let Ok(addr) = self.local_addr() {
            log::info!("[Audio] Listening on {}", addr);
        }

        loop {
            let accepted = tokio::select! {
                () = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = net::tune_for_low_latency(&stream, self.settings.send_buffer_size) {
                        log::warn!("[Audio] Could not tune socket for {}: {}", peer, e);
                    }
                    let (id, queue) = registry.register(peer);
                    log::info!("[Audio] Client connected from {} ({} total)", peer, registry.len());

                    tokio::spawn(serve_client(
                        stream,
                        peer,
                        id,
                        queue,
                        Arc::clone(&registry),
                        self.settings.write_timeout,
                        cancel.child_token(),
                    ));
                }
                Err(e) => {
                    log::error!("[Audio] Accept error: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        log::info!("[Audio] Listener stopped");
    }
}

async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    id: ClientId,
    mut queue: mpsc::Receiver<Bytes>,
    registry: Arc<AudioRegistry>,
    write_timeout: Duration,
    cancel: CancellationToken,
) {
    let (mut reader, mut writer) = stream.into_split();

    let reason = tokio::select! {
        reason = deliver(&mut writer, &mut queue, write_timeout) => reason,
        closed = net::wait_for_peer_close(&mut reader) => match closed {
            Ok(()) => Disconnect::PeerClosed,
            Err(e) => Disconnect::ReadFailed(e),
        },
        () = cancel.cancelled() => Disconnect::Shutdown,
    };

    registry.remove(id);
    log::info!("[Audio] Client {} disconnected: {}", peer, reason);
}

/// Write queued chunks until the queue closes or a write fails.
async fn deliver<W>(writer: &mut W, queue: &mut mpsc::Receiver<Bytes>, write_timeout: Duration) -> Disconnect
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = queue.recv().await {
        match tokio::time::timeout(write_timeout, writer.write_all(&chunk)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Disconnect::WriteFailed(e),
            Err(_) => return Disconnect::WriteTimedOut(write_timeout),
        }
    }
    Disconnect::Evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_deliver_writes_chunks_in_order() {
        let (tx, mut queue) = mpsc::channel(4);
        let (mut writer, mut peer) = tokio::io::duplex(1024);

        tx.send(Bytes::from_static(b"one ")).await.unwrap();
        tx.send(Bytes::from_static(b"two")).await.unwrap();
        drop(tx);

        let reason = deliver(&mut writer, &mut queue, Duration::from_secs(1)).await;
        assert!(matches!(reason, Disconnect::Evicted));

        drop(writer);
        let mut out = Vec::new();
        peer.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"one two");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deliver_times_out_on_stalled_peer() {
        let (tx, mut queue) = mpsc::channel(4);
        // 8-byte pipe that nobody reads: the second chunk can never complete.
        let (mut writer, _peer) = tokio::io::duplex(8);
        tx.send(Bytes::from_static(b"12345678")).await.unwrap();
        tx.send(Bytes::from_static(b"9")).await.unwrap();

        let reason = deliver(&mut writer, &mut queue, Duration::from_secs(10)).await;
        assert!(matches!(reason, Disconnect::WriteTimedOut(d) if d == Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_client_deregistered_on_peer_close() {
        let registry = Arc::new(AudioRegistry::new(4));
        let cancel = CancellationToken::new();
        let listener = AudioListener::bind("127.0.0.1:0".parse().unwrap(), AudioSocketSettings::default())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(listener.run(Arc::clone(&registry), cancel.clone()));

        let client = TcpStream::connect(addr).await.unwrap();
        wait_for_len(&registry, 1).await;

        drop(client);
        wait_for_len(&registry, 0).await;
        cancel.cancel();
    }

    async fn wait_for_len(registry: &AudioRegistry, expected: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while registry.len() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("registry never reached {expected} clients"));
    }
}
