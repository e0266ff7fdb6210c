//! Metadata subscriber listener.
//!
//! Each accepted connection's write half joins the [`MetadataRegistry`].
//! The connection task then holds the read half until the peer closes, the
//! registry evicts it, or the server shuts down.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::registry::MetadataRegistry;
use crate::constants::ACCEPT_ERROR_BACKOFF;
use crate::net;

/// Accepts metadata subscribers.
#[derive(Debug)]
pub struct MetadataListener {
    listener: TcpListener,
}

impl MetadataListener {
    /// Bind the metadata port.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        Ok(Self {
            listener: net::bind_listener(addr).await?,
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept subscribers until `cancel` fires.
    pub async fn run(self, registry: Arc<MetadataRegistry>, cancel: CancellationToken) {
        if let Ok(addr) = self.local_addr() {
            log::info!("[Metadata] Listening on {}", addr);
        }

        loop {
            let accepted = tokio::select! {
                () = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_subscriber(
                        stream,
                        peer,
                        Arc::clone(&registry),
                        cancel.child_token(),
                    ));
                }
                Err(e) => {
                    log::error!("[Metadata] Accept error: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        log::info!("[Metadata] Listener stopped");
    }
}

async fn serve_subscriber(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<MetadataRegistry>,
    cancel: CancellationToken,
) {
    let (mut reader, writer) = stream.into_split();
    let subscription = registry.subscribe(peer, writer);
    log::info!("[Metadata] Subscriber connected from {} ({} total)", peer, registry.len());

    let reason = tokio::select! {
        closed = net::wait_for_peer_close(&mut reader) => match closed {
            Ok(()) => "peer closed".to_string(),
            Err(e) => format!("read failed: {e}"),
        },
        () = subscription.evicted.cancelled() => "evicted".to_string(),
        () = cancel.cancelled() => "server shutting down".to_string(),
    };

    registry.unsubscribe(subscription.id);
    log::info!("[Metadata] Subscriber {} disconnected: {}", peer, reason);
}
