//! Registry of connected audio clients.
//!
//! The accept loop registers clients, the drain engine broadcasts to them,
//! and each client's connection task deregisters itself on disconnect. All
//! three run on different tasks, so the map lives behind a mutex that is
//! only ever held for map operations, never across I/O.
//!
//! Delivery to a client goes through a bounded queue owned by that client's
//! connection task. Broadcasting is therefore a non-blocking `try_send` per
//! client, and a stalled client can only ever fill its own queue.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Identifier assigned to each accepted audio client.
pub type ClientId = u64;

/// Why a client was dropped during a broadcast sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The client's queue was full: it is not keeping up.
    Lagging,
    /// The client's connection task is gone.
    Closed,
}

/// Point-in-time view of one registered client.
#[derive(Debug, Clone)]
pub struct AudioClientHandle {
    /// Registry identifier.
    pub id: ClientId,
    /// Remote address.
    pub peer: SocketAddr,
    tx: mpsc::Sender<Bytes>,
}

/// Outcome of one broadcast sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Clients that accepted the chunk.
    pub delivered: usize,
    /// Clients removed by this sweep.
    pub dropped: Vec<(ClientId, DropReason)>,
}

/// Concurrency-safe set of audio clients.
#[derive(Debug)]
pub struct AudioRegistry {
    clients: Mutex<HashMap<ClientId, AudioClientHandle>>,
    next_id: AtomicU64,
    queue_depth: usize,
}

impl AudioRegistry {
    /// Create an empty registry whose clients each buffer up to
    /// `queue_depth` chunks.
    #[must_use]
    pub fn new(queue_depth: usize) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ClientId, AudioClientHandle>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a client and return its id plus the receiving end of its
    /// delivery queue.
    ///
    /// The client starts with whatever chunk is broadcast next; there is
    /// no backlog.
    pub fn register(&self, peer: SocketAddr) -> (ClientId, mpsc::Receiver<Bytes>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_depth);
        self.lock().insert(id, AudioClientHandle { id, peer, tx });
        (id, rx)
    }

    /// Remove a client. Returns `false` if it was already gone.
    ///
    /// Dropping the registry's sender closes the client's queue, which ends
    /// its connection task.
    pub fn remove(&self, id: ClientId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Copy of the current client set.
    pub fn snapshot(&self) -> Vec<AudioClientHandle> {
        self.lock().values().cloned().collect()
    }

    /// Number of registered clients.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no clients are registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Offer `chunk` to every client registered at the start of the sweep.
    ///
    /// Clients whose queue is full or closed are removed once the whole
    /// sweep is done; nobody else is affected.
    pub fn broadcast(&self, chunk: &Bytes) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for client in self.snapshot() {
            match client.tx.try_send(chunk.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => report.dropped.push((client.id, DropReason::Lagging)),
                Err(TrySendError::Closed(_)) => report.dropped.push((client.id, DropReason::Closed)),
            }
        }

        if !report.dropped.is_empty() {
            let mut clients = self.lock();
            for (id, reason) in &report.dropped {
                if let Some(client) = clients.remove(id) {
                    log::info!("[Audio] Dropping client {} ({:?})", client.peer, reason);
                }
            }
        }

        report
    }
}
