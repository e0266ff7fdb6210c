//! Registry of metadata subscribers.
//!
//! Subscribers get no buffering. [`MetadataRegistry::publish`] writes each
//! message to every subscriber in turn and waits for the write to finish.
//! A subscriber whose write fails or stalls past the timeout is removed at
//! once, and its eviction token wakes the connection task so the socket is
//! closed.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Identifier assigned to each metadata subscriber.
pub type SubscriberId = u64;

type SharedWriter = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

struct Subscriber {
    peer: SocketAddr,
    writer: SharedWriter,
    evicted: CancellationToken,
}

/// Returned by [`MetadataRegistry::subscribe`].
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Registry identifier.
    pub id: SubscriberId,
    /// Cancelled when the registry drops this subscriber.
    pub evicted: CancellationToken,
}

/// Outcome of one publish.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers that received the full message.
    pub delivered: usize,
    /// Subscribers removed because their write failed or timed out.
    pub dropped: Vec<SubscriberId>,
}

/// Concurrency-safe set of metadata subscribers.
pub struct MetadataRegistry {
    subscribers: Mutex<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
    write_timeout: Duration,
}

impl std::fmt::Debug for MetadataRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataRegistry")
            .field("subscribers", &self.len())
            .field("write_timeout", &self.write_timeout)
            .finish_non_exhaustive()
    }
}

impl MetadataRegistry {
    /// Create an empty registry. Each subscriber write must complete within
    /// `write_timeout`.
    #[must_use]
    pub fn new(write_timeout: Duration) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            write_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriberId, Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a writer to the subscriber set.
    pub fn subscribe<W>(&self, peer: SocketAddr, writer: W) -> Subscription
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let evicted = CancellationToken::new();
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        self.lock().insert(
            id,
            Subscriber {
                peer,
                writer: Arc::new(tokio::sync::Mutex::new(writer)),
                evicted: evicted.clone(),
            },
        );
        Subscription { id, evicted }
    }

    /// Remove a subscriber and fire its eviction token. Returns `false` if
    /// it was already gone.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        match self.lock().remove(&id) {
            Some(subscriber) => {
                subscriber.evicted.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of subscribers.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether there are no subscribers.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Write `message` plus a newline to every current subscriber.
    ///
    /// Subscribers are written one after another, so each one sees messages
    /// in the order they were published.
    pub async fn publish(&self, message: &str) -> PublishReport {
        let mut line = String::with_capacity(message.len() + 1);
        line.push_str(message);
        line.push('\n');

        let targets: Vec<(SubscriberId, SocketAddr, SharedWriter)> = self
            .lock()
            .iter()
            .map(|(id, s)| (*id, s.peer, Arc::clone(&s.writer)))
            .collect();

        let mut report = PublishReport::default();
        for (id, peer, writer) in targets {
            let mut writer = writer.lock().await;
            let written = tokio::time::timeout(self.write_timeout, async {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await
            })
            .await;

            match written {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    log::info!("[Metadata] Dropping subscriber {}: {}", peer, e);
                    self.unsubscribe(id);
                    report.dropped.push(id);
                }
                Err(_) => {
                    log::info!(
                        "[Metadata] Dropping subscriber {}: write timed out after {}s",
                        peer,
                        self.write_timeout.as_secs()
                    );
                    self.unsubscribe(id);
                    report.dropped.push(id);
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_publish_appends_newline_verbatim() {
        let registry = MetadataRegistry::new(Duration::from_secs(1));
        let (writer, reader) = tokio::io::duplex(1024);
        registry.subscribe(peer(1), writer);

        let report = registry.publish(r#"{"type":"play","uri":"x"}"#).await;
        assert_eq!(report.delivered, 1);

        let mut lines = BufReader::new(reader).lines();
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            r#"{"type":"play","uri":"x"}"#
        );
    }

    #[tokio::test]
    async fn test_messages_arrive_in_publish_order() {
        let registry = MetadataRegistry::new(Duration::from_secs(1));
        let (writer, reader) = tokio::io::duplex(4096);
        registry.subscribe(peer(1), writer);

        for msg in ["one", "two", "three"] {
            registry.publish(msg).await;
        }

        let mut lines = BufReader::new(reader).lines();
        for expected in ["one", "two", "three"] {
            assert_eq!(lines.next_line().await.unwrap().unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_failed_write_unsubscribes_and_evicts() {
        let registry = MetadataRegistry::new(Duration::from_secs(1));
        let (dead_writer, dead_reader) = tokio::io::duplex(64);
        let (live_writer, live_reader) = tokio::io::duplex(64);
        let dead = registry.subscribe(peer(1), dead_writer);
        registry.subscribe(peer(2), live_writer);
        drop(dead_reader);

        let report = registry.publish("pause").await;
        assert_eq!(report.dropped, vec![dead.id]);
        assert_eq!(report.delivered, 1);
        assert!(dead.evicted.is_cancelled());
        assert_eq!(registry.len(), 1);

        let mut lines = BufReader::new(live_reader).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "pause");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_subscriber_times_out() {
        let registry = MetadataRegistry::new(Duration::from_secs(10));
        // Nobody reads this pipe, so the second message cannot fit.
        let (writer, _reader) = tokio::io::duplex(8);
        let sub = registry.subscribe(peer(1), writer);

        assert_eq!(registry.publish("1234567").await.delivered, 1);
        let report = registry.publish("overflow").await;
        assert_eq!(report.dropped, vec![sub.id]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let registry = MetadataRegistry::new(Duration::from_secs(1));
        let (writer, _reader) = tokio::io::duplex(8);
        let sub = registry.subscribe(peer(1), writer);
        assert!(registry.unsubscribe(sub.id));
        assert!(!registry.unsubscribe(sub.id));
        assert!(sub.evicted.is_cancelled());
    }
}
