//! Integration tests for the metadata relay against a real WebSocket
//! upstream and real subscriber sockets.

use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use tigertunes_server::metadata::{MetadataListener, MetadataRegistry, MetadataRelay, RelayState, WebSocketSource};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const RETRY: Duration = Duration::from_millis(200);

async fn subscriber(registry: &Arc<MetadataRegistry>, cancel: &CancellationToken) -> BufReader<TcpStream> {
    let listener = MetadataListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(listener.run(Arc::clone(registry), cancel.clone()));

    let before = registry.len();
    let stream = TcpStream::connect(addr).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while registry.len() == before {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    BufReader::new(stream)
}

async fn next_line(reader: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .expect("timed out waiting for metadata")
        .unwrap();
    line
}

#[tokio::test]
async fn test_upstream_drop_then_reconnect_resumes_forwarding() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let (dropped_tx, dropped_rx) = oneshot::channel();
    let (reconnected_tx, reconnected_rx) = oneshot::channel();
    let (done_tx, done_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        // First session: one event, then vanish without a close frame.
        let (tcp, _) = upstream.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        ws.send(Message::Text(r#"{"type":"play"}"#.into())).await.unwrap();
        ws.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let dropped_at = Instant::now();
        drop(ws);
        let _ = dropped_tx.send(dropped_at);

        // Second session: one more event, then hold until the test ends.
        let (tcp, _) = upstream.accept().await.unwrap();
        let _ = reconnected_tx.send(Instant::now());
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        ws.send(Message::Text(r#"{"type":"pause"}"#.into())).await.unwrap();
        let _ = done_rx.await;
    });

    let cancel = CancellationToken::new();
    let registry = Arc::new(MetadataRegistry::new(Duration::from_secs(5)));
    let mut reader = subscriber(&registry, &cancel).await;

    let relay = MetadataRelay::new(
        WebSocketSource::new(format!("ws://{upstream_addr}/events")),
        Arc::clone(&registry),
        RETRY,
    );
    let mut state = relay.state();
    let relay = tokio::spawn(relay.run(cancel.clone()));

    assert_eq!(next_line(&mut reader).await, "{\"type\":\"play\"}\n");
    assert_eq!(next_line(&mut reader).await, "{\"type\":\"pause\"}\n");

    let dropped_at = dropped_rx.await.unwrap();
    let reconnected_at = reconnected_rx.await.unwrap();
    assert!(
        reconnected_at - dropped_at >= RETRY,
        "reconnected after {:?}, before the retry delay",
        reconnected_at - dropped_at
    );

    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == RelayState::Connected))
        .await
        .unwrap()
        .unwrap();

    cancel.cancel();
    let stats = relay.await.unwrap();
    assert_eq!(stats.attempts, 2);
    assert_eq!(stats.messages, 2);
    let _ = done_tx.send(());
}

#[tokio::test]
async fn test_every_subscriber_gets_every_message_in_order() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let events: Vec<String> = (0..20).map(|i| format!(r#"{{"type":"volume","value":{i}}}"#)).collect();
    let sent = events.clone();

    let cancel = CancellationToken::new();
    let registry = Arc::new(MetadataRegistry::new(Duration::from_secs(5)));
    let mut a = subscriber(&registry, &cancel).await;
    let mut b = subscriber(&registry, &cancel).await;
    assert_eq!(registry.len(), 2);

    tokio::spawn(async move {
        let (tcp, _) = upstream.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        for event in sent {
            ws.send(Message::Text(event)).await.unwrap();
        }
        std::future::pending::<()>().await;
    });

    let relay = MetadataRelay::new(
        WebSocketSource::new(format!("ws://{upstream_addr}/events")),
        Arc::clone(&registry),
        RETRY,
    );
    tokio::spawn(relay.run(cancel.clone()));

    for event in &events {
        assert_eq!(next_line(&mut a).await, format!("{event}\n"));
        assert_eq!(next_line(&mut b).await, format!("{event}\n"));
    }
    cancel.cancel();
}

#[tokio::test]
async fn test_relay_keeps_retrying_unreachable_upstream() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = unused.local_addr().unwrap();
    drop(unused);

    let cancel = CancellationToken::new();
    let registry = Arc::new(MetadataRegistry::new(Duration::from_secs(5)));
    let relay = MetadataRelay::new(WebSocketSource::new(format!("ws://{addr}/events")), registry, Duration::from_millis(50));
    let handle = tokio::spawn(relay.run(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!handle.is_finished());

    cancel.cancel();
    let stats = handle.await.unwrap();
    assert!(stats.attempts >= 3, "only {} attempts", stats.attempts);
    assert_eq!(stats.messages, 0);
}
