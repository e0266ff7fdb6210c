//! Upstream event sources.
//!
//! The relay talks to its upstream through [`EventSource`], so the
//! reconnect logic can be exercised against scripted sources. The
//! production implementation, [`WebSocketSource`], wraps `tokio-tungstenite`
//! and reduces the WebSocket frame zoo to "next text message, clean end, or
//! failure".

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

/// Concrete WebSocket stream type.
type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Something the relay can (re)connect to.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open a fresh connection.
    async fn connect(&self) -> Result<Box<dyn EventStream>>;

    /// Human-readable endpoint for log lines.
    fn endpoint(&self) -> &str;
}

/// One live upstream connection.
#[async_trait]
pub trait EventStream: Send {
    /// Next message payload.
    ///
    /// `Ok(None)` means the upstream ended the stream cleanly; `Err` means
    /// it failed. Either way the connection is finished.
    async fn next_message(&mut self) -> Result<Option<String>>;
}

/// Upstream reached over a WebSocket URL (`ws://` or `wss://`).
#[derive(Debug, Clone)]
pub struct WebSocketSource {
    url: String,
}

impl WebSocketSource {
    /// Source for `url`. Plain `http(s)://` URLs are mapped to `ws(s)://`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: http_to_ws_scheme(&url.into()),
        }
    }
}

#[async_trait]
impl EventSource for WebSocketSource {
    async fn connect(&self) -> Result<Box<dyn EventStream>> {
        use tungstenite::client::IntoClientRequest;

        let request = self
            .url
            .as_str()
            .into_client_request()
            .with_context(|| format!("invalid WebSocket URL: {}", self.url))?;

        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .with_context(|| format!("WebSocket connect to {} failed", self.url))?;

        Ok(Box::new(WebSocketEvents { ws }))
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

struct WebSocketEvents {
    ws: WsStream,
}

#[async_trait]
impl EventStream for WebSocketEvents {
    async fn next_message(&mut self) -> Result<Option<String>> {
        loop {
            match self.ws.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(tungstenite::Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => {
                        log::warn!("[Relay] Skipping non-UTF-8 binary frame from upstream");
                    }
                },
                Some(Ok(tungstenite::Message::Ping(data))) => {
                    self.ws
                        .send(tungstenite::Message::Pong(data))
                        .await
                        .context("WebSocket send_pong failed")?;
                }
                Some(Ok(tungstenite::Message::Pong(_) | tungstenite::Message::Frame(_))) => {}
                Some(Ok(tungstenite::Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|cf| (u16::from(cf.code), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    log::info!("[Relay] Upstream closed the stream (code={}, reason={:?})", code, reason);
                    return Ok(None);
                }
                Some(Err(e)) => return Err(anyhow::anyhow!("WebSocket read error: {e}")),
                None => return Ok(None),
            }
        }
    }
}

/// Convert an HTTP(S) URL to WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if url.starts_with("wss://") || url.starts_with("ws://") {
        url.to_string()
    } else if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_http_to_ws_scheme() {
        assert_eq!(http_to_ws_scheme("http://localhost:8888/events"), "ws://localhost:8888/events");
        assert_eq!(http_to_ws_scheme("https://example.com/events"), "wss://example.com/events");
        assert_eq!(http_to_ws_scheme("ws://localhost:8888/events"), "ws://localhost:8888/events");
    }

    #[tokio::test]
    async fn test_connect_invalid_url_returns_error() {
        assert!(WebSocketSource::new("not-a-url").connect().await.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_returns_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let source = WebSocketSource::new(format!("ws://{addr}/events"));
        assert!(source.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_frames_map_to_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(tungstenite::Message::Text(r#"{"type":"play"}"#.into())).await.unwrap();
            ws.send(tungstenite::Message::Binary(vec![0xff, 0xfe])).await.unwrap();
            ws.send(tungstenite::Message::Ping(b"hi".to_vec())).await.unwrap();
            ws.send(tungstenite::Message::Binary(b"{\"type\":\"stop\"}".to_vec()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
            // Drain until the client's close reply arrives.
            while let Some(Ok(_)) = ws.next().await {}
        });

        let source = WebSocketSource::new(format!("ws://{addr}/events"));
        let mut stream = source.connect().await.unwrap();

        assert_eq!(stream.next_message().await.unwrap().as_deref(), Some(r#"{"type":"play"}"#));
        assert_eq!(stream.next_message().await.unwrap().as_deref(), Some(r#"{"type":"stop"}"#));
        assert_eq!(stream.next_message().await.unwrap(), None);

        drop(stream);
        server.await.unwrap();
    }
}
