//! WebSocket transport.
//!
//! Same channel contract as the stdio transport, backed by one WebSocket
//! connection. Each JSON-RPC message travels as one text frame.

use crate::config::DEFAULT_SHUTDOWN_GRACE;
use crate::error::{McpError, McpResult, TransportError};
use crate::framing::{Frame, Framer};
use crate::protocol::JsonRpcMessage;
use crate::transport::{channel_pair, SessionChannels, Transport};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Subprotocol negotiated with the server.
pub const SUBPROTOCOL: &str = "mcp";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport over a WebSocket connection.
pub struct WebSocketTransport {
    url: String,
    scope: CancellationToken,
    drain: CancellationToken,
    close_timeout: Duration,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl WebSocketTransport {
    /// Connect, negotiate the subprotocol, and start both pumps.
    pub async fn connect(url: &str) -> McpResult<(Self, SessionChannels)> {
        let mut request = url.into_client_request()?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));

        debug!(url = %url, "Connecting to WebSocket server");
        let (socket, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| McpError::spawn(format!("{url}: {e}")))?;

        let negotiated = response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        info!(url = %url, subprotocol = %negotiated, "WebSocket connected");

        let (sink, stream) = socket.split();
        let (session, pumps) = channel_pair();
        let scope = CancellationToken::new();
        let drain = scope.child_token();

        let reader = tokio::spawn(read_pump(stream, pumps.inbound, scope.clone()));
        let writer = tokio::spawn(write_pump(sink, pumps.outbound, drain.clone(), scope.clone()));

        let transport = Self {
            url: url.to_string(),
            scope,
            drain,
            close_timeout: DEFAULT_SHUTDOWN_GRACE,
            reader: Some(reader),
            writer: Some(writer),
        };

        Ok((transport, session))
    }

    /// How long `close` waits for queued messages and the close handshake.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// The URL this transport connected to.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn close(&mut self) -> McpResult<()> {
        if self.reader.is_none() && self.writer.is_none() {
            return Ok(());
        }

        // Writer first: it flushes queued messages and sends the close frame.
        self.drain.cancel();
        if let Some(mut writer) = self.writer.take() {
            match tokio::time::timeout(self.close_timeout, &mut writer).await {
                Ok(Err(e)) => debug!(error = %e, "WebSocket writer ended abnormally"),
                Ok(Ok(())) => {}
                Err(_) => {
                    warn!(url = %self.url, "WebSocket peer not reading, dropping connection");
                    self.scope.cancel();
                    let _ = writer.await;
                }
            }
        }

        self.scope.cancel();
        if let Some(reader) = self.reader.take() {
            if let Err(e) = reader.await {
                debug!(error = %e, "WebSocket reader ended abnormally");
            }
        }

        info!(url = %self.url, "Closed WebSocket transport");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.scope.is_cancelled()
            && self
                .reader
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

fn decode_frame(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Framer::parse_message(&text)),
        Message::Binary(bytes) => Some(match std::str::from_utf8(&bytes) {
            Ok(text) => Framer::parse_message(text),
            Err(e) => Err(TransportError::Decode(e.to_string())),
        }),
        // Ping/pong are answered by tungstenite; close is handled by the caller.
        _ => None,
    }
}

/// Socket -> inbound channel.
async fn read_pump(
    mut stream: SplitStream<Socket>,
    inbound: mpsc::Sender<Frame>,
    scope: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = scope.cancelled() => break,
            next = stream.next() => next,
        };

        let message = match next {
            Some(Ok(Message::Close(frame))) => {
                debug!(frame = ?frame, "Server closed the connection");
                break;
            }
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                warn!(error = %e, "WebSocket read failed");
                tokio::select! {
                    _ = scope.cancelled() => {}
                    _ = inbound.send(Err(TransportError::Stream(e.to_string()))) => {}
                }
                scope.cancel();
                break;
            }
            None => break,
        };

        let Some(frame) = decode_frame(message) else {
            continue;
        };

        tokio::select! {
            _ = scope.cancelled() => break,
            sent = inbound.send(frame) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}

/// Outbound channel -> socket.
///
/// Cancelling `drain` stops new messages, flushes the queued ones and closes
/// the connection. Cancelling `scope` abandons the socket wherever it is.
async fn write_pump(
    mut sink: SplitSink<Socket, Message>,
    mut outbound: mpsc::Receiver<JsonRpcMessage>,
    drain: CancellationToken,
    scope: CancellationToken,
) {
    let mut draining = false;
    loop {
        let message = tokio::select! {
            biased;
            _ = scope.cancelled() => return,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = drain.cancelled(), if !draining => {
                draining = true;
                outbound.close();
                continue;
            }
        };

        let text = match Framer::to_json(&message) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to serialize outgoing message");
                continue;
            }
        };

        let sent = tokio::select! {
            _ = scope.cancelled() => return,
            sent = sink.send(Message::Text(text)) => sent,
        };
        if let Err(e) = sent {
            warn!(error = %e, "WebSocket write failed");
            scope.cancel();
            return;
        }
    }

    tokio::select! {
        _ = scope.cancelled() => {}
        closed = sink.close() => {
            if let Err(e) = closed {
                debug!(error = %e, "WebSocket close handshake failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JsonRpcNotification, JsonRpcRequest};
    use crate::transport::CHANNEL_CAPACITY;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    /// Accept one connection, agree on `mcp`, and run `handler` on it.
    async fn serve_once<F, Fut>(handler: F) -> String
    where
        F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback = |_: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
                response
                    .headers_mut()
                    .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));
                Ok(response)
            };
            let socket = tokio_tungstenite::accept_hdr_async(stream, callback).await.unwrap();
            handler(socket).await;
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let url = serve_once(|mut socket| async move {
            while let Some(Ok(message)) = socket.next().await {
                if message.is_text() && socket.send(message).await.is_err() {
                    break;
                }
            }
        })
        .await;

        let (mut transport, mut channels) = WebSocketTransport::connect(&url).await.unwrap();
        assert!(transport.is_connected());
        assert_eq!(transport.url(), url);

        let request: JsonRpcMessage = JsonRpcRequest::new(1, "tools/list", None).into();
        channels.outbound.send(request.clone()).await.unwrap();
        assert_eq!(channels.inbound.recv().await.unwrap().unwrap(), request);

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_connected());
        assert!(channels.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_bad_frame_is_reported_in_band() {
        let url = serve_once(|mut socket| async move {
            socket.send(Message::Text("not json".into())).await.unwrap();
            socket
                .send(Message::Text(r#"{"jsonrpc":"2.0","method":"ok"}"#.into()))
                .await
                .unwrap();
            socket.close(None).await.unwrap();
        })
        .await;

        let (mut transport, mut channels) = WebSocketTransport::connect(&url).await.unwrap();
        assert!(matches!(
            channels.inbound.recv().await.unwrap(),
            Err(TransportError::MalformedMessage { .. })
        ));
        assert_eq!(channels.inbound.recv().await.unwrap().unwrap().method(), Some("ok"));
        assert!(channels.inbound.recv().await.is_none());

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_flushes_queued_messages() {
        let (received_tx, received_rx) = tokio::sync::oneshot::channel();
        let url = serve_once(|mut socket| async move {
            let mut numbers = Vec::new();
            while let Some(Ok(message)) = socket.next().await {
                if let Message::Text(text) = message {
                    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                    numbers.push(value["params"]["n"].as_u64().unwrap());
                }
            }
            let _ = received_tx.send(numbers);
        })
        .await;

        let (mut transport, channels) = WebSocketTransport::connect(&url).await.unwrap();
        for n in 0..CHANNEL_CAPACITY {
            let message: JsonRpcMessage =
                JsonRpcNotification::new("progress", Some(json!({"n": n}))).into();
            channels.outbound.send(message).await.unwrap();
        }
        drop(channels);
        transport.close().await.unwrap();

        let numbers = received_rx.await.unwrap();
        assert_eq!(numbers, (0..CHANNEL_CAPACITY as u64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_close_does_not_hang_on_stalled_peer() {
        let url = serve_once(|socket| async move {
            // Accept, then never read.
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(socket);
        })
        .await;

        let (transport, channels) = WebSocketTransport::connect(&url).await.unwrap();
        let mut transport = transport.with_close_timeout(Duration::from_millis(200));

        let payload = "x".repeat(1024 * 1024);
        for _ in 0..64 {
            let message: JsonRpcMessage =
                JsonRpcNotification::new("bulk", Some(json!({"data": payload.as_str()}))).into();
            let queued =
                tokio::time::timeout(Duration::from_millis(200), channels.outbound.send(message)).await;
            if !matches!(queued, Ok(Ok(()))) {
                break;
            }
        }
        drop(channels);

        tokio::time::timeout(Duration::from_secs(10), transport.close())
            .await
            .expect("close hung")
            .unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_connect_failure_is_spawn_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = WebSocketTransport::connect(&format!("ws://{addr}")).await;
        assert!(matches!(result, Err(McpError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let result = WebSocketTransport::connect("not a url").await;
        assert!(matches!(result, Err(McpError::WebSocket(_))));
    }
}
