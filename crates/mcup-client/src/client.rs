//! Session selection and connection helpers.

use crate::approval::{ApprovalSession, ConsolePrompter, Prompter};
use crate::config::{ClientOptions, ServerEntry, StdioServerConfig};
use crate::error::{McpError, McpResult};
use crate::session::{ClientSession, McpSession};
use crate::stdio::{ProcessControl, StderrSink, StdioTransport};
use crate::transport::{SessionChannels, Transport};
use crate::websocket::WebSocketTransport;
use tracing::debug;

/// Bind a session to `channels`, gated on the console when approval is on.
pub fn build_session(channels: SessionChannels, options: &ClientOptions) -> Box<dyn McpSession> {
    build_session_with_prompter(channels, options, Box::new(ConsolePrompter::new()))
}

/// Like [`build_session`], asking `prompter` instead of the console.
pub fn build_session_with_prompter(
    channels: SessionChannels,
    options: &ClientOptions,
    prompter: Box<dyn Prompter>,
) -> Box<dyn McpSession> {
    let session = ClientSession::new(channels, options);
    if options.approval.enabled {
        debug!(keywords = ?options.approval.keywords, "Tool approval enabled");
        Box::new(ApprovalSession::new(session, options.approval.clone(), prompter))
    } else {
        Box::new(session)
    }
}

/// A session together with the transport that carries it.
pub struct Connection<T: Transport> {
    session: Option<Box<dyn McpSession>>,
    transport: T,
}

impl<T: Transport> Connection<T> {
    pub fn new(transport: T, session: Box<dyn McpSession>) -> Self {
        Self {
            session: Some(session),
            transport,
        }
    }

    /// The session, until the connection is closed.
    pub fn session(&self) -> McpResult<&dyn McpSession> {
        self.session.as_deref().ok_or(McpError::StreamClosed)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Drop the session, which closes the outbound channel, then shut the
    /// transport down. Safe to call more than once.
    pub async fn close(&mut self) -> McpResult<()> {
        self.session.take();
        self.transport.close().await
    }
}

/// Spawn a stdio server and bind a session to it.
pub async fn connect_stdio(
    config: &StdioServerConfig,
    stderr: StderrSink,
    options: &ClientOptions,
) -> McpResult<Connection<StdioTransport>> {
    let control = ProcessControl::default().with_shutdown_grace(options.shutdown_grace);
    let (transport, channels) = StdioTransport::open_with(config, stderr, control).await?;
    Ok(Connection::new(transport, build_session(channels, options)))
}

/// Connect to a WebSocket server and bind a session to it.
pub async fn connect_websocket(
    url: &str,
    options: &ClientOptions,
) -> McpResult<Connection<WebSocketTransport>> {
    let (transport, channels) = WebSocketTransport::connect(url).await?;
    let transport = transport.with_close_timeout(options.shutdown_grace);
    Ok(Connection::new(transport, build_session(channels, options)))
}

/// Either kind of connection, as chosen by a config entry.
pub enum AnyConnection {
    Stdio(Box<Connection<StdioTransport>>),
    WebSocket(Connection<WebSocketTransport>),
}

impl AnyConnection {
    /// Connect to whatever `entry` describes.
    pub async fn connect(
        entry: &ServerEntry,
        stderr: StderrSink,
        options: &ClientOptions,
    ) -> McpResult<Self> {
        match entry {
            ServerEntry::Stdio(config) => Ok(Self::Stdio(Box::new(
                connect_stdio(config, stderr, options).await?,
            ))),
            ServerEntry::Websocket { url } => {
                Ok(Self::WebSocket(connect_websocket(url, options).await?))
            }
        }
    }

    pub fn session(&self) -> McpResult<&dyn McpSession> {
        match self {
            Self::Stdio(c) => c.session(),
            Self::WebSocket(c) => c.session(),
        }
    }

    pub async fn close(&mut self) -> McpResult<()> {
        match self {
            Self::Stdio(c) => c.close().await,
            Self::WebSocket(c) => c.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalPolicy;
    use crate::protocol::{JsonRpcMessage, JsonRpcResponse};
    use crate::transport::channel_pair;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingPrompter(Arc<AtomicUsize>);

    #[async_trait]
    impl Prompter for CountingPrompter {
        async fn ask(&mut self, _: &str) -> std::io::Result<Option<String>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Some("n\n".to_string()))
        }
    }

    #[tokio::test]
    async fn test_gated_session_selected_when_enabled() {
        let prompts = Arc::new(AtomicUsize::new(0));
        let (channels, mut pumps) = channel_pair();
        let options = ClientOptions::default().with_approval(ApprovalPolicy::cli());
        let session =
            build_session_with_prompter(channels, &options, Box::new(CountingPrompter(prompts.clone())));

        let err = session.call_tool("delete_all", None).await.unwrap_err();
        assert!(matches!(err, McpError::ApprovalDenied { .. }));
        assert_eq!(prompts.load(Ordering::SeqCst), 1);

        // Nothing reached the transport.
        drop(session);
        assert!(pumps.outbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_plain_session_selected_when_disabled() {
        let prompts = Arc::new(AtomicUsize::new(0));
        let (channels, mut pumps) = channel_pair();
        let session = build_session_with_prompter(
            channels,
            &ClientOptions::default(),
            Box::new(CountingPrompter(prompts.clone())),
        );

        let server = tokio::spawn(async move {
            let Some(JsonRpcMessage::Request(request)) = pumps.outbound.recv().await else {
                return;
            };
            let reply = JsonRpcResponse::new(request.id, json!({"content": []}));
            let _ = pumps.inbound.send(Ok(reply.into())).await;
        });

        session.call_tool("delete_all", None).await.unwrap();
        assert_eq!(prompts.load(Ordering::SeqCst), 0);
        server.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connection_close_is_idempotent() {
        let config = StdioServerConfig::new("cat", Vec::<String>::new());
        let mut connection = connect_stdio(&config, StderrSink::Null, &ClientOptions::default())
            .await
            .unwrap();
        assert!(connection.session().is_ok());

        connection.close().await.unwrap();
        connection.close().await.unwrap();
        assert!(matches!(connection.session(), Err(McpError::StreamClosed)));
        assert!(!connection.transport().is_connected());
    }
}
