//! Request/response session over a pair of transport channels.

use crate::config::ClientOptions;
use crate::error::{McpError, McpResult};
use crate::protocol::{
    CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult,
    JsonRpcErrorResponse, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ListResourcesResult, ListToolsResult, ReadResourceParams, ReadResourceResult, RequestId,
    METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_NOT_FOUND, METHOD_PING, METHOD_RESOURCES_LIST,
    METHOD_RESOURCES_READ, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
};
use crate::framing::Frame;
use crate::transport::SessionChannels;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Operations a client performs against a server.
#[async_trait]
pub trait McpSession: Send + Sync {
    /// Handshake: `initialize`, then the `initialized` notification.
    async fn initialize(&self) -> McpResult<InitializeResult>;

    async fn list_tools(&self) -> McpResult<ListToolsResult>;

    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> McpResult<CallToolResult>;

    async fn list_resources(&self) -> McpResult<ListResourcesResult>;

    async fn read_resource(&self, uri: &str) -> McpResult<ReadResourceResult>;
}

/// Session state shared between callers and the dispatcher.
struct Shared {
    pending: Mutex<HashMap<RequestId, oneshot::Sender<McpResult<Value>>>>,
    closed: AtomicBool,
}

/// The plain session: sends requests and routes responses back by id.
pub struct ClientSession {
    outbound: mpsc::Sender<JsonRpcMessage>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    request_timeout: Option<Duration>,
    client_info: Implementation,
    dispatcher: JoinHandle<()>,
}

impl ClientSession {
    /// Bind a session to a transport's channels and start dispatching.
    pub fn new(channels: SessionChannels, options: &ClientOptions) -> Self {
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        // Weak, so the outbound channel closes as soon as the session is dropped.
        let replies = channels.outbound.downgrade();
        let dispatcher = tokio::spawn(dispatch(channels.inbound, replies, shared.clone()));

        Self {
            outbound: channels.outbound,
            shared,
            next_id: AtomicU64::new(1),
            request_timeout: options.request_timeout,
            client_info: options.client_info.clone(),
            dispatcher,
        }
    }

    /// Whether the server side has gone away.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst) as i64)
    }

    /// Send a request and wait for its raw result.
    pub async fn request_value(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        let id = self.next_request_id();
        let (tx, rx) = oneshot::channel();

        {
            // Checked under the lock so a concurrent close cannot strand this entry.
            let mut pending = self.shared.pending.lock().await;
            if self.is_closed() {
                return Err(McpError::StreamClosed);
            }
            pending.insert(id.clone(), tx);
        }

        debug!(id = %id, method, "Sending request");
        let request = JsonRpcRequest::new(id.clone(), method, params);
        if self.outbound.send(request.into()).await.is_err() {
            self.shared.pending.lock().await.remove(&id);
            return Err(McpError::StreamClosed);
        }

        let response = match self.request_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(response) => response,
                Err(_) => {
                    self.shared.pending.lock().await.remove(&id);
                    warn!(id = %id, method, "Request timed out");
                    return Err(McpError::Timeout);
                }
            },
            None => rx.await,
        };

        response.map_err(|_| McpError::StreamClosed)?
    }

    /// Send a request and decode its result.
    pub async fn request<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> McpResult<R> {
        let value = self.request_value(method, params).await?;
        serde_json::from_value(value)
            .map_err(|e| McpError::protocol_error(format!("Invalid {method} result: {e}")))
    }

    /// Send a notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        if self.is_closed() {
            return Err(McpError::StreamClosed);
        }
        self.outbound
            .send(JsonRpcNotification::new(method, params).into())
            .await
            .map_err(|_| McpError::StreamClosed)
    }
}

#[async_trait]
impl McpSession for ClientSession {
    async fn initialize(&self) -> McpResult<InitializeResult> {
        let params = serde_json::to_value(InitializeParams::new(self.client_info.clone()))?;
        let result: InitializeResult = self.request(METHOD_INITIALIZE, Some(params)).await?;

        debug!(
            protocol_version = %result.protocol_version,
            server_name = %result.server_info.name,
            "Server initialized"
        );

        self.notify(METHOD_INITIALIZED, None).await?;
        Ok(result)
    }

    async fn list_tools(&self) -> McpResult<ListToolsResult> {
        self.request(METHOD_TOOLS_LIST, None).await
    }

    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> McpResult<CallToolResult> {
        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
        })?;
        self.request(METHOD_TOOLS_CALL, Some(params)).await
    }

    async fn list_resources(&self) -> McpResult<ListResourcesResult> {
        self.request(METHOD_RESOURCES_LIST, None).await
    }

    async fn read_resource(&self, uri: &str) -> McpResult<ReadResourceResult> {
        let params = serde_json::to_value(ReadResourceParams {
            uri: uri.to_string(),
        })?;
        self.request(METHOD_RESOURCES_READ, Some(params)).await
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

/// Route inbound frames until the transport closes the channel.
async fn dispatch(
    mut inbound: mpsc::Receiver<Frame>,
    replies: mpsc::WeakSender<JsonRpcMessage>,
    shared: Arc<Shared>,
) {
    while let Some(frame) = inbound.recv().await {
        match frame {
            Ok(JsonRpcMessage::Response(response)) => {
                complete(&shared, &response.id, Ok(response.result)).await;
            }
            Ok(JsonRpcMessage::Error(response)) => match response.id {
                Some(id) => {
                    let error = McpError::Rpc {
                        code: response.error.code,
                        message: response.error.message,
                    };
                    complete(&shared, &id, Err(error)).await;
                }
                None => warn!(
                    code = response.error.code,
                    message = %response.error.message,
                    "Server reported an error without a request id"
                ),
            },
            Ok(JsonRpcMessage::Request(request)) => {
                let reply: JsonRpcMessage = if request.method == METHOD_PING {
                    JsonRpcResponse::new(request.id, json!({})).into()
                } else {
                    debug!(method = %request.method, "Rejecting server request");
                    JsonRpcErrorResponse::new(request.id, METHOD_NOT_FOUND, "Method not found")
                        .into()
                };
                // Never wait on outbound here: the dispatcher must keep
                // reading inbound, and must not hold the channel open.
                if let Some(outbound) = replies.upgrade() {
                    if let Err(mpsc::error::TrySendError::Full(_)) = outbound.try_send(reply) {
                        warn!("Outbound channel full, dropping reply to server request");
                    }
                }
            }
            Ok(JsonRpcMessage::Notification(notification)) => {
                debug!(method = %notification.method, "Server notification");
            }
            Err(e) => warn!(error = %e, "Skipping undecodable message from server"),
        }
    }

    info!("Server stream closed");
    let mut pending = shared.pending.lock().await;
    shared.closed.store(true, Ordering::SeqCst);
    // Dropping the senders resolves every waiting caller with StreamClosed.
    pending.clear();
}

async fn complete(shared: &Shared, id: &RequestId, result: McpResult<Value>) {
    match shared.pending.lock().await.remove(id) {
        Some(tx) => {
            let _ = tx.send(result);
        }
        None => debug!(id = %id, "Response for unknown request"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{channel_pair, PumpChannels, CHANNEL_CAPACITY};

    /// Answer requests on the pump side with `respond`.
    fn serve<F>(mut pumps: PumpChannels, respond: F) -> JoinHandle<Vec<JsonRpcMessage>>
    where
        F: Fn(&JsonRpcRequest) -> Option<JsonRpcMessage> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(message) = pumps.outbound.recv().await {
                if let JsonRpcMessage::Request(ref request) = message {
                    if let Some(reply) = respond(request) {
                        if pumps.inbound.send(Ok(reply)).await.is_err() {
                            break;
                        }
                    }
                }
                seen.push(message);
            }
            seen
        })
    }

    fn tools_fixture(request: &JsonRpcRequest) -> Option<JsonRpcMessage> {
        let result = match request.method.as_str() {
            METHOD_INITIALIZE => json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "fixture", "version": "1.0"}
            }),
            METHOD_TOOLS_LIST => json!({"tools": [{"name": "fetch"}, {"name": "write_data"}]}),
            METHOD_TOOLS_CALL => json!({"content": [{"type": "text", "text": "done"}]}),
            _ => {
                return Some(
                    JsonRpcErrorResponse::new(request.id.clone(), METHOD_NOT_FOUND, "nope").into(),
                )
            }
        };
        Some(JsonRpcResponse::new(request.id.clone(), result).into())
    }

    #[tokio::test]
    async fn test_initialize_sends_initialized_notification() {
        let (channels, pumps) = channel_pair();
        let server = serve(pumps, tools_fixture);
        let session = ClientSession::new(channels, &ClientOptions::default());

        let result = session.initialize().await.unwrap();
        assert_eq!(result.server_info.name, "fixture");

        drop(session);
        let seen = server.await.unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].method(), Some(METHOD_INITIALIZE));
        assert!(matches!(
            &seen[1],
            JsonRpcMessage::Notification(n) if n.method == METHOD_INITIALIZED
        ));
    }

    #[tokio::test]
    async fn test_list_and_call() {
        let (channels, pumps) = channel_pair();
        let _server = serve(pumps, tools_fixture);
        let session = ClientSession::new(channels, &ClientOptions::default());

        let tools = session.list_tools().await.unwrap();
        let names: Vec<_> = tools.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["fetch", "write_data"]);

        let result = session.call_tool("fetch", Some(json!({"url": "x"}))).await.unwrap();
        assert_eq!(result.content.len(), 1);
        assert!(!result.is_error);
    }

    #[tokio::test]
    async fn test_rpc_error_is_returned() {
        let (channels, pumps) = channel_pair();
        let _server = serve(pumps, tools_fixture);
        let session = ClientSession::new(channels, &ClientOptions::default());

        let err = session.list_resources().await.unwrap_err();
        assert!(matches!(err, McpError::Rpc { code: METHOD_NOT_FOUND, .. }));
    }

    #[tokio::test]
    async fn test_pending_calls_fail_when_stream_closes() {
        let (channels, mut pumps) = channel_pair();
        let session = Arc::new(ClientSession::new(channels, &ClientOptions::default()));

        let caller = {
            let session = session.clone();
            tokio::spawn(async move { session.list_tools().await })
        };

        // The request reached the transport; now the transport goes away.
        assert!(pumps.outbound.recv().await.is_some());
        drop(pumps);

        assert!(matches!(caller.await.unwrap(), Err(McpError::StreamClosed)));
        assert!(session.is_closed());
        assert!(matches!(session.list_tools().await, Err(McpError::StreamClosed)));
    }

    #[tokio::test]
    async fn test_server_ping_is_answered() {
        let (channels, mut pumps) = channel_pair();
        let _session = ClientSession::new(channels, &ClientOptions::default());

        let ping = JsonRpcRequest::new(RequestId::String("p1".into()), METHOD_PING, None);
        pumps.inbound.send(Ok(ping.into())).await.unwrap();
        let reply = pumps.outbound.recv().await.unwrap();
        assert!(matches!(
            reply,
            JsonRpcMessage::Response(r) if r.id == RequestId::String("p1".into())
        ));

        let other = JsonRpcRequest::new(9, "sampling/createMessage", None);
        pumps.inbound.send(Ok(other.into())).await.unwrap();
        let reply = pumps.outbound.recv().await.unwrap();
        assert!(matches!(
            reply,
            JsonRpcMessage::Error(e) if e.error.code == METHOD_NOT_FOUND
        ));
    }

    #[tokio::test]
    async fn test_full_outbound_does_not_stall_responses() {
        let (channels, mut pumps) = channel_pair();
        let session = Arc::new(ClientSession::new(channels, &ClientOptions::default()));

        let caller = {
            let session = session.clone();
            tokio::spawn(async move { session.list_tools().await })
        };
        let Some(JsonRpcMessage::Request(request)) = pumps.outbound.recv().await else {
            panic!("expected a request");
        };

        // Nobody drains outbound from here on.
        let pings = CHANNEL_CAPACITY + 4;
        for n in 0..pings {
            let ping = JsonRpcRequest::new(RequestId::Number(1000 + n as i64), METHOD_PING, None);
            pumps.inbound.send(Ok(ping.into())).await.unwrap();
        }
        pumps
            .inbound
            .send(Ok(JsonRpcResponse::new(request.id, json!({"tools": []})).into()))
            .await
            .unwrap();

        let listed = tokio::time::timeout(Duration::from_secs(5), caller)
            .await
            .expect("response stalled behind ping replies");
        assert!(listed.unwrap().unwrap().tools.is_empty());

        drop(session);
        let mut replies = 0;
        while pumps.outbound.recv().await.is_some() {
            replies += 1;
        }
        assert_eq!(replies, CHANNEL_CAPACITY);
    }

    #[tokio::test]
    async fn test_transport_errors_are_skipped() {
        let (channels, mut pumps) = channel_pair();
        let session = Arc::new(ClientSession::new(channels, &ClientOptions::default()));

        let caller = {
            let session = session.clone();
            tokio::spawn(async move { session.list_tools().await })
        };

        let Some(JsonRpcMessage::Request(request)) = pumps.outbound.recv().await else {
            panic!("expected a request");
        };
        pumps
            .inbound
            .send(Err(crate::error::TransportError::Decode("bad".into())))
            .await
            .unwrap();
        pumps
            .inbound
            .send(Ok(JsonRpcResponse::new(request.id, json!({"tools": []})).into()))
            .await
            .unwrap();

        assert!(caller.await.unwrap().unwrap().tools.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout() {
        let (channels, _pumps) = channel_pair();
        let options = ClientOptions::default().with_request_timeout(Duration::from_secs(5));
        let session = ClientSession::new(channels, &options);

        assert!(matches!(session.list_tools().await, Err(McpError::Timeout)));
    }

    #[tokio::test]
    async fn test_dropping_session_closes_outbound() {
        let (channels, mut pumps) = channel_pair();
        let session = ClientSession::new(channels, &ClientOptions::default());
        drop(session);
        assert!(pumps.outbound.recv().await.is_none());
    }
}
