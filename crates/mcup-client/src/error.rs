//! Client error types.

use thiserror::Error;

/// Result type for client operations.
pub type McpResult<T> = Result<T, McpError>;

/// A failure to turn one unit of wire data into a message.
///
/// Delivered in-band on the inbound channel so a single bad line never ends
/// the stream.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The line or frame was not a valid JSON-RPC message.
    #[error("Malformed message: {reason}")]
    MalformedMessage { reason: String, raw: String },

    /// The bytes could not be decoded with the configured text encoding.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The underlying stream failed; the pump stops after reporting this.
    #[error("Stream error: {0}")]
    Stream(String),
}

/// Errors that can occur during client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// The server process or connection could not be created.
    #[error("Failed to start server: {0}")]
    Spawn(String),

    /// A message failed to parse or validate.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The peer closed or the transport was torn down.
    #[error("Stream closed")]
    StreamClosed,

    /// The user declined a mutating tool call.
    #[error("User denied tool call: {tool}")]
    ApprovalDenied { tool: String },

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server answered with a JSON-RPC error.
    #[error("Server error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Request timed out waiting for a response.
    #[error("Request timed out")]
    Timeout,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
}

impl From<tokio_tungstenite::tungstenite::Error> for McpError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

impl McpError {
    /// Create a spawn error.
    pub fn spawn(message: impl Into<String>) -> Self {
        Self::Spawn(message.into())
    }

    /// Create a protocol error.
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether this error means the connection is gone rather than one call failing.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::StreamClosed)
    }
}
