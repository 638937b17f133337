//! JSON-RPC tool-invocation client for mcup.
//!
//! Talks to a tool server either as a child process over stdin/stdout or over
//! a WebSocket, and layers a request/response session on top. Tool calls that
//! look mutating can be held for an interactive yes/no confirmation.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────┐   outbound   ┌───────────┐   ┌─────────┐
//! │  caller  │──▶│ ApprovalSession? │─────────────▶│ transport │──▶│ server  │
//! │          │◀──│  ClientSession   │◀─────────────│  (pumps)  │◀──│         │
//! └──────────┘   └──────────────────┘   inbound    └───────────┘   └─────────┘
//! ```
//!
//! # Supported Transports
//!
//! - **stdio**: spawned server, newline-delimited JSON on its standard streams
//! - **WebSocket**: one text frame per message, subprotocol `mcp`
//!
//! # Example
//!
//! ```no_run
//! use mcup_client::{connect_stdio, ClientOptions, McpSession, StderrSink, StdioServerConfig};
//!
//! # async fn example() -> mcup_client::McpResult<()> {
//! let config = StdioServerConfig::new("uv", vec!["run", "server.py"]);
//! let mut connection = connect_stdio(&config, StderrSink::Inherit, &ClientOptions::default()).await?;
//!
//! let session = connection.session()?;
//! session.initialize().await?;
//! for tool in session.list_tools().await?.tools {
//!     println!("{}", tool.name);
//! }
//!
//! connection.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod approval;
mod client;
pub mod config;
mod error;
mod framing;
pub mod protocol;
mod session;
pub mod shutdown;
mod stdio;
mod transport;
mod websocket;

pub use approval::{
    classify, ApprovalPolicy, ApprovalSession, ConsolePrompter, Prompter, ToolClass,
    DEFAULT_MUTATING_KEYWORDS,
};
pub use client::{
    build_session, build_session_with_prompter, connect_stdio, connect_websocket, AnyConnection,
    Connection,
};
pub use config::{
    ClientConfig, ClientOptions, EncodingErrorPolicy, ServerEntry, StdioServerConfig,
    TextEncoding,
};
pub use error::{McpError, McpResult, TransportError};
pub use framing::{Frame, Framer};
pub use session::{ClientSession, McpSession};
pub use shutdown::{PlatformTerminator, ProcessTreeTerminator, ShutdownOutcome};
pub use stdio::{ExecutableResolver, PlatformResolver, ProcessControl, StderrSink, StdioTransport};
pub use transport::{channel_pair, PumpChannels, SessionChannels, Transport, CHANNEL_CAPACITY};
pub use websocket::{WebSocketTransport, SUBPROTOCOL};
