//! Server launch and client configuration.

use crate::approval::ApprovalPolicy;
use crate::error::{McpError, McpResult};
use crate::protocol::Implementation;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variables inherited from the host by default.
#[cfg(windows)]
pub const DEFAULT_INHERITED_ENV_VARS: &[&str] = &[
    "APPDATA",
    "HOMEDRIVE",
    "HOMEPATH",
    "LOCALAPPDATA",
    "PATH",
    "PATHEXT",
    "PROCESSOR_ARCHITECTURE",
    "SYSTEMDRIVE",
    "SYSTEMROOT",
    "TEMP",
    "USERNAME",
    "USERPROFILE",
];

/// Environment variables inherited from the host by default.
#[cfg(not(windows))]
pub const DEFAULT_INHERITED_ENV_VARS: &[&str] = &["HOME", "LOGNAME", "PATH", "SHELL", "TERM", "USER"];

/// Time a server gets to exit on its own after its input is closed.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Build the environment a server gets when the caller supplies none.
///
/// Only allow-listed variables are copied from the host. Values that look like
/// exported shell functions (`() { ... }`) are skipped.
pub fn default_environment() -> HashMap<String, String> {
    DEFAULT_INHERITED_ENV_VARS
        .iter()
        .filter_map(|key| {
            let value = std::env::var(key).ok()?;
            if value.starts_with("()") {
                return None;
            }
            Some((key.to_string(), value))
        })
        .collect()
}

/// Text encoding used on the server's standard streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextEncoding {
    #[default]
    Utf8,
}

impl TextEncoding {
    /// Parse an encoding name.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" => Some(Self::Utf8),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Utf8 => "utf-8",
        }
    }
}

impl Serialize for TextEncoding {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TextEncoding {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Self::parse(&name)
            .ok_or_else(|| serde::de::Error::custom(format!("unsupported encoding: {name}")))
    }
}

/// What to do with byte sequences that are invalid in the configured encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodingErrorPolicy {
    /// Reject the whole line.
    #[default]
    Strict,
    /// Drop the invalid bytes.
    Ignore,
    /// Substitute U+FFFD for the invalid bytes.
    Replace,
}

/// How to launch a stdio server. Immutable once a transport is opened from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StdioServerConfig {
    /// The executable to run.
    pub command: String,

    /// Command line arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment, merged over [`default_environment`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,

    /// Working directory for the process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Text encoding of the message stream.
    #[serde(default)]
    pub encoding: TextEncoding,

    /// Handling of invalid byte sequences.
    #[serde(default, alias = "encoding_error_handler")]
    pub encoding_error_handler: EncodingErrorPolicy,
}

impl StdioServerConfig {
    /// Create a configuration for `command args...`.
    pub fn new(command: impl Into<String>, args: Vec<impl Into<String>>) -> Self {
        Self {
            command: command.into(),
            args: args.into_iter().map(|a| a.into()).collect(),
            env: None,
            cwd: None,
            encoding: TextEncoding::default(),
            encoding_error_handler: EncodingErrorPolicy::default(),
        }
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Set the working directory.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Set the encoding error policy.
    pub fn with_encoding_errors(mut self, policy: EncodingErrorPolicy) -> Self {
        self.encoding_error_handler = policy;
        self
    }

    /// The environment the process is started with.
    pub fn effective_env(&self) -> HashMap<String, String> {
        let mut env = default_environment();
        if let Some(extra) = &self.env {
            env.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        env
    }
}

/// Options shared by every connection, whatever the transport.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Approval gating for mutating tool calls.
    pub approval: ApprovalPolicy,
    /// Per-request read timeout. `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    /// Grace period between closing server input and forced termination.
    pub shutdown_grace: Duration,
    /// Identity sent in `initialize`.
    pub client_info: Implementation,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            approval: ApprovalPolicy::default(),
            request_timeout: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            client_info: Implementation::default(),
        }
    }
}

impl ClientOptions {
    pub fn with_approval(mut self, approval: ApprovalPolicy) -> Self {
        self.approval = approval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// A named server entry in a config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerEntry {
    Stdio(StdioServerConfig),
    #[serde(alias = "ws")]
    Websocket { url: String },
}

/// Approval settings as written in a config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Replaces the default keyword set when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,
}

/// On-disk client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(default)]
    pub servers: HashMap<String, ServerEntry>,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_grace_secs: Option<f64>,
}

impl ClientConfig {
    /// Load a JSON config file.
    pub async fn load(path: &Path) -> McpResult<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            McpError::config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    /// Parse config from a JSON string.
    pub fn parse(content: &str) -> McpResult<Self> {
        serde_json::from_str(content).map_err(|e| McpError::config(format!("Invalid config: {e}")))
    }

    /// Look up a server by name.
    pub fn server(&self, name: &str) -> McpResult<&ServerEntry> {
        self.servers
            .get(name)
            .ok_or_else(|| McpError::config(format!("Unknown server: {name}")))
    }

    /// Build connection options from this config.
    pub fn client_options(&self) -> ClientOptions {
        let mut approval = match &self.approval.keywords {
            Some(keywords) => ApprovalPolicy::with_keywords(keywords.iter().cloned()),
            None => ApprovalPolicy::default(),
        };
        approval.enabled = self.approval.enabled;

        let mut options = ClientOptions::default().with_approval(approval);
        if let Some(secs) = self.request_timeout_secs {
            options.request_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(secs) = self.shutdown_grace_secs.filter(|s| s.is_finite() && *s >= 0.0) {
            options.shutdown_grace = Duration::from_secs_f64(secs);
        }
        options
    }
}
