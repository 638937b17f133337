//! Interactive approval for mutating tool calls.
//!
//! A tool call is treated as mutating when its name contains one of the
//! policy's keywords (case-insensitive). This is a name heuristic only: a
//! read-only tool called `rewrite_view` is gated, and a destructive tool
//! called `purge` is not. The behaviour is kept as is; do not rely on it as a
//! safety boundary.

use crate::error::{McpError, McpResult};
use crate::protocol::{
    CallToolResult, InitializeResult, ListResourcesResult, ListToolsResult, ReadResourceResult,
};
use crate::session::McpSession;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Keywords that mark a tool name as mutating by default.
pub const DEFAULT_MUTATING_KEYWORDS: &[&str] = &["write", "delete", "update", "create", "modify"];

/// Name-based classification of a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolClass {
    Mutating,
    NonMutating,
}

/// Classify `name` against `keywords` by case-insensitive substring match.
pub fn classify<'a, I>(name: &str, keywords: I) -> ToolClass
where
    I: IntoIterator<Item = &'a str>,
{
    let name = name.to_lowercase();
    if keywords
        .into_iter()
        .any(|keyword| name.contains(&keyword.to_lowercase()))
    {
        ToolClass::Mutating
    } else {
        ToolClass::NonMutating
    }
}

/// Whether and for which tools to ask before calling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalPolicy {
    pub enabled: bool,
    /// Lowercased keywords.
    pub keywords: BTreeSet<String>,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self::with_keywords(DEFAULT_MUTATING_KEYWORDS.iter().copied())
    }
}

impl ApprovalPolicy {
    /// A disabled policy with a custom keyword set.
    pub fn with_keywords<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            enabled: false,
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().to_lowercase())
                .collect(),
        }
    }

    /// The default keywords with approval turned on.
    pub fn cli() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn classify(&self, name: &str) -> ToolClass {
        classify(name, self.keywords.iter().map(String::as_str))
    }

    /// Whether calling `name` needs confirmation under this policy.
    pub fn requires_approval(&self, name: &str) -> bool {
        self.enabled && self.classify(name) == ToolClass::Mutating
    }
}

/// Asks the user one question and returns one line of answer.
#[async_trait]
pub trait Prompter: Send {
    /// Show `prompt` and read a line. `Ok(None)` means end of input.
    async fn ask(&mut self, prompt: &str) -> std::io::Result<Option<String>>;
}

/// Prompts on the process's stdout and reads the answer from stdin.
pub struct ConsolePrompter {
    input: BufReader<tokio::io::Stdin>,
    output: tokio::io::Stdout,
}

impl ConsolePrompter {
    pub fn new() -> Self {
        Self {
            input: BufReader::new(tokio::io::stdin()),
            output: tokio::io::stdout(),
        }
    }
}

impl Default for ConsolePrompter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prompter for ConsolePrompter {
    async fn ask(&mut self, prompt: &str) -> std::io::Result<Option<String>> {
        self.output.write_all(prompt.as_bytes()).await?;
        self.output.flush().await?;

        let mut line = String::new();
        if self.input.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        Ok(Some(line))
    }
}

#[derive(Serialize)]
struct CallDetails<'a> {
    tool_name: &'a str,
    arguments: &'a Value,
}

/// The prompt shown for a gated call.
pub fn approval_prompt(name: &str, arguments: Option<&Value>) -> String {
    let empty = json!({});
    let details = CallDetails {
        tool_name: name,
        arguments: arguments.unwrap_or(&empty),
    };
    let details = serde_json::to_string(&details).unwrap_or_default();
    format!("Approve MCUP tool call?\nDetails: {details}\n(y/n): ")
}

/// Only a lone `y`, in either case and ignoring surrounding whitespace, approves.
fn is_approval(answer: &str) -> bool {
    answer.trim().eq_ignore_ascii_case("y")
}

/// Session decorator that confirms mutating tool calls before forwarding them.
pub struct ApprovalSession<S> {
    inner: S,
    policy: ApprovalPolicy,
    prompter: Mutex<Box<dyn Prompter>>,
}

impl<S: McpSession> ApprovalSession<S> {
    pub fn new(inner: S, policy: ApprovalPolicy, prompter: Box<dyn Prompter>) -> Self {
        Self {
            inner,
            policy,
            prompter: Mutex::new(prompter),
        }
    }

    /// Prompt on the console.
    pub fn console(inner: S, policy: ApprovalPolicy) -> Self {
        Self::new(inner, policy, Box::new(ConsolePrompter::new()))
    }

    pub fn policy(&self) -> &ApprovalPolicy {
        &self.policy
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn confirm(&self, name: &str, arguments: Option<&Value>) -> bool {
        let prompt = approval_prompt(name, arguments);
        debug!(tool = %name, "Requesting approval for tool call");

        // One prompt at a time per session.
        let answer = self.prompter.lock().await.ask(&prompt).await;
        match answer {
            Ok(Some(answer)) => is_approval(&answer),
            Ok(None) => {
                debug!(tool = %name, "No answer, end of input");
                false
            }
            Err(e) => {
                warn!(tool = %name, error = %e, "Failed to read approval");
                false
            }
        }
    }
}

#[async_trait]
impl<S: McpSession> McpSession for ApprovalSession<S> {
    async fn initialize(&self) -> McpResult<InitializeResult> {
        self.inner.initialize().await
    }

    async fn list_tools(&self) -> McpResult<ListToolsResult> {
        self.inner.list_tools().await
    }

    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> McpResult<CallToolResult> {
        if self.policy.requires_approval(name) {
            let approved = self.confirm(name, arguments.as_ref()).await;
            info!(tool = %name, approved, "Tool call {}", if approved { "approved" } else { "denied" });
            if !approved {
                return Err(McpError::ApprovalDenied {
                    tool: name.to_string(),
                });
            }
        }
        self.inner.call_tool(name, arguments).await
    }

    async fn list_resources(&self) -> McpResult<ListResourcesResult> {
        self.inner.list_resources().await
    }

    async fn read_resource(&self, uri: &str) -> McpResult<ReadResourceResult> {
        self.inner.read_resource(uri).await
    }
}
