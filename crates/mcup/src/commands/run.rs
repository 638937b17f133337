//! Commands that run against a connected server.

use anyhow::Context;
use mcup_client::protocol::{CallToolResult, ResourceContent, ToolContent};
use mcup_client::{AnyConnection, McpError, McpSession};
use serde_json::Value;

/// What to do once connected.
#[derive(Debug)]
pub enum Action {
    ListTools,
    CallTool {
        tool: String,
        arguments: Option<String>,
    },
    ListResources,
    ReadResource {
        uri: String,
    },
}

/// Initialize the session and run `action`.
pub async fn run_action(connection: &AnyConnection, action: Action) -> anyhow::Result<()> {
    let session = connection.session()?;
    let info = session.initialize().await.context("Initialization failed")?;
    tracing::debug!(server = %info.server_info.name, "Connected");

    match action {
        Action::ListTools => list_tools(session).await,
        Action::CallTool { tool, arguments } => {
            call_tool(session, &tool, arguments.as_deref()).await
        }
        Action::ListResources => list_resources(session).await,
        Action::ReadResource { uri } => read_resource(session, &uri).await,
    }
}

async fn list_tools(session: &dyn McpSession) -> anyhow::Result<()> {
    let result = session.list_tools().await?;
    if result.tools.is_empty() {
        println!("No tools available.");
        return Ok(());
    }

    for tool in result.tools {
        match tool.description {
            Some(description) => println!("{:<24} {}", tool.name, description),
            None => println!("{}", tool.name),
        }
    }
    Ok(())
}

/// Parse tool arguments given on the command line.
fn parse_arguments(arguments: Option<&str>) -> anyhow::Result<Option<Value>> {
    let Some(text) = arguments else {
        return Ok(None);
    };
    let value: Value =
        serde_json::from_str(text).context("Tool arguments must be a JSON object")?;
    if !value.is_object() {
        anyhow::bail!("Tool arguments must be a JSON object");
    }
    Ok(Some(value))
}

async fn call_tool(
    session: &dyn McpSession,
    name: &str,
    arguments: Option<&str>,
) -> anyhow::Result<()> {
    let arguments = parse_arguments(arguments)?;

    let result = match session.call_tool(name, arguments).await {
        Ok(result) => result,
        Err(e @ McpError::ApprovalDenied { .. }) => return Err(e.into()),
        Err(e) => return Err(anyhow::Error::new(e).context(format!("Tool '{name}' failed"))),
    };

    print_tool_result(&result);
    if result.is_error {
        anyhow::bail!("Tool '{name}' reported an error");
    }
    Ok(())
}

fn print_tool_result(result: &CallToolResult) {
    for item in &result.content {
        match item {
            ToolContent::Text { text } => println!("{text}"),
            ToolContent::Image { mime_type, data } => {
                println!("[image {mime_type}, {} bytes base64]", data.len())
            }
            ToolContent::Resource { resource } => print_resource(resource),
        }
    }
    if let Some(structured) = &result.structured_content {
        println!("{structured}");
    }
}

async fn list_resources(session: &dyn McpSession) -> anyhow::Result<()> {
    let result = session.list_resources().await?;
    if result.resources.is_empty() {
        println!("No resources available.");
        return Ok(());
    }

    for resource in result.resources {
        println!("{:<32} {}", resource.uri, resource.name);
    }
    Ok(())
}

async fn read_resource(session: &dyn McpSession, uri: &str) -> anyhow::Result<()> {
    let result = session.read_resource(uri).await?;
    for content in &result.contents {
        print_resource(content);
    }
    Ok(())
}

fn print_resource(content: &ResourceContent) {
    match (&content.text, &content.blob) {
        (Some(text), _) => println!("{text}"),
        (None, Some(blob)) => println!("[{} blob, {} bytes base64]", content.uri, blob.len()),
        (None, None) => println!("[{} empty]", content.uri),
    }
}
