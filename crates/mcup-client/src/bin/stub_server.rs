//! Deterministic stdio server used by the end-to-end tests.
//!
//! Reads one JSON-RPC message per line from stdin and answers on stdout with
//! fixed fixture data. Exits when stdin closes.
//!
//! # Environment Variables
//!
//! - `MCUP_STUB_IGNORE_EOF`: when set, keep running after stdin closes, so
//!   the client has to terminate the process.
//! - `MCUP_STUB_NOISE`: when set, write a malformed line before every reply.
//!
//! # Tools
//!
//! - `fetch`: echoes its `url` argument.
//! - `write_data`: echoes its `value` argument.
//! - `fail`: returns a tool-level error result.

use futures::StreamExt;
use mcup_client::protocol::{
    JsonRpcErrorResponse, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, METHOD_INITIALIZE,
    METHOD_NOT_FOUND, METHOD_PING, METHOD_RESOURCES_LIST, METHOD_RESOURCES_READ,
    METHOD_TOOLS_CALL, METHOD_TOOLS_LIST, PROTOCOL_VERSION,
};
use mcup_client::Framer;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::FramedRead;

const INVALID_PARAMS: i64 = -32602;

fn tools() -> Value {
    json!({
        "tools": [
            {
                "name": "fetch",
                "description": "Fetch a URL",
                "inputSchema": {"type": "object", "properties": {"url": {"type": "string"}}}
            },
            {
                "name": "write_data",
                "description": "Store a value",
                "inputSchema": {"type": "object", "properties": {"value": {"type": "string"}}}
            },
            {
                "name": "fail",
                "description": "Always fails",
                "inputSchema": {"type": "object"}
            }
        ]
    })
}

fn text_result(text: String, is_error: bool) -> Value {
    json!({"content": [{"type": "text", "text": text}], "isError": is_error})
}

fn call_tool(params: Option<&Value>) -> Result<Value, String> {
    let params = params.ok_or("missing params")?;
    let name = params["name"].as_str().ok_or("missing tool name")?;
    let arguments = &params["arguments"];

    match name {
        "fetch" => Ok(text_result(
            format!("fetched {}", arguments["url"].as_str().unwrap_or_default()),
            false,
        )),
        "write_data" => Ok(text_result(
            format!("stored {}", arguments["value"].as_str().unwrap_or_default()),
            false,
        )),
        "fail" => Ok(text_result("tool failed".to_string(), true)),
        other => Err(format!("unknown tool: {other}")),
    }
}

fn handle(request: JsonRpcRequest) -> JsonRpcMessage {
    let result = match request.method.as_str() {
        METHOD_INITIALIZE => Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {}, "resources": {}},
            "serverInfo": {"name": "mcup-stub-server", "version": env!("CARGO_PKG_VERSION")}
        })),
        METHOD_PING => Ok(json!({})),
        METHOD_TOOLS_LIST => Ok(tools()),
        METHOD_TOOLS_CALL => call_tool(request.params.as_ref()),
        METHOD_RESOURCES_LIST => Ok(json!({
            "resources": [{"uri": "stub://greeting", "name": "greeting", "mimeType": "text/plain"}]
        })),
        METHOD_RESOURCES_READ => {
            let uri = request
                .params
                .as_ref()
                .and_then(|p| p["uri"].as_str())
                .unwrap_or_default();
            if uri == "stub://greeting" {
                Ok(json!({"contents": [{"uri": uri, "mimeType": "text/plain", "text": "hello"}]}))
            } else {
                Err(format!("unknown resource: {uri}"))
            }
        }
        _ => {
            return JsonRpcErrorResponse::new(request.id, METHOD_NOT_FOUND, "Method not found")
                .into()
        }
    };

    match result {
        Ok(result) => JsonRpcResponse::new(request.id, result).into(),
        Err(message) => JsonRpcErrorResponse::new(request.id, INVALID_PARAMS, message).into(),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let ignore_eof = std::env::var_os("MCUP_STUB_IGNORE_EOF").is_some();
    let noise = std::env::var_os("MCUP_STUB_NOISE").is_some();

    let framer = Framer::default();
    let mut input = FramedRead::new(tokio::io::stdin(), Framer::default());
    let mut stdout = tokio::io::stdout();

    while let Some(frame) = input.next().await {
        let reply = match frame? {
            Ok(JsonRpcMessage::Request(request)) => handle(request),
            Ok(message) => {
                eprintln!("stub: ignoring {:?}", message.method());
                continue;
            }
            Err(e) => {
                eprintln!("stub: {e}");
                continue;
            }
        };

        if noise {
            stdout.write_all(b"not json at all\n").await?;
        }
        stdout.write_all(&framer.encode_message(&reply)?).await?;
        stdout.flush().await?;
    }

    if ignore_eof {
        // Stay alive until killed.
        std::future::pending::<()>().await;
    }

    Ok(())
}
