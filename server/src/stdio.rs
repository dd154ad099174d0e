//! Line-delimited JSON-RPC 2.0 transport over stdin/stdout.
//!
//! Each request names a tool by its canonical name; the params object is
//! handed to the dispatcher untouched. Notifications (no id) are accepted
//! and produce no response.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tool_protocol::{success_envelope, ToolHandler};
use tracing::{debug, error, info, warn};

pub struct StdioServer {
    handler: ToolHandler,
}

impl StdioServer {
    pub fn new(handler: ToolHandler) -> Self {
        Self { handler }
    }

    /// Serve until stdin closes.
    pub async fn serve(self) -> Result<()> {
        info!("Serving tool calls over stdio");

        let stdin = tokio::io::stdin();
        let mut stdout = tokio::io::stdout();
        let mut reader = BufReader::new(stdin);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    info!("stdin closed, shutting down");
                    break;
                }
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    if let Some(response) = self.process_line(trimmed).await {
                        let serialized = serde_json::to_string(&response)
                            .context("Failed to serialize response")?;
                        stdout
                            .write_all(serialized.as_bytes())
                            .await
                            .context("Failed to write response")?;
                        stdout.write_all(b"\n").await.context("Failed to write newline")?;
                        stdout.flush().await.context("Failed to flush stdout")?;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Error reading stdin");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn process_line(&self, line: &str) -> Option<Value> {
        let message: Value = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Unparseable request line");
                return Some(json!({
                    "jsonrpc": "2.0",
                    "error": { "code": -32700, "message": format!("Parse error: {e}") },
                    "id": null,
                }));
            }
        };

        let id = message.get("id").cloned();
        let is_notification = id.is_none();

        if message.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            if is_notification {
                return None;
            }
            return Some(json!({
                "jsonrpc": "2.0",
                "error": { "code": -32600, "message": "Invalid JSON-RPC version" },
                "id": id,
            }));
        }

        let Some(method) = message.get("method").and_then(Value::as_str) else {
            if is_notification {
                return None;
            }
            return Some(json!({
                "jsonrpc": "2.0",
                "error": { "code": -32600, "message": "Missing 'method' field" },
                "id": id,
            }));
        };
        let params = message
            .get("params")
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

        debug!(method, "tool call received");

        // Transport handshake, separate from the tool surface
        if method == "initialize" {
            return Some(success_envelope(
                id,
                json!({
                    "serverInfo": {
                        "name": "cadence",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            ));
        }

        match self.handler.dispatch(method, params).await {
            Ok(result) => {
                if is_notification {
                    None
                } else {
                    Some(success_envelope(id, result))
                }
            }
            Err(rpc_error) => {
                if is_notification {
                    warn!(method, error = %rpc_error, "notification failed");
                    None
                } else {
                    Some(rpc_error.to_json_rpc_error(id))
                }
            }
        }
    }
}
