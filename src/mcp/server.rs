//! MCP server over stdio
//!
//! Newline-delimited JSON-RPC 2.0. Every registry tool is listed under a
//! `chi_` prefix and called through the same [`ToolRegistry::dispatch`] path
//! the agent loop uses, without the chat loop. Tool failures come back as a
//! result with `isError: true`; only protocol problems are JSON-RPC errors.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::protocol::{
    error_codes, CallToolParams, JsonRpcRequest, JsonRpcResponse, McpContent, McpToolAnnotations,
    McpToolCallResult, McpToolDefinition, DEFAULT_PROTOCOL_VERSION,
};
use crate::metrics::TRANSPORT_REQUESTS;
use crate::tools::{SideEffect, ToolKind, ToolRegistry};

/// Prefix that namespaces our tools inside the client
pub const TOOL_PREFIX: &str = "chi_";

pub fn mcp_tool_name(kind: ToolKind) -> String {
    format!("{}{}", TOOL_PREFIX, kind.name())
}

/// Resolve a prefixed MCP tool name; anything else is unknown
pub fn resolve_mcp_tool(name: &str) -> Option<ToolKind> {
    name.strip_prefix(TOOL_PREFIX).and_then(ToolKind::from_name)
}

fn annotations(kind: ToolKind) -> McpToolAnnotations {
    let side_effect = kind.side_effect();
    McpToolAnnotations {
        read_only_hint: side_effect == SideEffect::ReadOnly,
        destructive_hint: side_effect == SideEffect::Destructive,
        open_world_hint: matches!(kind, ToolKind::InstallApp | ToolKind::InstallSystem),
    }
}

pub struct McpServer {
    registry: Arc<ToolRegistry>,
}

impl McpServer {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn tool_definitions(&self) -> Vec<McpToolDefinition> {
        self.registry
            .kinds()
            .iter()
            .map(|&kind| McpToolDefinition {
                name: mcp_tool_name(kind),
                description: kind.description().to_string(),
                input_schema: kind.parameters(),
                annotations: annotations(kind),
            })
            .collect()
    }

    /// Serve until the reader hits EOF
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!(tools = self.registry.kinds().len(), "MCP server ready");
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            if let Some(response) = self.handle_line(&line).await {
                let mut encoded = serde_json::to_string(&response)?;
                encoded.push('\n');
                writer.write_all(encoded.as_bytes()).await?;
                writer.flush().await?;
            }
        }
        info!("MCP client closed stdin");
        Ok(())
    }

    /// Handle one raw message; `None` for notifications
    pub async fn handle_line(&self, line: &str) -> Option<JsonRpcResponse> {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Unparseable MCP message");
                return Some(JsonRpcResponse::failure(
                    Value::Null,
                    error_codes::PARSE_ERROR,
                    format!("parse error: {}", e),
                ));
            }
        };
        let id = value.get("id").cloned().unwrap_or(Value::Null);
        let request: JsonRpcRequest = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                return Some(JsonRpcResponse::failure(
                    id,
                    error_codes::INVALID_REQUEST,
                    format!("invalid request: {}", e),
                ))
            }
        };
        self.handle_request(request).await
    }

    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        TRANSPORT_REQUESTS
            .with_label_values(&["mcp", &request.method])
            .inc();
        debug!(method = %request.method, "MCP request");

        if request.is_notification() {
            // notifications/initialized, notifications/cancelled, ...
            return None;
        }
        let id = request.id.clone().unwrap_or(Value::Null);
        let params = request.params.unwrap_or_else(|| json!({}));

        let response = match request.method.as_str() {
            "initialize" => {
                let protocol = params
                    .get("protocolVersion")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_PROTOCOL_VERSION);
                JsonRpcResponse::success(
                    id,
                    json!({
                        "protocolVersion": protocol,
                        "capabilities": { "tools": { "listChanged": false } },
                        "serverInfo": {
                            "name": "chi-agent",
                            "version": env!("CARGO_PKG_VERSION")
                        }
                    }),
                )
            }
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => JsonRpcResponse::success(id, json!({ "tools": self.tool_definitions() })),
            "tools/call" => self.call_tool(id, params).await,
            other => JsonRpcResponse::failure(
                id,
                error_codes::METHOD_NOT_FOUND,
                format!("method not found: {}", other),
            ),
        };
        Some(response)
    }

    async fn call_tool(&self, id: Value, params: Value) -> JsonRpcResponse {
        let params: CallToolParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => {
                return JsonRpcResponse::failure(id, error_codes::INVALID_PARAMS, format!("invalid params: {}", e))
            }
        };
        let Some(kind) = resolve_mcp_tool(&params.name) else {
            return JsonRpcResponse::failure(
                id,
                error_codes::INVALID_PARAMS,
                format!("unknown tool: {}", params.name),
            );
        };

        let dispatch = self.registry.dispatch(kind.name(), &params.arguments).await;
        let payload = dispatch.payload();
        let text = serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string());
        let result = McpToolCallResult {
            content: vec![McpContent::Text { text }],
            structured_content: payload,
            is_error: dispatch.is_error(),
        };
        match serde_json::to_value(result) {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(e) => JsonRpcResponse::failure(id, error_codes::INVALID_REQUEST, e.to_string()),
        }
    }
}
