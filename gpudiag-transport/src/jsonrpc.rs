//! JSON-RPC 2.0 envelope types and the method dispatch shared by both
//! transports. Framing differs between HTTP and stdio; the
//! request/response shapes and the `initialize`/`tools/list`/`tools/call`
//! handling do not, so both transports call through [`handle_request`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

pub const PROTOCOL_VERSION: &str = "2025-06-18";

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// A tool advertised by `tools/list`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Outcome of one `tools/call` invocation: either a result document or a
/// tool-level error. Both are wrapped as MCP `content` blocks, kept out of
/// the JSON-RPC `error` field since validation/operational failures are
/// not protocol errors.
pub struct ToolCallOutcome {
    pub document: Value,
    pub is_error: bool,
}

impl ToolCallOutcome {
    pub fn ok(document: Value) -> Self {
        Self {
            document,
            is_error: false,
        }
    }

    pub fn error_text(message: impl Into<String>) -> Self {
        Self {
            document: Value::String(message.into()),
            is_error: true,
        }
    }

    pub fn error_document(document: Value) -> Self {
        Self {
            document,
            is_error: true,
        }
    }
}

/// Implemented by the binary's tool registry; kept out of `gpudiag-core`
/// and `gpudiag-dispatch` so the transport crate owns the MCP envelope
/// shape without either of those crates depending on it.
#[async_trait]
pub trait ToolDispatch: Send + Sync {
    fn list_tools(&self) -> Vec<ToolDescriptor>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        correlation_id: &str,
        token: &CancellationToken,
    ) -> ToolCallOutcome;
}

fn content_result(outcome: ToolCallOutcome) -> Value {
    let text = match &outcome.document {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    let mut result = json!({
        "content": [{"type": "text", "text": text}],
    });

    if outcome.is_error {
        result["isError"] = Value::Bool(true);
    }

    result
}

/// Handle one decoded JSON-RPC request against a tool dispatcher. Shared by
/// the HTTP and stdio transports — only request/response framing differs
/// between them.
pub async fn handle_request(
    dispatch: &dyn ToolDispatch,
    request: JsonRpcRequest,
    correlation_id: &str,
    token: &CancellationToken,
) -> JsonRpcResponse {
    match request.method.as_str() {
        "initialize" => {
            info!(correlation_id, "handshake received");
            JsonRpcResponse::success(
                request.id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "gpudiag", "version": env!("CARGO_PKG_VERSION")},
                }),
            )
        }
        "tools/list" => {
            let tools: Vec<Value> = dispatch
                .list_tools()
                .into_iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "inputSchema": t.input_schema,
                    })
                })
                .collect();
            JsonRpcResponse::success(request.id, json!({"tools": tools}))
        }
        "tools/call" => {
            let Some(name) = request.params.get("name").and_then(|n| n.as_str()) else {
                return JsonRpcResponse::error(request.id, INVALID_PARAMS, "missing tool name");
            };
            let arguments = request.params.get("arguments").cloned().unwrap_or(json!({}));

            let outcome = dispatch
                .call_tool(name, arguments, correlation_id, token)
                .await;
            JsonRpcResponse::success(request.id, content_result(outcome))
        }
        other => {
            warn!(method = other, "unrecognized JSON-RPC method");
            JsonRpcResponse::error(
                request.id,
                METHOD_NOT_FOUND,
                format!("unknown method: {other}"),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoDispatch;

    #[async_trait]
    impl ToolDispatch for EchoDispatch {
        fn list_tools(&self) -> Vec<ToolDescriptor> {
            vec![ToolDescriptor {
                name: "get_gpu_inventory".to_string(),
                description: "list GPUs".to_string(),
                input_schema: json!({"type": "object", "properties": {}}),
            }]
        }

        async fn call_tool(
            &self,
            name: &str,
            _arguments: Value,
            _correlation_id: &str,
            _token: &CancellationToken,
        ) -> ToolCallOutcome {
            if name == "boom" {
                ToolCallOutcome::error_text("invalid node_name")
            } else {
                ToolCallOutcome::ok(json!({"status": "ok"}))
            }
        }
    }

    fn request(method: &str, params: Value) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: Some("2.0".to_string()),
            id: json!(1),
            method: method.to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn initialize_returns_protocol_version() {
        let response = handle_request(&EchoDispatch, request("initialize", json!({})), "corr-1", &CancellationToken::new()).await;
        assert_eq!(
            response.result.unwrap()["protocolVersion"],
            json!(PROTOCOL_VERSION)
        );
    }

    #[tokio::test]
    async fn unknown_method_is_a_protocol_error() {
        let response = handle_request(&EchoDispatch, request("frobnicate", json!({})), "corr-1", &CancellationToken::new()).await;
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn tool_call_missing_name_is_invalid_params() {
        let response = handle_request(&EchoDispatch, request("tools/call", json!({})), "corr-1", &CancellationToken::new()).await;
        assert_eq!(response.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn validation_failure_is_a_tool_result_not_a_protocol_error() {
        let response = handle_request(
            &EchoDispatch,
            request("tools/call", json!({"name": "boom", "arguments": {}})),
            "corr-1",
            &CancellationToken::new(),
        )
        .await;
        assert!(response.error.is_none());
        let result = response.result.unwrap();
        assert_eq!(result["isError"], json!(true));
        assert!(result["content"][0]["text"].as_str().unwrap().contains("invalid node_name"));
    }
}
