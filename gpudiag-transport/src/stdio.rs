//! Stdio transport: newline-delimited JSON-RPC over stdin/stdout. Logs MUST
//! go to stderr exclusively — the binary's logging setup is responsible for
//! that; this module only ever writes JSON-RPC response lines to stdout.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::jsonrpc::{self, JsonRpcRequest, JsonRpcResponse, ToolDispatch, PARSE_ERROR};

/// Decode and handle one line, returning the serialized response line and
/// whether the request was a `tools/call` (relevant to single-shot mode).
async fn process_line(
    dispatch: &dyn ToolDispatch,
    line: &str,
    token: &CancellationToken,
) -> (String, bool) {
    let correlation_id = Uuid::new_v4().to_string();

    let (response, was_tool_call) = match serde_json::from_str::<JsonRpcRequest>(line) {
        Ok(request) => {
            let was_tool_call = request.method == "tools/call";
            let response = jsonrpc::handle_request(dispatch, request, &correlation_id, token).await;
            (response, was_tool_call)
        }
        Err(e) => {
            warn!(error = %e, "failed to parse stdio JSON-RPC line");
            (
                JsonRpcResponse::error(Value::Null, PARSE_ERROR, e.to_string()),
                false,
            )
        }
    };

    let mut line = serde_json::to_string(&response).unwrap_or_else(|_| {
        serde_json::to_string(&JsonRpcResponse::error(
            Value::Null,
            jsonrpc::INTERNAL_ERROR,
            "failed to serialize response",
        ))
        .expect("a static error response always serializes")
    });
    line.push('\n');
    (line, was_tool_call)
}

/// Run the stdio loop. In single-shot mode, exit immediately after the
/// first `tools/call` has been answered (handshake messages don't count).
pub async fn run_stdio(
    dispatch: Arc<dyn ToolDispatch>,
    token: CancellationToken,
    once: bool,
) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if token.is_cancelled() {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }

        let (response_line, was_tool_call) = process_line(dispatch.as_ref(), &line, &token).await;
        stdout.write_all(response_line.as_bytes()).await?;
        stdout.flush().await?;

        if once && was_tool_call {
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoDispatch;

    #[async_trait]
    impl ToolDispatch for EchoDispatch {
        fn list_tools(&self) -> Vec<jsonrpc::ToolDescriptor> {
            vec![]
        }

        async fn call_tool(
            &self,
            _name: &str,
            _arguments: Value,
            _correlation_id: &str,
            _token: &CancellationToken,
        ) -> jsonrpc::ToolCallOutcome {
            jsonrpc::ToolCallOutcome::ok(json!({"status": "ok"}))
        }
    }

    #[tokio::test]
    async fn malformed_json_line_yields_parse_error_response() {
        let (line, was_call) = process_line(&EchoDispatch, "not json", &CancellationToken::new()).await;
        let response: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(response["error"]["code"], json!(PARSE_ERROR));
        assert!(!was_call);
    }

    #[tokio::test]
    async fn tools_call_line_is_flagged_for_single_shot_exit() {
        let request = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": "get_gpu_inventory", "arguments": {}}});
        let (_line, was_call) = process_line(&EchoDispatch, &request.to_string(), &CancellationToken::new()).await;
        assert!(was_call);
    }

    #[tokio::test]
    async fn initialize_line_is_not_flagged_as_tool_call() {
        let request = json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}});
        let (_line, was_call) = process_line(&EchoDispatch, &request.to_string(), &CancellationToken::new()).await;
        assert!(!was_call);
    }
}
