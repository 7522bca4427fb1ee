//! Per-node outbound call: HTTP direct-to-pod or exec-over-API-server.
//!
//! Both routing modes present the same interface to the router: given an
//! agent pod and a JSON-RPC method/params pair, return the decoded
//! response value or a classified error. The exec path tunnels a
//! synthesized two-message conversation (handshake, then the tool call)
//! through `gpudiag_cluster::exec` and has to cope with the two replies
//! arriving back-to-back without a newline separator — the brace-depth
//! splitter below is what makes that load-bearing.

use std::time::{Duration, Instant};

use reqwest::Client as HttpClient;
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use gpudiag_cluster::{exec::exec_messages, AgentPod, K8sClient};

use crate::metrics::{observe_dispatch, CallOutcome, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMode {
    Http,
    Exec,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("agent pod has no IP assigned yet")]
    NoPodIp,
    #[error("operation cancelled")]
    Cancelled,
    #[error("exec routing requires a cluster client")]
    ExecRequiresClusterClient,
    #[error("HTTP request to agent failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("exec transport failed: {0}")]
    Exec(String),
    #[error("agent returned no response matching the request id")]
    MissingResponse,
    #[error("agent returned a JSON-RPC error: {0}")]
    RemoteError(String),
}

/// The unwrapped MCP tool result from one agent call: the document the
/// tool handler produced, and whether the agent flagged it `isError`.
/// Distinct from [`TransportError`], which means the call itself never
/// got a usable reply.
#[derive(Debug, Clone)]
pub struct AgentToolResult {
    pub document: Value,
    pub is_error: bool,
}

pub(crate) fn extract_tool_result(envelope: &Value) -> Result<AgentToolResult, TransportError> {
    if let Some(error) = envelope.get("error") {
        return Err(TransportError::RemoteError(error.to_string()));
    }

    let result = envelope.get("result").ok_or(TransportError::MissingResponse)?;
    let text = result
        .get("content")
        .and_then(|c| c.get(0))
        .and_then(|c0| c0.get("text"))
        .and_then(|t| t.as_str())
        .ok_or(TransportError::MissingResponse)?;

    let is_error = result.get("isError").and_then(|v| v.as_bool()).unwrap_or(false);
    let document = serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()));

    Ok(AgentToolResult { document, is_error })
}

pub struct TransportClient {
    http: HttpClient,
    agent_port: u16,
}

impl TransportClient {
    pub fn new(agent_port: u16, timeout: Duration) -> Self {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .expect("static reqwest client configuration is always valid");
        Self { http, agent_port }
    }

    /// Issue one proxied tool call against `agent` and return the agent's
    /// unwrapped tool result (the document plus its `isError` flag), not
    /// the raw JSON-RPC envelope. Records dispatch duration/outcome metrics
    /// regardless of which routing mode was used.
    #[allow(clippy::too_many_arguments)]
    pub async fn call(
        &self,
        mode: RoutingMode,
        agent: &AgentPod,
        cluster_client: Option<&K8sClient>,
        method: &str,
        params: Value,
        correlation_id: &str,
        token: &CancellationToken,
    ) -> Result<AgentToolResult, TransportError> {
        if token.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let started = Instant::now();
        let transport_label = match mode {
            RoutingMode::Http => Transport::Http,
            RoutingMode::Exec => Transport::Exec,
        };

        let envelope = match mode {
            RoutingMode::Http => self.call_http(agent, method, params, correlation_id).await,
            RoutingMode::Exec => {
                let cluster_client = cluster_client.ok_or(TransportError::ExecRequiresClusterClient)?;
                self.call_exec(cluster_client, agent, method, params, correlation_id, token)
                    .await
            }
        };

        let result = envelope.and_then(|envelope| extract_tool_result(&envelope));

        let outcome = if result.is_ok() {
            CallOutcome::Success
        } else {
            CallOutcome::Error
        };
        observe_dispatch(
            &agent.node_name,
            transport_label,
            outcome,
            started.elapsed().as_secs_f64(),
        );
        result
    }

    async fn call_http(
        &self,
        agent: &AgentPod,
        method: &str,
        params: Value,
        correlation_id: &str,
    ) -> Result<Value, TransportError> {
        let endpoint = agent.endpoint(self.agent_port).ok_or(TransportError::NoPodIp)?;
        let body = json!({
            "jsonrpc": "2.0",
            "id": correlation_id,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(format!("{endpoint}/mcp"))
            .header("X-Correlation-Id", correlation_id)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json::<Value>().await?)
    }

    async fn call_exec(
        &self,
        cluster: &K8sClient,
        agent: &AgentPod,
        method: &str,
        params: Value,
        correlation_id: &str,
        token: &CancellationToken,
    ) -> Result<Value, TransportError> {
        let handshake = json!({
            "jsonrpc": "2.0",
            "id": format!("{correlation_id}-init"),
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-06-18",
                "capabilities": {},
                "clientInfo": {"name": "gpudiag-gateway", "version": env!("CARGO_PKG_VERSION")},
            },
        })
        .to_string();

        let call = json!({
            "jsonrpc": "2.0",
            "id": correlation_id,
            "method": method,
            "params": params,
        })
        .to_string();

        let raw = exec_messages(
            cluster.inner(),
            &agent.pod_namespace,
            &agent.pod_name,
            None,
            &[handshake, call],
            token,
        )
        .await
        .map_err(|e| TransportError::Exec(e.to_string()))?;

        let responses = parse_concatenated_responses(&raw);
        debug!(
            node = %agent.node_name,
            response_count = responses.len(),
            "parsed exec transport replies"
        );

        responses
            .into_iter()
            .find(|v| v.get("id").and_then(|id| id.as_str()) == Some(correlation_id))
            .ok_or(TransportError::MissingResponse)
    }
}

fn parse_concatenated_responses(raw: &str) -> Vec<Value> {
    split_concatenated_json(raw)
        .iter()
        .filter_map(|chunk| serde_json::from_str(chunk).ok())
        .collect()
}

/// Split a string containing zero or more JSON objects into their
/// individual source slices, tolerating objects that are back-to-back with
/// no whitespace or newline between them. Braces inside JSON string
/// literals are ignored.
pub fn split_concatenated_json(input: &str) -> Vec<String> {
    let mut results = Vec::new();
    let mut depth: i32 = 0;
    let mut start = None;
    let mut in_string = false;
    let mut escape = false;

    for (i, ch) in input.char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        results.push(input[s..=i].to_string());
                    }
                }
            }
            _ => {}
        }
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_objects_with_no_separator() {
        let input = r#"{"a":1}{"b":2}"#;
        let chunks = split_concatenated_json(input);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], r#"{"a":1}"#);
        assert_eq!(chunks[1], r#"{"b":2}"#);
    }

    #[test]
    fn tolerates_whitespace_between_objects() {
        let input = "{\"a\":1}\n{\"b\":2}";
        let chunks = split_concatenated_json(input);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn ignores_braces_inside_string_literals() {
        let input = r#"{"text":"{not a nested object}"}{"id":"2"}"#;
        let chunks = split_concatenated_json(input);
        assert_eq!(chunks.len(), 2);
        let first: Value = serde_json::from_str(&chunks[0]).unwrap();
        assert_eq!(first["text"], json!("{not a nested object}"));
    }

    #[test]
    fn parses_two_synthesized_messages_and_finds_the_tool_call_reply() {
        let raw = r#"{"jsonrpc":"2.0","id":"corr-1-init","result":{"sessionId":"s1"}}{"jsonrpc":"2.0","id":"corr-1","result":{"ok":true}}"#;
        let responses = parse_concatenated_responses(raw);
        assert_eq!(responses.len(), 2);
        let call_reply = responses
            .into_iter()
            .find(|v| v["id"] == json!("corr-1"))
            .unwrap();
        assert_eq!(call_reply["result"]["ok"], json!(true));
    }

    #[test]
    fn extract_tool_result_unwraps_content_text_into_the_document() {
        let envelope = json!({
            "jsonrpc": "2.0",
            "id": "corr-1",
            "result": {
                "content": [{"type": "text", "text": "{\"devices\":[{\"name\":\"NVIDIA A100\"}]}"}],
                "isError": false,
            },
        });
        let tool_result = extract_tool_result(&envelope).unwrap();
        assert!(!tool_result.is_error);
        assert_eq!(tool_result.document["devices"][0]["name"], json!("NVIDIA A100"));
    }

    #[test]
    fn extract_tool_result_propagates_is_error() {
        let envelope = json!({
            "jsonrpc": "2.0",
            "id": "corr-1",
            "result": {
                "content": [{"type": "text", "text": "{\"status\":\"error\"}"}],
                "isError": true,
            },
        });
        let tool_result = extract_tool_result(&envelope).unwrap();
        assert!(tool_result.is_error);
    }

    #[test]
    fn extract_tool_result_rejects_a_protocol_level_error() {
        let envelope = json!({
            "jsonrpc": "2.0",
            "id": "corr-1",
            "error": {"code": -32601, "message": "method not found"},
        });
        assert!(matches!(extract_tool_result(&envelope), Err(TransportError::RemoteError(_))));
    }
}
