//! HTTP transport: `POST /mcp` plus the liveness/readiness/metrics/version
//! surface. Built on the `axum`/`tokio::net::TcpListener`/`axum::serve`
//! shape used for multi-route admin surfaces elsewhere in this stack.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::jsonrpc::{self, JsonRpcRequest, JsonRpcResponse, ToolDispatch, INVALID_REQUEST, PARSE_ERROR};
use crate::session::SessionStore;

const SESSION_HEADER: &str = "Mcp-Session-Id";
const CORRELATION_HEADER: &str = "X-Correlation-Id";

/// Checked by `GET /readyz`: whether the process is ready to serve traffic.
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    async fn is_ready(&self) -> bool;
}

#[derive(Clone)]
struct AppState {
    dispatch: Arc<dyn ToolDispatch>,
    sessions: Arc<SessionStore>,
    readiness: Arc<dyn ReadinessCheck>,
}

pub fn build_router(
    dispatch: Arc<dyn ToolDispatch>,
    sessions: Arc<SessionStore>,
    readiness: Arc<dyn ReadinessCheck>,
) -> Router {
    let state = AppState {
        dispatch,
        sessions,
        readiness,
    };

    Router::new()
        .route("/mcp", post(handle_mcp))
        .route("/healthz", get(handle_healthz))
        .route("/readyz", get(handle_readyz))
        .route("/metrics", get(handle_metrics))
        .route("/version", get(handle_version))
        .with_state(state)
}

pub async fn serve(router: Router, addr: SocketAddr) -> anyhow::Result<()> {
    info!(%addr, "HTTP transport listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

async fn handle_mcp(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let correlation_id = headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "failed to parse JSON-RPC request body");
            let response = JsonRpcResponse::error(Value::Null, PARSE_ERROR, e.to_string());
            return (StatusCode::OK, Json(response)).into_response();
        }
    };

    if request.method.is_empty() {
        let response = JsonRpcResponse::error(request.id, INVALID_REQUEST, "missing method");
        return (StatusCode::OK, Json(response)).into_response();
    }

    let is_handshake = request.method == "initialize";
    let token = CancellationToken::new();
    let response = jsonrpc::handle_request(state.dispatch.as_ref(), request, &correlation_id, &token).await;

    let mut headers_out = HeaderMap::new();
    if is_handshake && response.error.is_none() {
        let client_name = response
            .result
            .as_ref()
            .and_then(|r| r.get("serverInfo"))
            .and_then(|s| s.get("name"))
            .and_then(|n| n.as_str())
            .map(|s| s.to_string());
        let session_id = state.sessions.create(client_name, None).await;
        if let Ok(value) = axum::http::HeaderValue::from_str(&session_id) {
            headers_out.insert(SESSION_HEADER, value);
        }
    }

    (StatusCode::OK, headers_out, Json(response)).into_response()
}

async fn handle_healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn handle_readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.readiness.is_ready().await {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn handle_metrics() -> impl IntoResponse {
    let families = prometheus::gather();
    match prometheus::TextEncoder::new().encode_to_string(&families) {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn handle_version() -> impl IntoResponse {
    Json(json!({"version": env!("CARGO_PKG_VERSION")}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct AlwaysReady;

    #[async_trait]
    impl ReadinessCheck for AlwaysReady {
        async fn is_ready(&self) -> bool {
            true
        }
    }

    struct StaticDispatch;

    #[async_trait]
    impl ToolDispatch for StaticDispatch {
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
            jsonrpc::ToolCallOutcome::ok(json!({}))
        }
    }

    #[tokio::test]
    async fn router_builds_without_panicking() {
        let _router = build_router(
            Arc::new(StaticDispatch),
            Arc::new(SessionStore::new()),
            Arc::new(AlwaysReady),
        );
    }
}
