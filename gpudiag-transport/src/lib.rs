//! MCP transport layer: JSON-RPC 2.0 framing shared by two transports
//! (`POST /mcp` over HTTP, newline-delimited over stdio) plus the
//! liveness/readiness/metrics/version HTTP surface.

pub mod http;
pub mod jsonrpc;
pub mod session;
pub mod stdio;

pub use http::{build_router, serve, ReadinessCheck};
pub use jsonrpc::{
    handle_request, JsonRpcError, JsonRpcRequest, JsonRpcResponse, ToolCallOutcome,
    ToolDescriptor, ToolDispatch,
};
pub use session::SessionStore;
