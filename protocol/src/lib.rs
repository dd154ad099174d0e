//! Tool-protocol surface.
//!
//! Content-addressed tool dispatch ([`handler::ToolHandler`]), the JSON-RPC
//! error code mapping ([`error::RpcError`]), and the read-only loopback HTTP
//! mirror ([`http`]).

pub mod error;
pub mod handler;
pub mod http;

pub use error::RpcError;
pub use handler::ToolHandler;

/// Helper for the JSON-RPC transport: wrap a result value in a success
/// envelope.
pub fn success_envelope(
    id: Option<serde_json::Value>,
    result: serde_json::Value,
) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "result": result,
        "id": id,
    })
}
