//! Maps engine errors onto JSON-RPC error codes.

use coord_core::CoordError;
use serde_json::{json, Value};
use thiserror::Error;

/// Tool-protocol errors carried back over the JSON-RPC channel.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Cycle(String),

    #[error("{0}")]
    ArchivedTask(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RpcError {
    pub fn to_error_code(&self) -> i32 {
        match self {
            RpcError::NotFound(_) => -32001,
            RpcError::Validation(_) => -32002,
            RpcError::Cycle(_) => -32003,
            RpcError::ArchivedTask(_) => -32004,
            RpcError::Store(_) => -32005,
            RpcError::Protocol(_) => -32006,
            RpcError::Serialization(_) => -32007,
            RpcError::Config(_) => -32008,
        }
    }

    /// Full JSON-RPC 2.0 error response envelope.
    pub fn to_json_rpc_error(&self, id: Option<Value>) -> Value {
        json!({
            "jsonrpc": "2.0",
            "error": {
                "code": self.to_error_code(),
                "message": self.to_string(),
            },
            "id": id,
        })
    }
}

impl From<CoordError> for RpcError {
    fn from(err: CoordError) -> Self {
        match err {
            CoordError::NotFound(kind, id) => RpcError::NotFound(format!("{kind} not found: {id}")),
            CoordError::Validation(msg) => RpcError::Validation(msg),
            CoordError::Cycle(msg) => RpcError::Cycle(msg),
            archived @ CoordError::ArchivedTask { .. } => {
                RpcError::ArchivedTask(archived.to_string())
            }
            CoordError::Store(msg) => RpcError::Store(msg),
            CoordError::Config(msg) => RpcError::Config(msg),
            CoordError::Protocol(msg) => RpcError::Protocol(msg),
            CoordError::Serialization(msg) => RpcError::Serialization(msg),
            CoordError::Internal(msg) => RpcError::Protocol(format!("Internal error: {msg}")),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Serialization(err.to_string())
    }
}
