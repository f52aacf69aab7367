//! Transport-level error types.

use thiserror::Error;

use crate::request::JsonRpcError;

/// JSON-RPC code for "method not found".
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Errors that can occur during an RPC transport operation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// WebSocket connection/send/receive error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// JSON-RPC protocol-level error returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// Request timed out after the configured duration.
    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The client was shut down while the request was in flight.
    #[error("client is closed")]
    Closed,

    /// Payload could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An unexpected error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Returns `true` if the connection itself failed (as opposed to the node
    /// rejecting the request).
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::WebSocket(_) | Self::Timeout { .. } | Self::Closed)
    }

    /// Returns `true` if the node answered with "method not found".
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, Self::Rpc(e) if e.code == METHOD_NOT_FOUND)
    }
}
