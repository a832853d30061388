//! Transport-level error types.

use thiserror::Error;

use crate::request::JsonRpcError;

/// Errors that can occur during an RPC transport operation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed (connection refused, timeout, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// JSON-RPC protocol-level error returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// Response could not be deserialized into the expected shape.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// The transport was shut down while the request was in flight.
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Returns `true` if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) => true,
            // -32005 / 429-style limit errors are retryable; execution errors
            // are not.
            Self::Rpc(err) => err.code == -32005,
            Self::Deserialization(_) | Self::Closed => false,
        }
    }
}
