//! Error types for the sync engine.

use thiserror::Error;

/// Errors that can occur while syncing chain data.
#[derive(Debug, Error)]
pub enum SyncError {
    /// RPC request failed after the transport's retry budget.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Sync store read or write failed.
    #[error("storage error: {0}")]
    Store(String),

    /// A chain object could not be interpreted (bad hex, missing field).
    #[error("malformed {entity}: {reason}")]
    Malformed { entity: &'static str, reason: String },

    /// A reorg walk crossed below the finalized block.
    #[error("reorg beyond finalized block {finalized} on chain {chain_id}")]
    ReorgBeyondFinality { chain_id: u64, finalized: u64 },

    /// ABI decoding failed for a materialized event.
    #[error("decode error for event {checkpoint}: {reason}")]
    Decode { checkpoint: String, reason: String },

    /// The sync was shut down while work was outstanding.
    #[error("sync aborted: {0}")]
    Aborted(String),
}

impl SyncError {
    /// Returns `true` for data-invariant violations that must stop the
    /// realtime pipeline rather than be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ReorgBeyondFinality { .. } | Self::Malformed { .. }
        )
    }
}
