//! Checkpoint codec — the global ordering key for every event.
//!
//! A checkpoint is a fixed-width decimal string whose zero-padded fields are
//! laid out so that lexical comparison of the encoded form agrees with tuple
//! comparison of the decoded form:
//!
//! ```text
//! blockTimestamp(10) | chainId(16) | blockNumber(16) | txIndex(16) | eventType(1) | eventIndex(16)
//! ```

use crate::error::SyncError;

/// Total encoded width: 10 + 16 + 16 + 16 + 1 + 16.
pub const CHECKPOINT_LEN: usize = 75;

/// Transaction-index sentinel for block events, so a block event sorts after
/// every log event in its block.
pub const BLOCK_TX_INDEX: u64 = 9_999_999_999_999_999;

/// The event-type digit for both log and block events.
pub const EVENT_TYPE: u8 = 5;

/// An event's position in the global, cross-chain stream.
///
/// Field order matters: the derived `Ord` is the tuple order the encoding
/// preserves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Checkpoint {
    pub block_timestamp: u64,
    pub chain_id: u64,
    pub block_number: u64,
    pub transaction_index: u64,
    pub event_type: u8,
    pub event_index: u64,
}

/// The all-zeros sentinel (sorts before every real checkpoint).
pub const ZERO: Checkpoint = Checkpoint {
    block_timestamp: 0,
    chain_id: 0,
    block_number: 0,
    transaction_index: 0,
    event_type: 0,
    event_index: 0,
};

/// The all-nines sentinel (sorts after every real checkpoint).
pub const MAX: Checkpoint = Checkpoint {
    block_timestamp: 9_999_999_999,
    chain_id: 9_999_999_999_999_999,
    block_number: 9_999_999_999_999_999,
    transaction_index: 9_999_999_999_999_999,
    event_type: 9,
    event_index: 9_999_999_999_999_999,
};

impl Checkpoint {
    /// Encode to the 75-char decimal form.
    ///
    /// Field overflow (e.g. a block number with more than 16 digits) is a
    /// programmer error.
    pub fn encode(&self) -> String {
        debug_assert!(self.block_timestamp <= 9_999_999_999);
        debug_assert!(self.chain_id <= 9_999_999_999_999_999);
        debug_assert!(self.block_number <= 9_999_999_999_999_999);
        debug_assert!(self.transaction_index <= 9_999_999_999_999_999);
        debug_assert!(self.event_type <= 9);
        debug_assert!(self.event_index <= 9_999_999_999_999_999);

        format!(
            "{:010}{:016}{:016}{:016}{:01}{:016}",
            self.block_timestamp,
            self.chain_id,
            self.block_number,
            self.transaction_index,
            self.event_type,
            self.event_index,
        )
    }

    /// Decode an encoded checkpoint. Used by tests and realtime reporting.
    pub fn decode(s: &str) -> Result<Self, SyncError> {
        if s.len() != CHECKPOINT_LEN || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SyncError::Malformed {
                entity: "checkpoint",
                reason: format!("expected {CHECKPOINT_LEN} decimal digits, got {s:?}"),
            });
        }
        let field = |range: std::ops::Range<usize>| -> u64 {
            // Already validated as ASCII digits; 16 decimal digits fit in u64.
            s[range].parse().unwrap_or(0)
        };
        Ok(Self {
            block_timestamp: field(0..10),
            chain_id: field(10..26),
            block_number: field(26..42),
            transaction_index: field(42..58),
            event_type: field(58..59) as u8,
            event_index: field(59..75),
        })
    }
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}
