//! Chain wire types as returned by JSON-RPC, plus hex quantity helpers.
//!
//! Numbers travel as `0x`-prefixed hex strings on the wire; the engine
//! converts to decimal internally via the accessor methods. Unknown fields
//! are retained so the stored row body is the full object the node returned.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parse a hex-encoded quantity (with or without `0x`) to u64.
pub fn hex_to_u64(s: &str) -> u64 {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).unwrap_or(0)
}

/// Format a u64 as a `0x`-prefixed hex quantity.
pub fn u64_to_hex(n: u64) -> String {
    format!("0x{n:x}")
}

// ─── Block ───────────────────────────────────────────────────────────────────

/// A full block as returned by `eth_getBlockByNumber(…, true)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub hash: String,
    pub parent_hash: String,
    /// Block number (`0x…` hex).
    pub number: String,
    /// Unix timestamp (`0x…` hex).
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs_bloom: Option<String>,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
    /// Remaining block fields, kept verbatim for the stored body.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Block {
    pub fn number(&self) -> u64 {
        hex_to_u64(&self.number)
    }

    pub fn timestamp(&self) -> u64 {
        hex_to_u64(&self.timestamp)
    }

    /// The light header used for reorg tracking.
    pub fn light(&self) -> LightBlock {
        LightBlock {
            hash: self.hash.clone(),
            parent_hash: self.parent_hash.clone(),
            number: self.number(),
            timestamp: self.timestamp(),
        }
    }

    /// The block object minus its transactions, for durable storage.
    pub fn body(&self) -> Value {
        let mut stripped = self.clone();
        stripped.transactions = vec![];
        let mut value = serde_json::to_value(&stripped).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.remove("transactions");
        }
        value
    }
}

/// A minimal block header — enough for tip tracking and reorg walks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightBlock {
    pub hash: String,
    pub parent_hash: String,
    pub number: u64,
    pub timestamp: u64,
}

impl LightBlock {
    /// Returns `true` if `self` is the direct child of `parent`.
    pub fn extends(&self, parent: &LightBlock) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }
}

// ─── Transaction ─────────────────────────────────────────────────────────────

/// A transaction as embedded in a full block response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub hash: String,
    /// Containing block number (`0x…` hex).
    pub block_number: String,
    /// Position within the block (`0x…` hex).
    pub transaction_index: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Transaction {
    pub fn block_number(&self) -> u64 {
        hex_to_u64(&self.block_number)
    }

    pub fn transaction_index(&self) -> u64 {
        hex_to_u64(&self.transaction_index)
    }
}

// ─── TransactionReceipt ──────────────────────────────────────────────────────

/// A transaction receipt as returned by `eth_getTransactionReceipt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: String,
    pub block_number: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl TransactionReceipt {
    pub fn block_number(&self) -> u64 {
        hex_to_u64(&self.block_number)
    }
}

// ─── Log ─────────────────────────────────────────────────────────────────────

/// A raw log as returned by `eth_getLogs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_hash: String,
    /// Containing block number (`0x…` hex).
    pub block_number: String,
    pub transaction_hash: String,
    /// Position within the block (`0x…` hex).
    pub log_index: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed: Option<bool>,
}

impl Log {
    pub fn block_number(&self) -> u64 {
        hex_to_u64(&self.block_number)
    }

    pub fn log_index(&self) -> u64 {
        hex_to_u64(&self.log_index)
    }

    /// Topic at position `i`, if present.
    pub fn topic(&self, i: usize) -> Option<&str> {
        self.topics.get(i).map(String::as_str)
    }

    /// Returns `true` if this log was removed by a reorg.
    pub fn is_removed(&self) -> bool {
        self.removed.unwrap_or(false)
    }
}
