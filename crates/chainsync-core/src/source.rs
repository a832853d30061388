//! Source declarations — a filter plus the user-facing metadata the engine
//! carries through to the downstream indexing layer.

use alloy_json_abi::JsonAbi;
use serde::{Deserialize, Serialize};

use crate::filter::Filter;

/// A user-declared source: what to index and what to call it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    /// Contract or tick name (e.g. `"ERC20"`, `"OddBlocks"`).
    pub name: String,
    /// Network the source lives on (e.g. `"mainnet"`).
    pub network_name: String,
    pub filter: Filter,
    /// ABI for log sources; `None` for block sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abi: Option<JsonAbi>,
}

impl Source {
    pub fn chain_id(&self) -> u64 {
        self.filter.chain_id()
    }

    /// The filter's stable cache id.
    pub fn filter_id(&self) -> String {
        self.filter.id()
    }
}
