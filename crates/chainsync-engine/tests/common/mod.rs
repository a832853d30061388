//! Scripted JSON-RPC fixtures for engine tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use chainsync_rpc::{RpcClient, TransportError};

/// ERC-20 `Transfer(address,address,uint256)` selector.
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// Uniswap-style `PairCreated` selector stand-in.
pub const PAIR_CREATED_TOPIC: &str =
    "0x0d3648bd0f6ba80134a33ba9275ac585d9d315f0ad8355cddefde31afa28d0e9";

/// A scripted chain served over the `RpcClient` seam.
pub struct MockChain {
    chain_id: u64,
    state: Mutex<Fixture>,
}

#[derive(Default)]
struct Fixture {
    blocks: BTreeMap<u64, Value>,
    logs: Vec<Value>,
    calls: Vec<String>,
}

impl MockChain {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            state: Mutex::new(Fixture::default()),
        }
    }

    pub fn block_hash(&self, number: u64) -> String {
        format!("0xb{}{number:04x}", self.chain_id)
    }

    /// Add a block whose transactions are exactly `tx_hashes`.
    pub fn add_block(&self, number: u64, timestamp: u64, tx_hashes: &[&str]) {
        let transactions: Vec<Value> = tx_hashes
            .iter()
            .enumerate()
            .map(|(index, hash)| {
                json!({
                    "hash": hash,
                    "blockNumber": format!("0x{number:x}"),
                    "transactionIndex": format!("0x{index:x}"),
                })
            })
            .collect();
        let block = json!({
            "hash": self.block_hash(number),
            "parentHash": self.block_hash(number.saturating_sub(1)),
            "number": format!("0x{number:x}"),
            "timestamp": format!("0x{timestamp:x}"),
            "transactions": transactions,
        });
        self.state.lock().unwrap().blocks.insert(number, block);
    }

    pub fn add_log(
        &self,
        block_number: u64,
        log_index: u64,
        address: &str,
        topics: &[&str],
        tx_hash: &str,
    ) {
        let log = json!({
            "address": address,
            "topics": topics,
            "data": "0x01",
            "blockHash": self.block_hash(block_number),
            "blockNumber": format!("0x{block_number:x}"),
            "transactionHash": tx_hash,
            "logIndex": format!("0x{log_index:x}"),
        });
        self.state.lock().unwrap().logs.push(log);
    }

    /// Number of calls made for `method` so far.
    pub fn call_count(&self, method: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|m| m.as_str() == method)
            .count()
    }

    fn get_logs(&self, filter: &Value) -> Vec<Value> {
        let from = hex_param(filter.get("fromBlock")).unwrap_or(0);
        let to = hex_param(filter.get("toBlock")).unwrap_or(u64::MAX);
        let state = self.state.lock().unwrap();
        state
            .logs
            .iter()
            .filter(|log| {
                let number = hex_param(log.get("blockNumber")).unwrap_or(0);
                if number < from || number > to {
                    return false;
                }
                if !address_matches(filter.get("address"), log["address"].as_str().unwrap()) {
                    return false;
                }
                topics_match(filter.get("topics"), log["topics"].as_array().unwrap())
            })
            .cloned()
            .collect()
    }
}

fn hex_param(value: Option<&Value>) -> Option<u64> {
    let s = value?.as_str()?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16).ok()
}

fn address_matches(constraint: Option<&Value>, address: &str) -> bool {
    match constraint {
        None => true,
        Some(Value::String(a)) => a.eq_ignore_ascii_case(address),
        Some(Value::Array(addrs)) => addrs
            .iter()
            .filter_map(Value::as_str)
            .any(|a| a.eq_ignore_ascii_case(address)),
        Some(_) => false,
    }
}

fn topics_match(constraint: Option<&Value>, topics: &[Value]) -> bool {
    let Some(Value::Array(positions)) = constraint else {
        return true;
    };
    positions.iter().enumerate().all(|(i, wanted)| {
        let actual = topics.get(i).and_then(Value::as_str);
        match wanted {
            Value::Null => true,
            Value::String(t) => actual.is_some_and(|a| a.eq_ignore_ascii_case(t)),
            Value::Array(options) => actual.is_some_and(|a| {
                options
                    .iter()
                    .filter_map(Value::as_str)
                    .any(|t| t.eq_ignore_ascii_case(a))
            }),
            _ => false,
        }
    })
}

#[async_trait]
impl RpcClient for MockChain {
    async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, TransportError> {
        self.state.lock().unwrap().calls.push(method.to_string());
        match method {
            "eth_chainId" => Ok(json!(format!("0x{:x}", self.chain_id))),
            "eth_getBlockByNumber" => {
                let state = self.state.lock().unwrap();
                let selector = params[0].as_str().unwrap_or_default();
                let number = if selector == "latest" {
                    state.blocks.keys().max().copied().unwrap_or(0)
                } else {
                    u64::from_str_radix(selector.trim_start_matches("0x"), 16).unwrap_or(0)
                };
                Ok(state.blocks.get(&number).cloned().unwrap_or(Value::Null))
            }
            "eth_getBlockByHash" => {
                let state = self.state.lock().unwrap();
                let hash = params[0].as_str().unwrap_or_default();
                Ok(state
                    .blocks
                    .values()
                    .find(|b| b["hash"] == hash)
                    .cloned()
                    .unwrap_or(Value::Null))
            }
            "eth_getLogs" => Ok(Value::Array(self.get_logs(&params[0]))),
            other => Err(TransportError::Http(format!("unscripted method {other}"))),
        }
    }
}

/// A 32-byte topic embedding `address` in its low 20 bytes.
pub fn address_topic(address: &str) -> String {
    format!(
        "0x000000000000000000000000{}",
        address.trim_start_matches("0x")
    )
}
