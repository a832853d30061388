//! Read-through cache for deterministic RPC calls.
//!
//! User code re-requests the same historical objects the engine already
//! fetched; serving those from the sync store's `rpc_request_results` table
//! avoids paying for the network twice. Only deterministic calls are
//! cacheable — anything addressed by `latest`/`pending` bypasses the cache.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use chainsync_core::types::hex_to_u64;

use crate::client::RpcClient;
use crate::error::TransportError;

/// Persistence seam for cached request results. Implemented by the sync
/// store; failures are the implementation's to log, a miss is returned.
#[async_trait]
pub trait RequestCache: Send + Sync {
    async fn get(&self, request: &str) -> Option<Value>;
    async fn put(&self, request: &str, block_number: u64, result: &Value);
}

/// An `RpcClient` that consults the request cache before the network.
pub struct CachedRpcClient<C> {
    inner: Arc<C>,
    cache: Arc<dyn RequestCache>,
}

impl<C: RpcClient> CachedRpcClient<C> {
    pub fn new(inner: Arc<C>, cache: Arc<dyn RequestCache>) -> Self {
        Self { inner, cache }
    }
}

/// Methods whose results are immutable once their block is finalized.
const CACHEABLE_METHODS: &[&str] = &[
    "eth_getBlockByNumber",
    "eth_getBlockByHash",
    "eth_getLogs",
    "eth_getTransactionReceipt",
    "eth_call",
];

fn is_cacheable(method: &str, params: &[Value]) -> bool {
    if !CACHEABLE_METHODS.contains(&method) {
        return false;
    }
    // A block selector of "latest"/"pending"/"safe" makes the call
    // non-deterministic.
    params.iter().all(|p| match p.as_str() {
        Some(tag) => tag.starts_with("0x"),
        None => true,
    })
}

/// The highest block number the request depends on, for reorg pruning.
fn referenced_block(method: &str, params: &[Value]) -> u64 {
    match method {
        "eth_getBlockByNumber" => params
            .first()
            .and_then(Value::as_str)
            .map(hex_to_u64)
            .unwrap_or(0),
        "eth_getLogs" => params
            .first()
            .and_then(|p| p.get("toBlock"))
            .and_then(Value::as_str)
            .map(hex_to_u64)
            .unwrap_or(0),
        "eth_call" => params
            .get(1)
            .and_then(Value::as_str)
            .map(hex_to_u64)
            .unwrap_or(0),
        // Hash-addressed objects: immutable, never pruned.
        _ => 0,
    }
}

fn cache_key(method: &str, params: &[Value]) -> String {
    json!({ "method": method, "params": params }).to_string()
}

#[async_trait]
impl<C: RpcClient> RpcClient for CachedRpcClient<C> {
    async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, TransportError> {
        if !is_cacheable(method, &params) {
            return self.inner.request(method, params).await;
        }

        let key = cache_key(method, &params);
        if let Some(hit) = self.cache.get(&key).await {
            tracing::debug!(method, "rpc cache hit");
            return Ok(hit);
        }

        let block_number = referenced_block(method, &params);
        let result = self.inner.request(method, params).await?;
        self.cache.put(&key, block_number, &result).await;
        Ok(result)
    }
}
