//! The `RpcClient` trait consumed by the sync engine, and the HTTP
//! implementation backed by `reqwest`.
//!
//! The HTTP client is the per-chain request queue: it bounds in-flight
//! concurrency with a semaphore, rate-limits with a token bucket, and retries
//! transient failures with exponential backoff. Callers above this layer
//! never self-retry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;

use chainsync_core::types::{hex_to_u64, u64_to_hex, Block, Log};

use crate::error::TransportError;
use crate::policy::{RateLimiter, RateLimiterConfig, RetryConfig, RetryPolicy};
use crate::request::{JsonRpcRequest, JsonRpcResponse};

// ─── Request shapes ──────────────────────────────────────────────────────────

/// Block selector for `eth_getBlockByNumber`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Number(u64),
    Latest,
}

impl BlockTag {
    pub fn to_value(self) -> Value {
        match self {
            Self::Number(n) => Value::String(u64_to_hex(n)),
            Self::Latest => Value::String("latest".into()),
        }
    }
}

/// Parameters for `eth_getLogs`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogQuery {
    /// A single address string or an array of addresses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<Value>,
    /// Per-position constraints: `null`, a topic, or an array of topics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<Value>>,
    pub from_block: String,
    pub to_block: String,
}

impl LogQuery {
    pub fn new(from_block: u64, to_block: u64) -> Self {
        Self {
            address: None,
            topics: None,
            from_block: u64_to_hex(from_block),
            to_block: u64_to_hex(to_block),
        }
    }

    pub fn with_address(mut self, address: Value) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_topics(mut self, topics: Vec<Value>) -> Self {
        self.topics = Some(topics);
        self
    }
}

// ─── Client trait ────────────────────────────────────────────────────────────

/// A JSON-RPC client bound to one chain.
///
/// Implementations provide `request`; the typed helpers are derived from it,
/// so test doubles only script the raw layer.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Send a raw JSON-RPC request and return its `result` value.
    async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, TransportError>;

    async fn chain_id(&self) -> Result<u64, TransportError> {
        let value = self.request("eth_chainId", vec![]).await?;
        let hex = value
            .as_str()
            .ok_or_else(|| TransportError::Deserialization(format!("eth_chainId: {value}")))?;
        Ok(hex_to_u64(hex))
    }

    /// Fetch a full block (with transactions) by number or tag.
    async fn get_block_by_number(&self, tag: BlockTag) -> Result<Option<Block>, TransportError> {
        let value = self
            .request("eth_getBlockByNumber", vec![tag.to_value(), Value::Bool(true)])
            .await?;
        parse_optional(value)
    }

    /// Fetch a full block (with transactions) by hash.
    async fn get_block_by_hash(&self, hash: &str) -> Result<Option<Block>, TransportError> {
        let value = self
            .request(
                "eth_getBlockByHash",
                vec![Value::String(hash.into()), Value::Bool(true)],
            )
            .await?;
        parse_optional(value)
    }

    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<Log>, TransportError> {
        let params = serde_json::to_value(query)
            .map_err(|e| TransportError::Deserialization(e.to_string()))?;
        let value = self.request("eth_getLogs", vec![params]).await?;
        serde_json::from_value(value).map_err(|e| TransportError::Deserialization(e.to_string()))
    }
}

fn parse_optional(value: Value) -> Result<Option<Block>, TransportError> {
    if value.is_null() {
        return Ok(None);
    }
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| TransportError::Deserialization(e.to_string()))
}

// ─── HTTP implementation ─────────────────────────────────────────────────────

/// Configuration for `HttpRpcClient`.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub retry: RetryConfig,
    pub rate_limiter: RateLimiterConfig,
    pub request_timeout: Duration,
    /// Maximum in-flight requests for this chain.
    pub max_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            request_timeout: Duration::from_secs(30),
            max_concurrency: 10,
        }
    }
}

/// HTTP JSON-RPC client with per-chain concurrency and rate limits.
pub struct HttpRpcClient {
    url: String,
    http: reqwest::Client,
    retry: RetryPolicy,
    rate_limiter: RateLimiter,
    permits: Semaphore,
    next_id: AtomicU64,
}

impl HttpRpcClient {
    pub fn new(url: impl Into<String>, config: HttpClientConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;

        Ok(Self {
            url: url.into(),
            http,
            retry: RetryPolicy::new(config.retry),
            rate_limiter: RateLimiter::new(config.rate_limiter),
            permits: Semaphore::new(config.max_concurrency),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send_once(&self, req: &JsonRpcRequest) -> Result<Value, TransportError> {
        let resp = self
            .http
            .post(&self.url)
            .json(req)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Http(format!("HTTP {status}: {body}")));
        }

        let parsed: JsonRpcResponse = resp
            .json()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        parsed.into_result().map_err(TransportError::Rpc)
    }
}

#[async_trait]
impl RpcClient for HttpRpcClient {
    async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, TransportError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TransportError::Closed)?;

        if !self.rate_limiter.try_acquire() {
            let wait = self.rate_limiter.wait_time();
            tracing::debug!(wait_ms = wait.as_millis(), method, "rate limited, backing off");
            tokio::time::sleep(wait).await;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.send_once(&req).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => match self.retry.next_delay(attempt) {
                    Some(delay) => {
                        tracing::warn!(
                            attempt,
                            delay_ms = delay.as_millis(),
                            error = %e,
                            method = %req.method,
                            "retrying request"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        tracing::error!(attempt, error = %e, method = %req.method, "retry budget spent");
                        return Err(e);
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }
}
