//! chainsync-rpc — the per-chain request queue for the sync engine.
//!
//! Wraps JSON-RPC over HTTP with the reliability policies the engine expects
//! from its transport: bounded concurrency, token-bucket rate limiting, and
//! retry with exponential backoff. Also provides the read-through cache used
//! to serve user code from already-fetched results.

pub mod cache;
pub mod client;
pub mod error;
pub mod policy;
pub mod request;

pub use cache::{CachedRpcClient, RequestCache};
pub use client::{BlockTag, HttpClientConfig, HttpRpcClient, LogQuery, RpcClient};
pub use error::TransportError;
pub use policy::{RateLimiterConfig, RetryConfig};
