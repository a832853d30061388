//! Realtime sync — follows the chain tip and reconciles it with the local
//! view.
//!
//! The follower pushes `block` / `reorg` / `finalize` messages into a bounded
//! channel in strict per-chain order: consecutive `block` messages advance by
//! exactly one block number, a `reorg` always precedes the re-emission of the
//! replacement blocks, and `finalize` fires once a block crosses the
//! finality depth.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use chainsync_core::error::SyncError;
use chainsync_core::filter::{matches_log, LogFilter};
use chainsync_core::types::{Block, LightBlock, Log};
use chainsync_rpc::{BlockTag, LogQuery, RpcClient};

use crate::bloom::filters_might_match;
use crate::historical::rpc_err;

/// Messages emitted by a follower, tagged with its chain id by the channel.
#[derive(Debug)]
pub enum RealtimeMessage {
    /// A new canonical block extends the local head. `logs` carries the
    /// subset of the block's logs that match the chain's log filters.
    Block { block: Block, logs: Vec<Log> },
    /// A common ancestor was identified; everything strictly above it is
    /// stale.
    Reorg { ancestor: LightBlock },
    /// `block` has crossed the finality depth.
    Finalize { block: LightBlock },
    /// The follower died and will emit nothing further.
    Fatal(SyncError),
}

#[derive(Debug, Clone)]
pub struct RealtimeSyncConfig {
    pub poll_interval: Duration,
    pub finality_depth: u64,
}

impl Default for RealtimeSyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            finality_depth: 10,
        }
    }
}

/// Handle to a spawned tip follower.
pub struct RealtimeSync {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RealtimeSync {
    /// Start following the tip from `finalized`.
    pub fn spawn<C: RpcClient + 'static>(
        chain_id: u64,
        client: Arc<C>,
        log_filters: Vec<LogFilter>,
        finalized: LightBlock,
        config: RealtimeSyncConfig,
        tx: mpsc::Sender<(u64, RealtimeMessage)>,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let follower = Follower {
            chain_id,
            client,
            log_filters,
            local_chain: vec![finalized.clone()],
            finalized,
            finality_depth: config.finality_depth,
            tx,
        };
        let poll_interval = config.poll_interval;
        let handle = tokio::spawn(follower.run(poll_interval, shutdown_rx));
        Self { shutdown, handle }
    }

    /// Stop polling and wait for the in-flight poll to resolve.
    pub async fn kill(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

struct Follower<C> {
    chain_id: u64,
    client: Arc<C>,
    log_filters: Vec<LogFilter>,
    /// Unfinalized light blocks, ascending; the first entry is the finalized
    /// root.
    local_chain: Vec<LightBlock>,
    finalized: LightBlock,
    finality_depth: u64,
    tx: mpsc::Sender<(u64, RealtimeMessage)>,
}

impl<C: RpcClient> Follower<C> {
    async fn run(mut self, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            match self.poll().await {
                Ok(true) => {}
                // Receiver dropped: the coordinator is gone.
                Ok(false) => break,
                Err(error) => {
                    let _ = self.tx.send((self.chain_id, RealtimeMessage::Fatal(error))).await;
                    break;
                }
            }
        }
    }

    /// One poll round. Returns `false` when the consumer went away.
    async fn poll(&mut self) -> Result<bool, SyncError> {
        let latest = self
            .client
            .get_block_by_number(BlockTag::Latest)
            .await
            .map_err(rpc_err)?
            .ok_or_else(|| SyncError::Malformed {
                entity: "block",
                reason: "latest block not returned by node".into(),
            })?;
        let head = latest.light();
        let tip = self.local_chain.last().expect("chain never empty").clone();

        if head.number <= tip.number {
            if self.local_chain.iter().any(|b| b.hash == head.hash) {
                // Already seen; nothing new.
                return Ok(true);
            }
            // A head at or below our tip with an unknown hash means the
            // canonical chain diverged.
            return self.handle_reorg(latest).await;
        }

        for number in tip.number + 1..=head.number {
            let block = if number == head.number {
                latest.clone()
            } else {
                self.client
                    .get_block_by_number(BlockTag::Number(number))
                    .await
                    .map_err(rpc_err)?
                    .ok_or_else(|| SyncError::Malformed {
                        entity: "block",
                        reason: format!("block {number} not returned by node"),
                    })?
            };
            if block.parent_hash != self.local_chain.last().expect("chain never empty").hash {
                return self.handle_reorg(block).await;
            }
            if !self.emit_block(block).await? {
                return Ok(false);
            }
        }

        self.advance_finality(head.number).await
    }

    async fn emit_block(&mut self, block: Block) -> Result<bool, SyncError> {
        let logs = self.fetch_matching_logs(&block).await?;
        debug!(
            chain_id = self.chain_id,
            number = block.number(),
            logs = logs.len(),
            "new head block"
        );
        self.local_chain.push(block.light());
        Ok(self
            .tx
            .send((self.chain_id, RealtimeMessage::Block { block, logs }))
            .await
            .is_ok())
    }

    async fn fetch_matching_logs(&self, block: &Block) -> Result<Vec<Log>, SyncError> {
        if self.log_filters.is_empty() {
            return Ok(vec![]);
        }
        if let Some(bloom) = &block.logs_bloom {
            let filters: Vec<&LogFilter> = self.log_filters.iter().collect();
            if !filters_might_match(bloom, &filters) {
                return Ok(vec![]);
            }
        }
        let number = block.number();
        let logs = self
            .client
            .get_logs(&LogQuery::new(number, number))
            .await
            .map_err(rpc_err)?;
        Ok(logs
            .into_iter()
            .filter(|log| {
                !log.is_removed() && self.log_filters.iter().any(|f| matches_log(log, f))
            })
            .collect())
    }

    /// Walk parent hashes from `divergent` back to a locally known block.
    async fn handle_reorg(&mut self, divergent: Block) -> Result<bool, SyncError> {
        warn!(
            chain_id = self.chain_id,
            at = divergent.number(),
            "chain diverged from local view, walking back"
        );
        let mut current = divergent.light();
        loop {
            if let Some(pos) = self.local_chain.iter().position(|b| b.hash == current.parent_hash)
            {
                let ancestor = self.local_chain[pos].clone();
                self.local_chain.truncate(pos + 1);
                warn!(
                    chain_id = self.chain_id,
                    ancestor = ancestor.number,
                    "common ancestor found"
                );
                return Ok(self
                    .tx
                    .send((self.chain_id, RealtimeMessage::Reorg { ancestor }))
                    .await
                    .is_ok());
            }
            if current.number <= self.finalized.number {
                return Err(SyncError::ReorgBeyondFinality {
                    chain_id: self.chain_id,
                    finalized: self.finalized.number,
                });
            }
            current = self
                .client
                .get_block_by_hash(&current.parent_hash)
                .await
                .map_err(rpc_err)?
                .ok_or_else(|| SyncError::Malformed {
                    entity: "block",
                    reason: format!("block {} not returned by node", current.parent_hash),
                })?
                .light();
        }
    }

    async fn advance_finality(&mut self, head_number: u64) -> Result<bool, SyncError> {
        let target = head_number.saturating_sub(self.finality_depth);
        if target <= self.finalized.number {
            return Ok(true);
        }
        let Some(newly_finalized) =
            self.local_chain.iter().rev().find(|b| b.number <= target).cloned()
        else {
            return Ok(true);
        };
        if newly_finalized.number <= self.finalized.number {
            return Ok(true);
        }
        self.finalized = newly_finalized.clone();
        self.local_chain.retain(|b| b.number >= self.finalized.number);
        debug!(chain_id = self.chain_id, finalized = self.finalized.number, "finality advanced");
        Ok(self
            .tx
            .send((self.chain_id, RealtimeMessage::Finalize { block: newly_finalized }))
            .await
            .is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chainsync_rpc::TransportError;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// A scripted chain the follower polls; tests mutate it between polls.
    struct ScriptedChain {
        state: Mutex<ChainStateFixture>,
    }

    struct ChainStateFixture {
        by_number: HashMap<u64, Value>,
        by_hash: HashMap<String, Value>,
        latest: u64,
    }

    impl ScriptedChain {
        fn new() -> Self {
            Self {
                state: Mutex::new(ChainStateFixture {
                    by_number: HashMap::new(),
                    by_hash: HashMap::new(),
                    latest: 0,
                }),
            }
        }

        fn put_block(&self, number: u64, hash: &str, parent: &str) {
            let block = json!({
                "hash": hash,
                "parentHash": parent,
                "number": format!("0x{number:x}"),
                "timestamp": format!("0x{:x}", 1000 + number * 12),
                "transactions": []
            });
            let mut state = self.state.lock().unwrap();
            state.by_number.insert(number, block.clone());
            state.by_hash.insert(hash.to_string(), block);
        }

        fn set_latest(&self, number: u64) {
            self.state.lock().unwrap().latest = number;
        }
    }

    #[async_trait]
    impl RpcClient for ScriptedChain {
        async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, TransportError> {
            let state = self.state.lock().unwrap();
            match method {
                "eth_getBlockByNumber" => {
                    let selector = params[0].as_str().unwrap();
                    let number = if selector == "latest" {
                        state.latest
                    } else {
                        u64::from_str_radix(selector.trim_start_matches("0x"), 16).unwrap()
                    };
                    Ok(state.by_number.get(&number).cloned().unwrap_or(Value::Null))
                }
                "eth_getBlockByHash" => {
                    let hash = params[0].as_str().unwrap();
                    Ok(state.by_hash.get(hash).cloned().unwrap_or(Value::Null))
                }
                "eth_getLogs" => Ok(json!([])),
                other => panic!("unexpected method {other}"),
            }
        }
    }

    fn follower_over(
        chain: Arc<ScriptedChain>,
        finality_depth: u64,
    ) -> (Follower<ScriptedChain>, mpsc::Receiver<(u64, RealtimeMessage)>) {
        let (tx, rx) = mpsc::channel(64);
        let finalized = LightBlock {
            hash: "0xf0".into(),
            parent_hash: "0x00".into(),
            number: 0,
            timestamp: 1000,
        };
        chain.put_block(0, "0xf0", "0x00");
        let follower = Follower {
            chain_id: 1,
            client: chain,
            log_filters: vec![],
            local_chain: vec![finalized.clone()],
            finalized,
            finality_depth,
            tx,
        };
        (follower, rx)
    }

    fn recv_now(rx: &mut mpsc::Receiver<(u64, RealtimeMessage)>) -> RealtimeMessage {
        rx.try_recv().expect("expected a message").1
    }

    #[tokio::test]
    async fn emits_consecutive_blocks_filling_gaps() {
        let chain = Arc::new(ScriptedChain::new());
        chain.put_block(1, "0xa1", "0xf0");
        chain.put_block(2, "0xa2", "0xa1");
        chain.put_block(3, "0xa3", "0xa2");
        chain.set_latest(3);

        let (mut follower, mut rx) = follower_over(chain, 100);
        follower.poll().await.unwrap();

        for expected in 1..=3u64 {
            let RealtimeMessage::Block { block, .. } = recv_now(&mut rx) else {
                panic!("expected block message");
            };
            assert_eq!(block.number(), expected);
        }
        assert!(rx.try_recv().is_err());

        // Polling again with no new head emits nothing.
        follower.poll().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reorg_emits_ancestor_then_replacement_blocks() {
        let chain = Arc::new(ScriptedChain::new());
        chain.put_block(1, "0xa1", "0xf0");
        chain.put_block(2, "0xa2", "0xa1");
        chain.set_latest(2);

        let (mut follower, mut rx) = follower_over(chain.clone(), 100);
        follower.poll().await.unwrap();
        let _ = recv_now(&mut rx);
        let _ = recv_now(&mut rx);

        // Replace block 2 and extend with 3 on the new branch.
        chain.put_block(2, "0xb2", "0xa1");
        chain.put_block(3, "0xb3", "0xb2");
        chain.set_latest(3);

        follower.poll().await.unwrap();
        let RealtimeMessage::Reorg { ancestor } = recv_now(&mut rx) else {
            panic!("expected reorg message");
        };
        assert_eq!(ancestor.number, 1);
        assert_eq!(ancestor.hash, "0xa1");

        // The next poll re-emits the canonical branch above the ancestor.
        follower.poll().await.unwrap();
        let RealtimeMessage::Block { block, .. } = recv_now(&mut rx) else {
            panic!("expected block message");
        };
        assert_eq!(block.number(), 2);
        assert_eq!(block.hash, "0xb2");
        let RealtimeMessage::Block { block, .. } = recv_now(&mut rx) else {
            panic!("expected block message");
        };
        assert_eq!(block.number(), 3);
    }

    #[tokio::test]
    async fn finality_advances_with_depth() {
        let chain = Arc::new(ScriptedChain::new());
        for n in 1..=5u64 {
            chain.put_block(n, &format!("0xa{n}"), &format!("0xa{}", n - 1));
        }
        // Link block 1 to the finalized root.
        chain.put_block(1, "0xa1", "0xf0");
        chain.set_latest(5);

        let (mut follower, mut rx) = follower_over(chain, 2);
        follower.poll().await.unwrap();

        for _ in 1..=5 {
            let RealtimeMessage::Block { .. } = recv_now(&mut rx) else {
                panic!("expected block message");
            };
        }
        let RealtimeMessage::Finalize { block } = recv_now(&mut rx) else {
            panic!("expected finalize message");
        };
        assert_eq!(block.number, 3); // 5 - depth 2
        assert_eq!(follower.finalized.number, 3);
    }

    #[tokio::test]
    async fn reorg_below_finality_is_fatal() {
        let chain = Arc::new(ScriptedChain::new());
        chain.put_block(1, "0xa1", "0xf0");
        chain.set_latest(1);

        let (mut follower, mut rx) = follower_over(chain.clone(), 0);
        follower.poll().await.unwrap();
        let _ = recv_now(&mut rx); // block 1
        let _ = recv_now(&mut rx); // finalize 1 (depth 0)

        // A competing branch that never joins the local chain.
        chain.put_block(1, "0xz1", "0xz0");
        chain.put_block(2, "0xz2", "0xz1");
        chain.set_latest(2);

        let err = follower.poll().await.unwrap_err();
        assert!(matches!(err, SyncError::ReorgBeyondFinality { .. }));
    }
}
