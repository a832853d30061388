//! The cross-chain coordinator — merges every chain's progress into one
//! checkpoint-ordered event stream and translates realtime follower messages
//! into downstream notifications.
//!
//! Historical flow: advance every chain one step, bound the readable window
//! by the minimum chain checkpoint, and page the store's event table inside
//! it. Realtime flow: follower messages funnel through one bounded channel
//! and are applied strictly in arrival order, so downstream delivery is
//! serialized without an explicit worker queue.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use chainsync_core::checkpoint::Checkpoint;
use chainsync_core::decode::RawEvent;
use chainsync_core::error::SyncError;
use chainsync_core::filter::{Filter, LogFilter};
use chainsync_core::source::Source;
use chainsync_core::types::{Block, LightBlock, Log};
use chainsync_rpc::{CachedRpcClient, RequestCache, RpcClient};
use chainsync_store::SyncStore;

use crate::local::{ChainState, LocalSync, LocalSyncConfig};
use crate::realtime::{RealtimeMessage, RealtimeSync, RealtimeSyncConfig};

/// Page size for event reads.
const EVENTS_PER_PAGE: usize = 10_000;

/// Realtime notifications raised to the downstream indexing layer.
#[derive(Debug)]
pub enum RealtimeEvent {
    /// New events became readable at the tip, in checkpoint order.
    Block { events: Vec<RawEvent> },
    /// All state above `checkpoint` was rolled back.
    Reorg { checkpoint: String },
    /// The finalized frontier advanced to `checkpoint`.
    Finalize { checkpoint: String },
}

/// Downstream callbacks. Invoked from the single dispatch loop, so calls are
/// serialized.
#[async_trait]
pub trait RealtimeHandler: Send + Sync {
    async fn on_event(&self, event: RealtimeEvent);
    async fn on_fatal(&self, error: SyncError);
}

/// Everything the coordinator needs to run one chain.
pub struct ChainSetup<C> {
    pub local: LocalSyncConfig,
    pub realtime: RealtimeSyncConfig,
    pub client: Arc<C>,
    pub sources: Vec<Source>,
}

struct ChainRuntime<C> {
    local: LocalSync<C>,
    client: Arc<C>,
    realtime_config: RealtimeSyncConfig,
    filters: Vec<(Filter, String)>,
    log_filters: Vec<LogFilter>,
    follower: Option<RealtimeSync>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckpointTag {
    Start,
    Latest,
    Finalized,
}

/// Coordinates historical and realtime sync across all configured chains.
pub struct SyncCoordinator<C> {
    store: SyncStore,
    handler: Arc<dyn RealtimeHandler>,
    chains: Vec<ChainRuntime<C>>,
    filter_ids: Vec<String>,
    realtime_tx: mpsc::Sender<(u64, RealtimeMessage)>,
    realtime_rx: Option<mpsc::Receiver<(u64, RealtimeMessage)>>,
    kill: watch::Sender<bool>,
}

/// Cloneable handle that asks the coordinator to shut down.
#[derive(Clone)]
pub struct KillSwitch(watch::Sender<bool>);

impl KillSwitch {
    pub fn kill(&self) {
        let _ = self.0.send(true);
    }
}

impl<C: RpcClient + 'static> SyncCoordinator<C> {
    /// Snapshot every chain and build its local sync.
    pub async fn new(
        store: SyncStore,
        handler: Arc<dyn RealtimeHandler>,
        setups: Vec<ChainSetup<C>>,
    ) -> Result<Self, SyncError> {
        let (realtime_tx, realtime_rx) = mpsc::channel(1024);
        let (kill, _) = watch::channel(false);

        let mut chains = Vec::with_capacity(setups.len());
        let mut filter_ids = Vec::new();
        for setup in setups {
            let filters: Vec<(Filter, String)> = setup
                .sources
                .iter()
                .map(|s| (s.filter.clone(), s.filter_id()))
                .collect();
            filter_ids.extend(filters.iter().map(|(_, id)| id.clone()));
            let log_filters: Vec<LogFilter> = setup
                .sources
                .iter()
                .filter_map(|s| match &s.filter {
                    Filter::Log(f) => Some(f.clone()),
                    Filter::Block(_) => None,
                })
                .collect();

            let local = LocalSync::new(
                setup.local,
                setup.client.clone(),
                store.clone(),
                setup.sources,
            )
            .await?;
            chains.push(ChainRuntime {
                local,
                client: setup.client,
                realtime_config: setup.realtime,
                filters,
                log_filters,
                follower: None,
            });
        }

        Ok(Self {
            store,
            handler,
            chains,
            filter_ids,
            realtime_tx,
            realtime_rx: Some(realtime_rx),
            kill,
        })
    }

    pub fn kill_switch(&self) -> KillSwitch {
        KillSwitch(self.kill.clone())
    }

    /// The checkpoint-ordered historical stream across all chains.
    pub fn events(&mut self) -> Result<EventStream<'_, C>, SyncError> {
        let start = self
            .min_chain_checkpoint(CheckpointTag::Start)
            .ok_or_else(|| SyncError::Aborted("no chains configured".into()))?;
        let end = self
            .min_chain_checkpoint(CheckpointTag::Finalized)
            .ok_or_else(|| SyncError::Aborted("no chains configured".into()))?;
        Ok(EventStream {
            coordinator: self,
            from: start.encode(),
            end: end.encode(),
            to: None,
            done: false,
        })
    }

    /// Start followers for every chain whose end block is not yet finalized.
    pub fn start_realtime(&mut self) {
        for chain in &mut self.chains {
            if chain.local.is_complete() {
                chain.local.set_state(ChainState::Complete);
                continue;
            }
            let follower = RealtimeSync::spawn(
                chain.local.chain_id(),
                chain.client.clone(),
                chain.log_filters.clone(),
                chain.local.finalized_block().clone(),
                chain.realtime_config.clone(),
                self.realtime_tx.clone(),
            );
            chain.follower = Some(follower);
            chain.local.set_state(ChainState::Realtime);
            info!(chain_id = chain.local.chain_id(), "realtime follower started");
        }
    }

    /// Drive realtime dispatch until every chain completes or the kill
    /// switch flips. Messages are applied one at a time, in arrival order.
    pub async fn process_realtime(&mut self) -> Result<(), SyncError> {
        let mut rx = self
            .realtime_rx
            .take()
            .ok_or_else(|| SyncError::Aborted("realtime already consumed".into()))?;
        let mut kill_rx = self.kill.subscribe();

        loop {
            if self
                .chains
                .iter()
                .all(|c| matches!(c.local.state(), ChainState::Complete | ChainState::Killed))
            {
                break;
            }
            tokio::select! {
                _ = kill_rx.changed() => {
                    if *kill_rx.borrow() {
                        break;
                    }
                }
                message = rx.recv() => match message {
                    Some((chain_id, message)) => self.apply_realtime(chain_id, message).await?,
                    None => break,
                }
            }
        }

        // Stop followers first, then drain what they already queued.
        self.stop_followers().await;
        while let Ok((chain_id, message)) = rx.try_recv() {
            self.apply_realtime(chain_id, message).await?;
        }
        Ok(())
    }

    /// Stop everything and dispose the store.
    pub async fn kill(&mut self) {
        let _ = self.kill.send(true);
        self.stop_followers().await;
        self.store.close().await;
        info!("sync coordinator stopped");
    }

    async fn stop_followers(&mut self) {
        for chain in &mut self.chains {
            if let Some(follower) = chain.follower.take() {
                follower.kill().await;
            }
            if chain.local.state() != ChainState::Complete {
                chain.local.set_state(ChainState::Killed);
            }
        }
    }

    /// A transport for user code that reads the store's request cache before
    /// the network.
    pub fn cached_transport(&self, network_name: &str) -> Result<CachedRpcClient<C>, SyncError> {
        let chain = self
            .chains
            .iter()
            .find(|c| c.local.network_name() == network_name)
            .ok_or_else(|| {
                SyncError::Aborted(format!("unknown network {network_name}"))
            })?;
        let cache = Arc::new(StoreRequestCache {
            store: self.store.clone(),
            chain_id: chain.local.chain_id(),
        });
        Ok(CachedRpcClient::new(chain.client.clone(), cache))
    }

    /// Apply one realtime follower message. Exposed so hosts embedding their
    /// own follower loop can reuse the translation.
    pub async fn apply_realtime(
        &mut self,
        chain_id: u64,
        message: RealtimeMessage,
    ) -> Result<(), SyncError> {
        let Some(index) = self.chains.iter().position(|c| c.local.chain_id() == chain_id) else {
            warn!(chain_id, "realtime message for unknown chain");
            return Ok(());
        };
        match message {
            RealtimeMessage::Block { block, logs } => self.on_block(index, block, logs).await,
            RealtimeMessage::Finalize { block } => self.on_finalize(index, block).await,
            RealtimeMessage::Reorg { ancestor } => self.on_reorg(index, ancestor).await,
            RealtimeMessage::Fatal(err) => {
                error!(chain_id, error = %err, "realtime follower died");
                self.handler.on_fatal(err).await;
                if let Some(follower) = self.chains[index].follower.take() {
                    follower.kill().await;
                }
                self.chains[index].local.set_state(ChainState::Killed);
                Ok(())
            }
        }
    }

    async fn on_block(&mut self, index: usize, block: Block, logs: Vec<Log>) -> Result<(), SyncError> {
        let chain_id = self.chains[index].local.chain_id();
        let number = block.number();

        self.store.insert_block(chain_id, &block).await?;
        self.store.insert_logs(chain_id, &logs).await?;
        let touched: HashSet<&str> = logs.iter().map(|l| l.transaction_hash.as_str()).collect();
        let transactions: Vec<_> = block
            .transactions
            .iter()
            .filter(|t| touched.contains(t.hash.as_str()))
            .cloned()
            .collect();
        self.store.insert_transactions(chain_id, &transactions).await?;

        for (filter, _) in &self.chains[index].filters {
            self.store.populate_events(filter, (number, number)).await?;
        }

        // The readable window is bounded by the minimum latest checkpoint,
        // measured before and after this chain's cursor moves.
        let from = self.min_chain_checkpoint(CheckpointTag::Latest);
        self.chains[index].local.set_latest_block(block.light());
        let to = self.min_chain_checkpoint(CheckpointTag::Latest);

        if let (Some(from), Some(to)) = (from, to) {
            if from < to {
                self.emit_window(&from.encode(), &to.encode()).await?;
            }
        }
        Ok(())
    }

    async fn emit_window(&mut self, from: &str, to: &str) -> Result<(), SyncError> {
        let mut cursor = from.to_string();
        while cursor.as_str() < to {
            let page = self
                .store
                .get_events(&self.filter_ids, &cursor, to, EVENTS_PER_PAGE)
                .await?;
            cursor = page.cursor;
            if !page.events.is_empty() {
                self.handler.on_event(RealtimeEvent::Block { events: page.events }).await;
            }
        }
        Ok(())
    }

    async fn on_finalize(&mut self, index: usize, block: LightBlock) -> Result<(), SyncError> {
        let chain_id = self.chains[index].local.chain_id();
        let previous = self.chains[index].local.finalized_block().number;
        if block.number <= previous {
            return Ok(());
        }
        let previous_min = self.min_chain_checkpoint(CheckpointTag::Finalized);

        let filters = self.chains[index].filters.clone();
        for (filter, filter_id) in &filters {
            let range = (previous + 1, block.number);
            self.store.populate_events(filter, range).await?;
            self.store.insert_interval(chain_id, filter_id, range).await?;
        }
        self.chains[index].local.set_finalized_block(block);

        let new_min = self.min_chain_checkpoint(CheckpointTag::Finalized);
        if let (Some(previous_min), Some(new_min)) = (previous_min, new_min) {
            if new_min > previous_min {
                self.handler
                    .on_event(RealtimeEvent::Finalize { checkpoint: new_min.encode() })
                    .await;
            }
        }

        if self.chains[index].local.is_complete() {
            if let Some(follower) = self.chains[index].follower.take() {
                follower.kill().await;
            }
            self.chains[index].local.set_state(ChainState::Complete);
            info!(chain_id, "chain complete, follower retired");
        }
        Ok(())
    }

    async fn on_reorg(&mut self, index: usize, ancestor: LightBlock) -> Result<(), SyncError> {
        let chain_id = self.chains[index].local.chain_id();
        warn!(chain_id, ancestor = ancestor.number, "pruning above common ancestor");

        self.store.prune_above(chain_id, ancestor.number).await?;
        let checkpoint = upper_bound_checkpoint(chain_id, &ancestor);
        self.chains[index].local.set_latest_block(ancestor);
        self.handler
            .on_event(RealtimeEvent::Reorg { checkpoint: checkpoint.encode() })
            .await;
        Ok(())
    }

    /// The minimum checkpoint across chains for the given cursor. `None`
    /// while any chain's latest block is still unknown.
    fn min_chain_checkpoint(&self, tag: CheckpointTag) -> Option<Checkpoint> {
        let mut min: Option<Checkpoint> = None;
        for chain in &self.chains {
            if chain.local.state() == ChainState::Killed {
                continue;
            }
            let chain_id = chain.local.chain_id();
            let block = match tag {
                CheckpointTag::Start => chain.local.start_block().clone(),
                CheckpointTag::Finalized => chain.local.finalized_block().clone(),
                CheckpointTag::Latest => chain.local.latest_block()?,
            };
            let checkpoint = match tag {
                // Inclusive lower bound: sorts before every event in the
                // block.
                CheckpointTag::Start => lower_bound_checkpoint(chain_id, &block),
                // Inclusive upper bound: sorts after every event in the
                // block.
                CheckpointTag::Latest | CheckpointTag::Finalized => {
                    upper_bound_checkpoint(chain_id, &block)
                }
            };
            min = Some(match min {
                Some(current) => current.min(checkpoint),
                None => checkpoint,
            });
        }
        min
    }
}

fn lower_bound_checkpoint(chain_id: u64, block: &LightBlock) -> Checkpoint {
    Checkpoint {
        block_timestamp: block.timestamp,
        chain_id,
        block_number: block.number,
        transaction_index: 0,
        event_type: 0,
        event_index: 0,
    }
}

fn upper_bound_checkpoint(chain_id: u64, block: &LightBlock) -> Checkpoint {
    Checkpoint {
        block_timestamp: block.timestamp,
        chain_id,
        block_number: block.number,
        transaction_index: 9_999_999_999_999_999,
        event_type: 9,
        event_index: 9_999_999_999_999_999,
    }
}

// ─── Historical stream ───────────────────────────────────────────────────────

/// Pull-based batch stream over the historical window.
pub struct EventStream<'a, C> {
    coordinator: &'a mut SyncCoordinator<C>,
    from: String,
    end: String,
    to: Option<String>,
    done: bool,
}

impl<C: RpcClient + 'static> EventStream<'_, C> {
    /// The next checkpoint-ordered batch; `None` once the finalized frontier
    /// is reached.
    pub async fn next(&mut self) -> Result<Option<Vec<RawEvent>>, SyncError> {
        loop {
            if self.done {
                return Ok(None);
            }
            if let Some(to) = self.to.clone() {
                if self.from < to {
                    let page = self
                        .coordinator
                        .store
                        .get_events(&self.coordinator.filter_ids, &self.from, &to, EVENTS_PER_PAGE)
                        .await?;
                    self.from = page.cursor;
                    if !page.events.is_empty() {
                        return Ok(Some(page.events));
                    }
                    continue;
                }
                if to >= self.end {
                    self.done = true;
                    return Ok(None);
                }
                self.to = None;
                continue;
            }

            // Advance every chain one bounded step, cooperatively.
            futures::future::try_join_all(
                self.coordinator.chains.iter_mut().map(|c| c.local.sync()),
            )
            .await?;

            // Until every chain has ingested at least one block, there is no
            // meaningful window to read.
            if let Some(latest) = self.coordinator.min_chain_checkpoint(CheckpointTag::Latest) {
                self.to = Some(latest.encode());
            }
        }
    }
}

// ─── Request cache adapter ───────────────────────────────────────────────────

/// Bridges the rpc-layer cache seam onto the sync store.
struct StoreRequestCache {
    store: SyncStore,
    chain_id: u64,
}

#[async_trait]
impl RequestCache for StoreRequestCache {
    async fn get(&self, request: &str) -> Option<Value> {
        match self.store.get_rpc_request_result(self.chain_id, request).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(error) => {
                warn!(error = %error, "request cache read failed");
                None
            }
        }
    }

    async fn put(&self, request: &str, block_number: u64, result: &Value) {
        if let Err(error) = self
            .store
            .insert_rpc_request_result(self.chain_id, request, block_number, &result.to_string())
            .await
        {
            warn!(error = %error, "request cache write failed");
        }
    }
}
