//! Local sync — paces historical sync in bounded steps and owns the block
//! cursors the coordinator derives checkpoints from.

use std::sync::Arc;

use tracing::{info, warn};

use chainsync_core::error::SyncError;
use chainsync_core::source::Source;
use chainsync_core::types::LightBlock;
use chainsync_rpc::{BlockTag, RpcClient};
use chainsync_store::SyncStore;

use crate::historical::{rpc_err, HistoricalSync};

/// Lifecycle of one chain's sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    New,
    Historical,
    Tip,
    Realtime,
    Complete,
    Killed,
}

/// Per-chain configuration supplied by the host.
#[derive(Debug, Clone)]
pub struct LocalSyncConfig {
    pub chain_id: u64,
    pub network_name: String,
    /// Blocks behind `latest` treated as irreversible.
    pub finality_depth: u64,
    /// Step-size heuristic: each `sync` covers about
    /// `blocks_per_event / num_sources * 1000` blocks, bounding time to first
    /// event. Tune per deployment.
    pub blocks_per_event: f64,
}

impl LocalSyncConfig {
    pub fn new(chain_id: u64, network_name: impl Into<String>) -> Self {
        Self {
            chain_id,
            network_name: network_name.into(),
            finality_depth: 10,
            blocks_per_event: 0.25,
        }
    }
}

/// Per-chain pacer over a historical sync.
pub struct LocalSync<C> {
    config: LocalSyncConfig,
    historical: HistoricalSync<C>,
    num_sources: usize,
    start_block: LightBlock,
    end_block: Option<LightBlock>,
    finalized_block: LightBlock,
    /// Set once realtime takes over the latest cursor.
    realtime_latest: Option<LightBlock>,
    /// Historical cursor: everything below is handed out already.
    from_block: u64,
    state: ChainState,
}

impl<C: RpcClient> LocalSync<C> {
    /// Snapshot the chain (chain id, start/end/latest blocks) and build the
    /// historical sync underneath.
    pub async fn new(
        config: LocalSyncConfig,
        client: Arc<C>,
        store: SyncStore,
        sources: Vec<Source>,
    ) -> Result<Self, SyncError> {
        if sources.is_empty() {
            return Err(SyncError::Aborted(format!(
                "no sources configured for network {}",
                config.network_name
            )));
        }
        let min_from = sources.iter().map(|s| s.filter.from_block()).min().unwrap_or(0);
        let max_to = sources
            .iter()
            .map(|s| s.filter.to_block())
            .collect::<Option<Vec<_>>>()
            .map(|tos| tos.into_iter().max().unwrap_or(0));

        let (remote_chain_id, start_block, end_block, latest_block) = tokio::try_join!(
            client.chain_id(),
            client.get_block_by_number(BlockTag::Number(min_from)),
            async {
                match max_to {
                    Some(to) => client.get_block_by_number(BlockTag::Number(to)).await,
                    None => Ok(None),
                }
            },
            client.get_block_by_number(BlockTag::Latest),
        )
        .map_err(rpc_err)?;

        if remote_chain_id != config.chain_id {
            // The user may be pointing at a fork deliberately.
            warn!(
                network = %config.network_name,
                configured = config.chain_id,
                remote = remote_chain_id,
                "remote chain id does not match configuration"
            );
        }

        let start_block = start_block
            .ok_or_else(|| SyncError::Malformed {
                entity: "block",
                reason: format!("start block {min_from} not returned by node"),
            })?
            .light();
        let latest = latest_block
            .ok_or_else(|| SyncError::Malformed {
                entity: "block",
                reason: "latest block not returned by node".into(),
            })?
            .light();

        let finalized_number = latest.number.saturating_sub(config.finality_depth);
        let finalized_block = client
            .get_block_by_number(BlockTag::Number(finalized_number))
            .await
            .map_err(rpc_err)?
            .ok_or_else(|| SyncError::Malformed {
                entity: "block",
                reason: format!("finalized block {finalized_number} not returned by node"),
            })?
            .light();

        let mut historical =
            HistoricalSync::new(config.chain_id, &sources, client, store).await?;
        historical.initialize_metrics(finalized_block.number);

        info!(
            network = %config.network_name,
            start = start_block.number,
            latest = latest.number,
            finalized = finalized_block.number,
            "local sync ready"
        );

        Ok(Self {
            from_block: start_block.number,
            num_sources: sources.len(),
            config,
            historical,
            start_block,
            end_block: end_block.map(|b| b.light()),
            finalized_block,
            realtime_latest: None,
            state: ChainState::New,
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    pub fn network_name(&self) -> &str {
        &self.config.network_name
    }

    pub fn state(&self) -> ChainState {
        self.state
    }

    pub fn set_state(&mut self, state: ChainState) {
        self.state = state;
    }

    pub fn start_block(&self) -> &LightBlock {
        &self.start_block
    }

    pub fn end_block(&self) -> Option<&LightBlock> {
        self.end_block.as_ref()
    }

    pub fn finalized_block(&self) -> &LightBlock {
        &self.finalized_block
    }

    pub fn set_finalized_block(&mut self, block: LightBlock) {
        self.finalized_block = block;
    }

    /// Hand the latest cursor to the realtime follower.
    pub fn set_latest_block(&mut self, block: LightBlock) {
        self.realtime_latest = Some(block);
    }

    /// The chain's current latest block for checkpoint purposes.
    pub fn latest_block(&self) -> Option<LightBlock> {
        if let Some(realtime) = &self.realtime_latest {
            return Some(realtime.clone());
        }
        if let Some(end) = &self.end_block {
            if self.from_block >= end.number {
                return Some(end.clone());
            }
        }
        if self.from_block >= self.finalized_block.number {
            return Some(self.finalized_block.clone());
        }
        self.historical.latest_block()
    }

    /// Advance the historical cursor by one bounded step.
    pub async fn sync(&mut self) -> Result<(), SyncError> {
        if self.state == ChainState::New {
            self.state = ChainState::Historical;
        }
        if self.from_block >= self.finalized_block.number {
            self.state = ChainState::Tip;
            return Ok(());
        }

        let step = ((self.config.blocks_per_event / self.num_sources as f64) * 1000.0) as u64;
        let hi = (self.from_block + step.max(1)).min(self.finalized_block.number);
        let range = (self.from_block, hi);

        self.historical.sync(range).await?;
        self.from_block = hi;
        if self.from_block >= self.finalized_block.number {
            self.state = ChainState::Tip;
        }
        Ok(())
    }

    /// True once the configured end block is finalized.
    pub fn is_complete(&self) -> bool {
        match &self.end_block {
            Some(end) => self.finalized_block.number >= end.number,
            None => false,
        }
    }

    pub fn metrics(&self) -> &crate::metrics::SyncMetrics {
        self.historical.metrics()
    }
}
