//! Historical sync — pulls missing block ranges for each source and
//! materializes their events.
//!
//! The fetch strategy is log-first: `eth_getLogs` is cheap per matched event,
//! so only the blocks actually referenced by matching logs are fetched with
//! `eth_getBlockByNumber`. Request volume scales with event density, not
//! range width.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use chainsync_core::error::SyncError;
use chainsync_core::filter::{
    extract_child_address, AddressCriteria, BlockFilter, ChildAddressFilter, Filter, LogFilter,
    TopicCriteria,
};
use chainsync_core::interval::{difference, intersect, BlockRange};
use chainsync_core::source::Source;
use chainsync_core::types::{Block, LightBlock};
use chainsync_rpc::{BlockTag, LogQuery, RpcClient, TransportError};
use chainsync_store::SyncStore;

use crate::metrics::SyncMetrics;

pub(crate) fn rpc_err(e: TransportError) -> SyncError {
    SyncError::Rpc(e.to_string())
}

#[derive(Clone)]
struct SourcePlan {
    filter: Filter,
    filter_id: String,
    name: String,
}

/// Per-chain historical sync driver.
pub struct HistoricalSync<C> {
    chain_id: u64,
    plans: Vec<SourcePlan>,
    client: Arc<C>,
    store: SyncStore,
    /// Completed intervals per filter id: loaded from the store once at
    /// construction, appended as ranges complete, never re-read mid-run.
    intervals_cache: HashMap<String, Vec<BlockRange>>,
    /// Blocks fetched during the current `sync` invocation.
    block_cache: HashMap<u64, Block>,
    /// Highest block fully ingested so far.
    latest_block: Option<LightBlock>,
    metrics: SyncMetrics,
}

impl<C: RpcClient> HistoricalSync<C> {
    pub async fn new(
        chain_id: u64,
        sources: &[Source],
        client: Arc<C>,
        store: SyncStore,
    ) -> Result<Self, SyncError> {
        let plans: Vec<SourcePlan> = sources
            .iter()
            .map(|s| SourcePlan {
                filter: s.filter.clone(),
                filter_id: s.filter_id(),
                name: s.name.clone(),
            })
            .collect();

        let mut intervals_cache = HashMap::new();
        for plan in &plans {
            let cached = store.get_intervals(chain_id, &plan.filter_id).await?;
            intervals_cache.insert(plan.filter_id.clone(), cached);
            for child in child_filters_of(&plan.filter) {
                let id = child.id();
                let cached = store.get_intervals(chain_id, &id).await?;
                intervals_cache.insert(id, cached);
            }
        }

        Ok(Self {
            chain_id,
            plans,
            client,
            store,
            intervals_cache,
            block_cache: HashMap::new(),
            latest_block: None,
            metrics: SyncMetrics::new(),
        })
    }

    /// Highest block ingested so far; `None` until the first block lands.
    pub fn latest_block(&self) -> Option<LightBlock> {
        self.latest_block.clone()
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    /// Seed per-source totals against the finalized block.
    pub fn initialize_metrics(&mut self, finalized: u64) {
        for plan in &self.plans {
            let from = plan.filter.from_block();
            let to = plan.filter.to_block().unwrap_or(finalized).min(finalized);
            if from > to {
                warn!(
                    source = %plan.name,
                    from_block = from,
                    finalized,
                    "start block is beyond the finalized block, nothing to sync yet"
                );
                self.metrics.set_totals(&plan.name, 0, 0);
                continue;
            }
            let cached: u64 = self
                .intervals_cache
                .get(&plan.filter_id)
                .map(|ranges| {
                    ranges
                        .iter()
                        .filter_map(|&r| intersect(r, (from, to)))
                        .map(|(lo, hi)| hi - lo + 1)
                        .sum()
                })
                .unwrap_or(0);
            self.metrics.set_totals(&plan.name, to - from + 1, cached);
            info!(
                source = %plan.name,
                total = to - from + 1,
                cached,
                "historical sync initialized"
            );
        }
    }

    /// Pull everything the sources still need inside `range`, cache it, and
    /// materialize events. Completed sub-ranges are recorded per filter.
    pub async fn sync(&mut self, range: BlockRange) -> Result<(), SyncError> {
        let plans = self.plans.clone();
        for plan in &plans {
            let bounds = (
                plan.filter.from_block(),
                plan.filter.to_block().unwrap_or(u64::MAX),
            );
            let Some(window) = intersect(range, bounds) else {
                continue;
            };
            let cached = self
                .intervals_cache
                .get(&plan.filter_id)
                .cloned()
                .unwrap_or_default();
            let required = difference(&[window], &cached);
            if required.is_empty() {
                debug!(source = %plan.name, ?window, "range fully cached");
                continue;
            }

            for &sub in &required {
                match &plan.filter {
                    Filter::Log(filter) => self.sync_log_filter(filter, sub).await?,
                    Filter::Block(filter) => self.sync_block_filter(filter, sub).await?,
                }
                self.store.populate_events(&plan.filter, sub).await?;
                self.store
                    .insert_interval(self.chain_id, &plan.filter_id, sub)
                    .await?;
                self.intervals_cache.entry(plan.filter_id.clone()).or_default().push(sub);
                self.metrics.add_completed(&plan.name, sub.1 - sub.0 + 1);
                debug!(source = %plan.name, from = sub.0, to = sub.1, "range completed");
            }
        }
        self.block_cache.clear();
        Ok(())
    }

    async fn sync_log_filter(&mut self, filter: &LogFilter, range: BlockRange) -> Result<(), SyncError> {
        let address = match &filter.address {
            AddressCriteria::Any => None,
            AddressCriteria::Single(a) => Some(Value::String(a.to_lowercase())),
            AddressCriteria::Many(addrs) => {
                Some(json!(addrs.iter().map(|a| a.to_lowercase()).collect::<Vec<_>>()))
            }
            AddressCriteria::Child(child) => {
                let addresses = self.sync_address(child, range).await?;
                if addresses.is_empty() {
                    // No children discovered in this window; the range still
                    // completes.
                    return Ok(());
                }
                Some(json!(addresses))
            }
        };

        let mut query = LogQuery::new(range.0, range.1);
        if let Some(address) = address {
            query = query.with_address(address);
        }
        if let Some(topics) = topics_to_values(&filter.topics) {
            query = query.with_topics(topics);
        }

        let logs = self.client.get_logs(&query).await.map_err(rpc_err)?;
        self.store.insert_logs(self.chain_id, &logs).await?;

        // Blocks referenced by the matched logs, with the transactions each
        // one touches.
        let mut touched: BTreeMap<u64, HashSet<String>> = BTreeMap::new();
        for log in &logs {
            touched
                .entry(log.block_number())
                .or_default()
                .insert(log.transaction_hash.clone());
        }
        for (number, tx_hashes) in &touched {
            self.sync_block(*number, tx_hashes).await?;
        }
        Ok(())
    }

    async fn sync_block_filter(
        &mut self,
        filter: &BlockFilter,
        range: BlockRange,
    ) -> Result<(), SyncError> {
        let empty = HashSet::new();
        let mut number = next_tick(range.0, filter);
        while number <= range.1 {
            self.sync_block(number, &empty).await?;
            number += filter.interval;
        }
        Ok(())
    }

    /// Fetch and cache one block, persisting only the transactions whose hash
    /// is in `tx_hashes`. Deduplicated per `sync` run via the block cache.
    async fn sync_block(&mut self, number: u64, tx_hashes: &HashSet<String>) -> Result<(), SyncError> {
        let block = match self.block_cache.get(&number) {
            Some(block) => block.clone(),
            None => {
                let block = self
                    .client
                    .get_block_by_number(BlockTag::Number(number))
                    .await
                    .map_err(rpc_err)?
                    .ok_or_else(|| SyncError::Malformed {
                        entity: "block",
                        reason: format!("block {number} not returned by node"),
                    })?;
                self.store.insert_block(self.chain_id, &block).await?;
                if self.latest_block.as_ref().map_or(true, |l| l.number < number) {
                    self.latest_block = Some(block.light());
                }
                self.block_cache.insert(number, block.clone());
                block
            }
        };

        if !tx_hashes.is_empty() {
            let matching: Vec<_> = block
                .transactions
                .iter()
                .filter(|t| tx_hashes.contains(&t.hash))
                .cloned()
                .collect();
            self.store.insert_transactions(self.chain_id, &matching).await?;
        }
        Ok(())
    }

    /// Resolve a child-address filter over `range`: fetch any not-yet-covered
    /// parent logs, extract and persist the child addresses they announce,
    /// and return the full discovered set.
    fn sync_address<'a>(
        &'a mut self,
        child: &'a ChildAddressFilter,
        range: BlockRange,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, SyncError>> + Send + 'a>> {
        Box::pin(async move {
            let child_id = child.id();
            let cached = self.intervals_cache.get(&child_id).cloned().unwrap_or_default();
            let required = difference(&[range], &cached);

            for &sub in &required {
                let address = match &child.address {
                    AddressCriteria::Any => None,
                    AddressCriteria::Single(a) => Some(Value::String(a.to_lowercase())),
                    AddressCriteria::Many(addrs) => {
                        Some(json!(addrs.iter().map(|a| a.to_lowercase()).collect::<Vec<_>>()))
                    }
                    AddressCriteria::Child(inner) => {
                        let parents = self.sync_address(inner, sub).await?;
                        if parents.is_empty() {
                            continue;
                        }
                        Some(json!(parents))
                    }
                };

                let mut query = LogQuery::new(sub.0, sub.1)
                    .with_topics(vec![Value::String(child.event_selector.to_lowercase())]);
                if let Some(address) = address {
                    query = query.with_address(address);
                }
                let logs = self.client.get_logs(&query).await.map_err(rpc_err)?;

                let entries: Vec<(String, u64)> = logs
                    .iter()
                    .filter_map(|log| {
                        extract_child_address(log, child.child_address_location)
                            .map(|address| (address, log.block_number()))
                    })
                    .collect();
                self.store.insert_addresses(child, &entries).await?;
                self.store.insert_interval(child.chain_id, &child_id, sub).await?;
                self.intervals_cache.entry(child_id.clone()).or_default().push(sub);
                debug!(
                    filter_id = %child_id,
                    discovered = entries.len(),
                    from = sub.0,
                    to = sub.1,
                    "child addresses resolved"
                );
            }

            self.store.get_addresses(child).await
        })
    }
}

/// The first tick of `filter` at or after `lo`.
fn next_tick(lo: u64, filter: &BlockFilter) -> u64 {
    if lo <= filter.offset {
        filter.offset
    } else {
        let steps = (lo - filter.offset).div_ceil(filter.interval);
        filter.offset + steps * filter.interval
    }
}

/// Trim trailing wildcards; `None` when every position is a wildcard.
fn topics_to_values(topics: &[TopicCriteria; 4]) -> Option<Vec<Value>> {
    let last = topics.iter().rposition(|t| !t.is_any())? + 1;
    Some(
        topics[..last]
            .iter()
            .map(|criteria| match criteria {
                TopicCriteria::Any => Value::Null,
                TopicCriteria::Exact(t) => Value::String(t.to_lowercase()),
                TopicCriteria::OneOf(ts) => {
                    json!(ts.iter().map(|t| t.to_lowercase()).collect::<Vec<_>>())
                }
            })
            .collect(),
    )
}

/// Child-address filters reachable from `filter`, outermost first.
fn child_filters_of(filter: &Filter) -> Vec<ChildAddressFilter> {
    let mut out = Vec::new();
    if let Filter::Log(log_filter) = filter {
        let mut criteria = &log_filter.address;
        while let AddressCriteria::Child(child) = criteria {
            out.push((**child).clone());
            criteria = &child.address;
        }
    }
    out
}
