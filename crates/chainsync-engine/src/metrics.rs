//! Per-source sync progress counters.
//!
//! Advisory numbers for progress reporting: totals are computed against the
//! finalized block at startup, cached counts come from the interval cache,
//! and completed counts accumulate as ranges finish.

use std::collections::HashMap;

/// Progress counters for one source.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceMetrics {
    /// Blocks in the source's range up to the finalized block.
    pub total_blocks: u64,
    /// Blocks already covered by the interval cache at startup.
    pub cached_blocks: u64,
    /// Blocks completed by this run.
    pub completed_blocks: u64,
}

/// Sync progress for all sources on one chain.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    sources: HashMap<String, SourceMetrics>,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_totals(&mut self, source: &str, total_blocks: u64, cached_blocks: u64) {
        let entry = self.sources.entry(source.to_string()).or_default();
        entry.total_blocks = total_blocks;
        entry.cached_blocks = cached_blocks;
    }

    pub fn add_completed(&mut self, source: &str, blocks: u64) {
        self.sources.entry(source.to_string()).or_default().completed_blocks += blocks;
    }

    pub fn get(&self, source: &str) -> Option<SourceMetrics> {
        self.sources.get(source).copied()
    }

    /// Overall `(done, total)` across all sources.
    pub fn progress(&self) -> (u64, u64) {
        self.sources.values().fold((0, 0), |(done, total), m| {
            (
                done + (m.cached_blocks + m.completed_blocks).min(m.total_blocks),
                total + m.total_blocks,
            )
        })
    }
}
