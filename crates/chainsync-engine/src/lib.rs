//! chainsync-engine — the multi-chain sync engine.
//!
//! # Architecture
//!
//! ```text
//! SyncCoordinator
//!     ├── per chain: LocalSync          (cursor pacing, chain snapshot)
//!     │       └── HistoricalSync        (log-first range fetching)
//!     ├── per chain: RealtimeSync       (tip follower, reorg/finality)
//!     │       └── bloom pre-filter      (skip blocks that cannot match)
//!     └── SyncStore                     (raw cache + materialized events)
//! ```
//!
//! The coordinator's historical stream pages the store's event table across
//! all chains in checkpoint order; at the tip it translates follower
//! messages into `RealtimeEvent` notifications for the downstream layer.

pub mod bloom;
pub mod coordinator;
pub mod historical;
pub mod local;
pub mod metrics;
pub mod realtime;

pub use coordinator::{
    ChainSetup, EventStream, KillSwitch, RealtimeEvent, RealtimeHandler, SyncCoordinator,
};
pub use historical::HistoricalSync;
pub use local::{ChainState, LocalSync, LocalSyncConfig};
pub use metrics::{SourceMetrics, SyncMetrics};
pub use realtime::{RealtimeMessage, RealtimeSync, RealtimeSyncConfig};
