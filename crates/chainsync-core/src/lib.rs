//! chainsync-core — foundation types for the multi-chain sync engine.
//!
//! # Architecture
//!
//! ```text
//! SyncCoordinator (chainsync-engine)
//!      ├── Filter / Source    (what to index, stable cache ids)
//!      ├── Checkpoint         (global cross-chain ordering key)
//!      ├── interval algebra   (incremental range accounting)
//!      ├── wire types         (blocks, logs, transactions, receipts)
//!      └── decode_events      (bare ABI decoding for the downstream layer)
//! ```

pub mod checkpoint;
pub mod decode;
pub mod error;
pub mod filter;
pub mod interval;
pub mod source;
pub mod types;

pub use checkpoint::Checkpoint;
pub use decode::{decode_events, DecodedEvent, LogPayload, RawEvent};
pub use error::SyncError;
pub use filter::{
    matches_block, matches_log, AddressCriteria, BlockFilter, ChildAddressFilter, ChildLocation,
    Filter, LogFilter, TopicCriteria,
};
pub use interval::BlockRange;
pub use source::Source;
pub use types::{Block, LightBlock, Log, Transaction, TransactionReceipt};
