//! chainsync-store — the durable sync cache.
//!
//! Backed by SQLite via `sqlx` (WAL mode, single-file persistence). The
//! checkpoint column is zero-padded text, so SQL `ORDER BY checkpoint` is the
//! global event order. A PostgreSQL backend (native wide integers instead of
//! padded text) is a later phase.

mod events;
mod schema;
mod store;

pub use events::EventPage;
pub use store::SyncStore;
