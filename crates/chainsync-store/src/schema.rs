//! Sync store schema.
//!
//! Conflict policy is keep-existing everywhere: raw rows are immutable once
//! written, so re-ingesting a range is a no-op. Big numerics that participate
//! in ordering (checkpoints) are stored as zero-padded text so lexical
//! comparison in SQL agrees with numeric comparison.

/// DDL statements, executed in order on open.
pub(crate) const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS blocks (
        hash        TEXT    NOT NULL,
        chain_id    INTEGER NOT NULL,
        number      INTEGER NOT NULL,
        timestamp   INTEGER NOT NULL,
        body        TEXT    NOT NULL,
        PRIMARY KEY (hash, chain_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_blocks_number ON blocks (chain_id, number)",
    "CREATE TABLE IF NOT EXISTS logs (
        block_hash       TEXT    NOT NULL,
        log_index        INTEGER NOT NULL,
        chain_id         INTEGER NOT NULL,
        block_number     INTEGER NOT NULL,
        address          TEXT    NOT NULL,
        topic0           TEXT,
        topic1           TEXT,
        topic2           TEXT,
        topic3           TEXT,
        data             TEXT    NOT NULL,
        transaction_hash TEXT    NOT NULL,
        body             TEXT    NOT NULL,
        PRIMARY KEY (block_hash, log_index, chain_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_logs_block_number ON logs (chain_id, block_number)",
    "CREATE TABLE IF NOT EXISTS transactions (
        hash              TEXT    NOT NULL,
        chain_id          INTEGER NOT NULL,
        block_number      INTEGER NOT NULL,
        transaction_index INTEGER NOT NULL,
        body              TEXT    NOT NULL,
        PRIMARY KEY (hash, chain_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_transactions_block ON transactions (chain_id, block_number)",
    "CREATE TABLE IF NOT EXISTS transaction_receipts (
        hash         TEXT    NOT NULL,
        chain_id     INTEGER NOT NULL,
        block_number INTEGER NOT NULL,
        body         TEXT    NOT NULL,
        PRIMARY KEY (hash, chain_id)
    )",
    "CREATE TABLE IF NOT EXISTS addresses (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        chain_id     INTEGER NOT NULL,
        filter_id    TEXT    NOT NULL,
        block_number INTEGER NOT NULL,
        address      TEXT    NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_addresses_filter ON addresses (filter_id, chain_id)",
    "CREATE TABLE IF NOT EXISTS intervals (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        chain_id   INTEGER NOT NULL,
        filter_id  TEXT    NOT NULL,
        from_block INTEGER NOT NULL,
        to_block   INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_intervals_filter ON intervals (filter_id)",
    "CREATE TABLE IF NOT EXISTS events (
        filter_id        TEXT    NOT NULL,
        checkpoint       TEXT    NOT NULL,
        chain_id         INTEGER NOT NULL,
        block_number     INTEGER NOT NULL,
        block_hash       TEXT    NOT NULL,
        log_index        INTEGER,
        transaction_hash TEXT,
        data             TEXT,
        PRIMARY KEY (filter_id, checkpoint, chain_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_events_checkpoint ON events (checkpoint, filter_id)",
    "CREATE TABLE IF NOT EXISTS rpc_request_results (
        request      TEXT    NOT NULL,
        chain_id     INTEGER NOT NULL,
        block_number INTEGER NOT NULL,
        result       TEXT    NOT NULL,
        PRIMARY KEY (request, chain_id)
    )",
];
