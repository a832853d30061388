//! The sync store — durable cache shared by every chain's sync.
//!
//! All rows are keyed by `chain_id`, so concurrent writers for different
//! chains never conflict. Conflicts within a chain resolve to keep-existing.

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::debug;

use chainsync_core::error::SyncError;
use chainsync_core::filter::ChildAddressFilter;
use chainsync_core::interval::{union, BlockRange};
use chainsync_core::types::{Block, Log, Transaction, TransactionReceipt};

pub(crate) fn store_err(e: sqlx::Error) -> SyncError {
    SyncError::Store(e.to_string())
}

/// Durable cache of raw chain objects, child addresses, completed intervals,
/// and materialized events.
#[derive(Clone)]
pub struct SyncStore {
    pub(crate) pool: SqlitePool,
}

impl SyncStore {
    /// Open (or create) a store at `path`.
    pub async fn open(path: &str) -> Result<Self, SyncError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePool::connect(&url).await.map_err(store_err)?;
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&pool)
            .await
            .map_err(store_err)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory store. All data is lost on drop; ideal for tests.
    pub async fn in_memory() -> Result<Self, SyncError> {
        // A single connection so every handle sees the same in-memory
        // database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(store_err)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), SyncError> {
        for ddl in crate::schema::SCHEMA {
            sqlx::query(ddl).execute(&self.pool).await.map_err(store_err)?;
        }
        Ok(())
    }

    /// Close the connection pool, waiting for in-flight operations.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ─── Raw tables ──────────────────────────────────────────────────────────

    pub async fn insert_block(&self, chain_id: u64, block: &Block) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT OR IGNORE INTO blocks (hash, chain_id, number, timestamp, body)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&block.hash)
        .bind(chain_id as i64)
        .bind(block.number() as i64)
        .bind(block.timestamp() as i64)
        .bind(block.body().to_string())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    pub async fn insert_logs(&self, chain_id: u64, logs: &[Log]) -> Result<(), SyncError> {
        if logs.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        for log in logs {
            sqlx::query(
                "INSERT OR IGNORE INTO logs
                 (block_hash, log_index, chain_id, block_number, address,
                  topic0, topic1, topic2, topic3, data, transaction_hash, body)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&log.block_hash)
            .bind(log.log_index() as i64)
            .bind(chain_id as i64)
            .bind(log.block_number() as i64)
            .bind(log.address.to_lowercase())
            .bind(log.topic(0))
            .bind(log.topic(1))
            .bind(log.topic(2))
            .bind(log.topic(3))
            .bind(&log.data)
            .bind(&log.transaction_hash)
            .bind(serde_json::to_string(log).map_err(|e| SyncError::Store(e.to_string()))?)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }
        tx.commit().await.map_err(store_err)?;
        debug!(chain_id, count = logs.len(), "logs stored");
        Ok(())
    }

    pub async fn insert_transactions(
        &self,
        chain_id: u64,
        transactions: &[Transaction],
    ) -> Result<(), SyncError> {
        if transactions.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        for transaction in transactions {
            sqlx::query(
                "INSERT OR IGNORE INTO transactions
                 (hash, chain_id, block_number, transaction_index, body)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&transaction.hash)
            .bind(chain_id as i64)
            .bind(transaction.block_number() as i64)
            .bind(transaction.transaction_index() as i64)
            .bind(
                serde_json::to_string(transaction)
                    .map_err(|e| SyncError::Store(e.to_string()))?,
            )
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    pub async fn insert_transaction_receipt(
        &self,
        chain_id: u64,
        receipt: &TransactionReceipt,
    ) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT OR IGNORE INTO transaction_receipts (hash, chain_id, block_number, body)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&receipt.transaction_hash)
        .bind(chain_id as i64)
        .bind(receipt.block_number() as i64)
        .bind(serde_json::to_string(receipt).map_err(|e| SyncError::Store(e.to_string()))?)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    pub async fn has_block(&self, chain_id: u64, hash: &str) -> Result<bool, SyncError> {
        self.exists("blocks", chain_id, hash).await
    }

    pub async fn has_transaction(&self, chain_id: u64, hash: &str) -> Result<bool, SyncError> {
        self.exists("transactions", chain_id, hash).await
    }

    pub async fn has_transaction_receipt(
        &self,
        chain_id: u64,
        hash: &str,
    ) -> Result<bool, SyncError> {
        self.exists("transaction_receipts", chain_id, hash).await
    }

    async fn exists(&self, table: &str, chain_id: u64, hash: &str) -> Result<bool, SyncError> {
        let row = sqlx::query(&format!(
            "SELECT 1 FROM {table} WHERE hash = ? AND chain_id = ?"
        ))
        .bind(hash)
        .bind(chain_id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row.is_some())
    }

    // ─── Child addresses ─────────────────────────────────────────────────────

    /// Record child addresses discovered for a child-address filter.
    pub async fn insert_addresses(
        &self,
        filter: &ChildAddressFilter,
        entries: &[(String, u64)],
    ) -> Result<(), SyncError> {
        if entries.is_empty() {
            return Ok(());
        }
        let filter_id = filter.id();
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        for (address, block_number) in entries {
            sqlx::query(
                "INSERT INTO addresses (chain_id, filter_id, block_number, address)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(filter.chain_id as i64)
            .bind(&filter_id)
            .bind(*block_number as i64)
            .bind(address.to_lowercase())
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    /// All addresses discovered so far for a child-address filter.
    pub async fn get_addresses(
        &self,
        filter: &ChildAddressFilter,
    ) -> Result<Vec<String>, SyncError> {
        let rows = sqlx::query(
            "SELECT DISTINCT address FROM addresses
             WHERE filter_id = ? AND chain_id = ? ORDER BY address",
        )
        .bind(filter.id())
        .bind(filter.chain_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>("address")).collect())
    }

    // ─── Completed intervals ─────────────────────────────────────────────────

    /// Append one completed interval for `filter_id`.
    pub async fn insert_interval(
        &self,
        chain_id: u64,
        filter_id: &str,
        range: BlockRange,
    ) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT INTO intervals (chain_id, filter_id, from_block, to_block)
             VALUES (?, ?, ?, ?)",
        )
        .bind(chain_id as i64)
        .bind(filter_id)
        .bind(range.0 as i64)
        .bind(range.1 as i64)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    /// Read the filter's completed intervals, compacting the table to their
    /// merged union in the same transaction.
    pub async fn get_intervals(
        &self,
        chain_id: u64,
        filter_id: &str,
    ) -> Result<Vec<BlockRange>, SyncError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let rows = sqlx::query(
            "SELECT from_block, to_block FROM intervals WHERE filter_id = ?",
        )
        .bind(filter_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(store_err)?;

        let raw: Vec<BlockRange> = rows
            .iter()
            .map(|r| {
                (
                    r.get::<i64, _>("from_block") as u64,
                    r.get::<i64, _>("to_block") as u64,
                )
            })
            .collect();
        let merged = union(&raw);

        if merged.len() < raw.len() {
            sqlx::query("DELETE FROM intervals WHERE filter_id = ?")
                .bind(filter_id)
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
            for (lo, hi) in &merged {
                sqlx::query(
                    "INSERT INTO intervals (chain_id, filter_id, from_block, to_block)
                     VALUES (?, ?, ?, ?)",
                )
                .bind(chain_id as i64)
                .bind(filter_id)
                .bind(*lo as i64)
                .bind(*hi as i64)
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
            }
        }

        tx.commit().await.map_err(store_err)?;
        Ok(merged)
    }

    // ─── RPC request cache ───────────────────────────────────────────────────

    pub async fn insert_rpc_request_result(
        &self,
        chain_id: u64,
        request: &str,
        block_number: u64,
        result: &str,
    ) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT OR IGNORE INTO rpc_request_results (request, chain_id, block_number, result)
             VALUES (?, ?, ?, ?)",
        )
        .bind(request)
        .bind(chain_id as i64)
        .bind(block_number as i64)
        .bind(result)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    pub async fn get_rpc_request_result(
        &self,
        chain_id: u64,
        request: &str,
    ) -> Result<Option<String>, SyncError> {
        let row = sqlx::query(
            "SELECT result FROM rpc_request_results WHERE request = ? AND chain_id = ?",
        )
        .bind(request)
        .bind(chain_id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row.map(|r| r.get::<String, _>("result")))
    }

    // ─── Reorg pruning ───────────────────────────────────────────────────────

    /// Remove every row on `chain_id` that references a block strictly above
    /// `ancestor`, and truncate completed intervals to the ancestor.
    pub async fn prune_above(&self, chain_id: u64, ancestor: u64) -> Result<(), SyncError> {
        let chain = chain_id as i64;
        let block = ancestor as i64;
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        for table in [
            "logs",
            "transactions",
            "transaction_receipts",
            "addresses",
            "events",
            "rpc_request_results",
        ] {
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE chain_id = ? AND block_number > ?"
            ))
            .bind(chain)
            .bind(block)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }
        sqlx::query("DELETE FROM blocks WHERE chain_id = ? AND number > ?")
            .bind(chain)
            .bind(block)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

        sqlx::query("DELETE FROM intervals WHERE chain_id = ? AND from_block > ?")
            .bind(chain)
            .bind(block)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        sqlx::query("UPDATE intervals SET to_block = ? WHERE chain_id = ? AND to_block > ?")
            .bind(block)
            .bind(chain)
            .bind(block)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        debug!(chain_id, ancestor, "pruned above common ancestor");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsync_core::filter::{AddressCriteria, ChildLocation};

    pub(crate) fn make_block(number: u64, timestamp: u64) -> Block {
        serde_json::from_value(serde_json::json!({
            "hash": format!("0xb{number:03x}"),
            "parentHash": format!("0xb{:03x}", number.saturating_sub(1)),
            "number": format!("0x{number:x}"),
            "timestamp": format!("0x{timestamp:x}"),
            "transactions": []
        }))
        .unwrap()
    }

    fn child_filter() -> ChildAddressFilter {
        ChildAddressFilter {
            chain_id: 1,
            address: AddressCriteria::Single("0xfac".into()),
            event_selector: "0x0d36".into(),
            child_address_location: ChildLocation::Topic(1),
        }
    }

    #[tokio::test]
    async fn block_insert_and_existence() {
        let store = SyncStore::in_memory().await.unwrap();
        let block = make_block(3, 100);

        store.insert_block(1, &block).await.unwrap();
        assert!(store.has_block(1, &block.hash).await.unwrap());
        assert!(!store.has_block(2, &block.hash).await.unwrap());
        assert!(!store.has_block(1, "0xmissing").await.unwrap());

        // Conflicts keep the existing row.
        store.insert_block(1, &block).await.unwrap();
        assert!(store.has_block(1, &block.hash).await.unwrap());
    }

    #[tokio::test]
    async fn transaction_and_receipt_existence() {
        let store = SyncStore::in_memory().await.unwrap();

        let tx: Transaction = serde_json::from_value(serde_json::json!({
            "hash": "0xt1",
            "blockNumber": "0x9",
            "transactionIndex": "0x0"
        }))
        .unwrap();
        let receipt: TransactionReceipt = serde_json::from_value(serde_json::json!({
            "transactionHash": "0xt1",
            "blockNumber": "0x9",
            "status": "0x1"
        }))
        .unwrap();

        store.insert_transactions(1, &[tx]).await.unwrap();
        store.insert_transaction_receipt(1, &receipt).await.unwrap();

        assert!(store.has_transaction(1, "0xt1").await.unwrap());
        assert!(store.has_transaction_receipt(1, "0xt1").await.unwrap());
        assert!(!store.has_transaction(2, "0xt1").await.unwrap());

        store.prune_above(1, 8).await.unwrap();
        assert!(!store.has_transaction(1, "0xt1").await.unwrap());
        assert!(!store.has_transaction_receipt(1, "0xt1").await.unwrap());
    }

    #[tokio::test]
    async fn intervals_merge_and_compact() {
        let store = SyncStore::in_memory().await.unwrap();

        store.insert_interval(1, "event{f}", (0, 5)).await.unwrap();
        store.insert_interval(1, "event{f}", (6, 10)).await.unwrap();
        store.insert_interval(1, "event{f}", (20, 30)).await.unwrap();

        let merged = store.get_intervals(1, "event{f}").await.unwrap();
        assert_eq!(merged, vec![(0, 10), (20, 30)]);

        // The table is compacted to the merged set.
        let rows = sqlx::query("SELECT COUNT(*) AS n FROM intervals WHERE filter_id = ?")
            .bind("event{f}")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(rows.get::<i64, _>("n"), 2);

        // Other filters are untouched.
        assert!(store.get_intervals(1, "event{g}").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn addresses_roundtrip_lowercased() {
        let store = SyncStore::in_memory().await.unwrap();
        let filter = child_filter();

        store
            .insert_addresses(&filter, &[("0xAbCd".into(), 3), ("0xef01".into(), 4)])
            .await
            .unwrap();

        let addresses = store.get_addresses(&filter).await.unwrap();
        assert_eq!(addresses, vec!["0xabcd", "0xef01"]);

        // A different child filter sees nothing.
        let other = ChildAddressFilter {
            event_selector: "0xother".into(),
            ..child_filter()
        };
        assert!(store.get_addresses(&other).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rpc_cache_roundtrip() {
        let store = SyncStore::in_memory().await.unwrap();
        store
            .insert_rpc_request_result(1, "req-a", 5, "{\"ok\":true}")
            .await
            .unwrap();

        assert_eq!(
            store.get_rpc_request_result(1, "req-a").await.unwrap().unwrap(),
            "{\"ok\":true}"
        );
        assert!(store.get_rpc_request_result(2, "req-a").await.unwrap().is_none());

        // Keep-existing on conflict.
        store
            .insert_rpc_request_result(1, "req-a", 5, "{\"ok\":false}")
            .await
            .unwrap();
        assert_eq!(
            store.get_rpc_request_result(1, "req-a").await.unwrap().unwrap(),
            "{\"ok\":true}"
        );
    }

    #[tokio::test]
    async fn prune_above_truncates_everything() {
        let store = SyncStore::in_memory().await.unwrap();

        for n in 0..=10u64 {
            store.insert_block(1, &make_block(n, 100 + n)).await.unwrap();
        }
        store.insert_block(2, &make_block(9, 900)).await.unwrap();
        store.insert_interval(1, "event{f}", (0, 10)).await.unwrap();
        store.insert_interval(1, "event{g}", (9, 10)).await.unwrap();
        store
            .insert_addresses(&child_filter(), &[("0xchild".into(), 9)])
            .await
            .unwrap();
        store
            .insert_rpc_request_result(1, "req", 10, "{}")
            .await
            .unwrap();

        store.prune_above(1, 8).await.unwrap();

        assert!(store.has_block(1, "0xb008").await.unwrap());
        assert!(!store.has_block(1, "0xb009").await.unwrap());
        // Other chains survive.
        assert!(store.has_block(2, "0xb009").await.unwrap());

        assert_eq!(store.get_intervals(1, "event{f}").await.unwrap(), vec![(0, 8)]);
        assert!(store.get_intervals(1, "event{g}").await.unwrap().is_empty());
        assert!(store.get_addresses(&child_filter()).await.unwrap().is_empty());
        assert!(store.get_rpc_request_result(1, "req").await.unwrap().is_none());
    }
}
