//! Event materialization and checkpoint-ordered reads.
//!
//! `populate_events` derives rows from the raw tables entirely inside SQL, so
//! a crash between inserting raw data and materializing leaves no partial
//! state the next run can't repair: the insert-select is idempotent under the
//! `(filter_id, checkpoint, chain_id)` key.

use sqlx::Row;

use chainsync_core::checkpoint::{BLOCK_TX_INDEX, EVENT_TYPE};
use chainsync_core::decode::RawEvent;
use chainsync_core::error::SyncError;
use chainsync_core::filter::{AddressCriteria, BlockFilter, Filter, LogFilter, TopicCriteria};
use chainsync_core::interval::BlockRange;

use crate::store::{store_err, SyncStore};

/// A page of the checkpoint-ordered event stream.
#[derive(Debug)]
pub struct EventPage {
    pub events: Vec<RawEvent>,
    /// Pass as the next `from`; pagination ends when `from == to`.
    pub cursor: String,
}

impl SyncStore {
    // ─── Materialization ─────────────────────────────────────────────────────

    /// Derive `events` rows for `filter` over `range` from the raw tables.
    ///
    /// The range is clamped to the filter's own block bounds, so materialized
    /// events never reference blocks outside `[from_block, to_block]`.
    pub async fn populate_events(
        &self,
        filter: &Filter,
        range: BlockRange,
    ) -> Result<(), SyncError> {
        let lo = range.0.max(filter.from_block());
        let hi = range.1.min(filter.to_block().unwrap_or(u64::MAX));
        if lo > hi {
            return Ok(());
        }
        match filter {
            Filter::Log(log_filter) => {
                self.populate_log_events(&filter.id(), log_filter, (lo, hi)).await
            }
            Filter::Block(block_filter) => {
                self.populate_block_events(&filter.id(), block_filter, (lo, hi)).await
            }
        }
    }

    async fn populate_log_events(
        &self,
        filter_id: &str,
        filter: &LogFilter,
        (lo, hi): BlockRange,
    ) -> Result<(), SyncError> {
        let mut sql = String::from(
            "INSERT OR IGNORE INTO events
               (filter_id, checkpoint, chain_id, block_number, block_hash,
                log_index, transaction_hash, data)
             SELECT ?,
               (SELECT printf('%010d', b.timestamp) FROM blocks b
                 WHERE b.hash = l.block_hash AND b.chain_id = l.chain_id)
               || printf('%016d', l.chain_id)
               || printf('%016d', l.block_number)
               || (SELECT printf('%016d', t.transaction_index) FROM transactions t
                    WHERE t.hash = l.transaction_hash AND t.chain_id = l.chain_id)
               || '5'
               || printf('%016d', l.log_index),
               l.chain_id, l.block_number, l.block_hash, l.log_index, l.transaction_hash,
               json_object('data', l.data, 'topic0', l.topic0, 'topic1', l.topic1,
                           'topic2', l.topic2, 'topic3', l.topic3)
             FROM logs l
             WHERE l.chain_id = ? AND l.block_number BETWEEN ? AND ?",
        );

        // Bind values for the dynamic predicates, in append order.
        let mut args: Vec<String> = Vec::new();

        for (i, criteria) in filter.topics.iter().enumerate() {
            match criteria {
                TopicCriteria::Any => {}
                TopicCriteria::Exact(topic) => {
                    sql.push_str(&format!(" AND l.topic{i} = ?"));
                    args.push(topic.to_lowercase());
                }
                TopicCriteria::OneOf(topics) if topics.len() == 1 => {
                    sql.push_str(&format!(" AND l.topic{i} = ?"));
                    args.push(topics[0].to_lowercase());
                }
                TopicCriteria::OneOf(topics) => {
                    let marks = vec!["?"; topics.len()].join(", ");
                    sql.push_str(&format!(" AND l.topic{i} IN ({marks})"));
                    args.extend(topics.iter().map(|t| t.to_lowercase()));
                }
            }
        }

        match &filter.address {
            AddressCriteria::Any => {}
            AddressCriteria::Single(address) => {
                sql.push_str(" AND l.address = ?");
                args.push(address.to_lowercase());
            }
            AddressCriteria::Many(addresses) => {
                let marks = vec!["?"; addresses.len()].join(", ");
                sql.push_str(&format!(" AND l.address IN ({marks})"));
                args.extend(addresses.iter().map(|a| a.to_lowercase()));
            }
            AddressCriteria::Child(child) => {
                sql.push_str(
                    " AND l.address IN (SELECT address FROM addresses
                       WHERE filter_id = ? AND chain_id = l.chain_id)",
                );
                args.push(child.id());
            }
        }

        let mut query = sqlx::query(&sql)
            .bind(filter_id)
            .bind(filter.chain_id as i64)
            .bind(lo as i64)
            .bind(hi as i64);
        for arg in &args {
            query = query.bind(arg);
        }
        query.execute(&self.pool).await.map_err(store_err)?;
        Ok(())
    }

    async fn populate_block_events(
        &self,
        filter_id: &str,
        filter: &BlockFilter,
        (lo, hi): BlockRange,
    ) -> Result<(), SyncError> {
        let sql = format!(
            "INSERT OR IGNORE INTO events
               (filter_id, checkpoint, chain_id, block_number, block_hash,
                log_index, transaction_hash, data)
             SELECT ?,
               printf('%010d', b.timestamp)
               || printf('%016d', b.chain_id)
               || printf('%016d', b.number)
               || '{BLOCK_TX_INDEX:016}'
               || '{EVENT_TYPE}'
               || '{:016}',
               b.chain_id, b.number, b.hash, NULL, NULL, NULL
             FROM blocks b
             WHERE b.chain_id = ? AND b.number BETWEEN ? AND ?
               AND (b.number - ?) % ? = 0",
            0u64,
        );
        sqlx::query(&sql)
            .bind(filter_id)
            .bind(filter.chain_id as i64)
            .bind(lo as i64)
            .bind(hi as i64)
            .bind(filter.offset as i64)
            .bind(filter.interval as i64)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    // ─── Reads ───────────────────────────────────────────────────────────────

    /// Event rows with `checkpoint ∈ (from, to]` for the given filters,
    /// ordered by `(checkpoint, filter_id)`.
    ///
    /// When the limit cuts inside a run of rows sharing the final checkpoint,
    /// the batch is extended to the end of the tie — the returned cursor is a
    /// bare checkpoint, so a partial tie would otherwise skip rows.
    pub async fn get_events(
        &self,
        filter_ids: &[String],
        from: &str,
        to: &str,
        limit: usize,
    ) -> Result<EventPage, SyncError> {
        if filter_ids.is_empty() {
            return Ok(EventPage { events: vec![], cursor: to.to_string() });
        }

        let marks = vec!["?"; filter_ids.len()].join(", ");
        let sql = format!(
            "SELECT filter_id, checkpoint, chain_id, block_number, block_hash,
                    log_index, transaction_hash, data
             FROM events
             WHERE checkpoint > ? AND checkpoint <= ? AND filter_id IN ({marks})
             ORDER BY checkpoint ASC, filter_id ASC
             LIMIT ?"
        );
        let mut query = sqlx::query(&sql).bind(from).bind(to);
        for id in filter_ids {
            query = query.bind(id);
        }
        let rows = query
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;

        let mut events: Vec<RawEvent> = rows.iter().map(row_to_event).collect::<Result<_, _>>()?;

        if !events.is_empty() && events.len() == limit {
            let last = events.last().expect("non-empty page");
            let (last_checkpoint, last_filter) = (last.checkpoint.clone(), last.filter_id.clone());

            let sql = format!(
                "SELECT filter_id, checkpoint, chain_id, block_number, block_hash,
                        log_index, transaction_hash, data
                 FROM events
                 WHERE checkpoint = ? AND filter_id > ? AND filter_id IN ({marks})
                 ORDER BY filter_id ASC"
            );
            let mut query = sqlx::query(&sql).bind(&last_checkpoint).bind(&last_filter);
            for id in filter_ids {
                query = query.bind(id);
            }
            let ties = query.fetch_all(&self.pool).await.map_err(store_err)?;
            for row in &ties {
                events.push(row_to_event(row)?);
            }

            Ok(EventPage { events, cursor: last_checkpoint })
        } else {
            Ok(EventPage { events, cursor: to.to_string() })
        }
    }

    /// Advisory count of materialized events for the given filters.
    pub async fn get_event_count(&self, filter_ids: &[String]) -> Result<u64, SyncError> {
        if filter_ids.is_empty() {
            return Ok(0);
        }
        let marks = vec!["?"; filter_ids.len()].join(", ");
        let sql = format!("SELECT COUNT(*) AS n FROM events WHERE filter_id IN ({marks})");
        let mut query = sqlx::query(&sql);
        for id in filter_ids {
            query = query.bind(id);
        }
        let row = query.fetch_one(&self.pool).await.map_err(store_err)?;
        Ok(row.get::<i64, _>("n") as u64)
    }
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<RawEvent, SyncError> {
    let data: Option<String> = row.get("data");
    let payload = data
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| SyncError::Store(format!("corrupt event payload: {e}")))?;
    Ok(RawEvent {
        filter_id: row.get("filter_id"),
        checkpoint: row.get("checkpoint"),
        chain_id: row.get::<i64, _>("chain_id") as u64,
        block_number: row.get::<i64, _>("block_number") as u64,
        block_hash: row.get("block_hash"),
        log_index: row.get::<Option<i64>, _>("log_index").map(|i| i as u64),
        transaction_hash: row.get("transaction_hash"),
        data: payload,
    })
}
