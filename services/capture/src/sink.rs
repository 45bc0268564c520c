//! Storage sink abstraction
//!
//! Handlers persist through [`StorageSink`] and never see SQL. Both calls are
//! atomic per call: a bulk insert lands whole or not at all, so a failed
//! flush can be retried as the identical batch.

use async_trait::async_trait;
use parking_lot::Mutex;
use types::book::{BookRow, EpisodeMarker};
use types::errors::StorageError;
use types::trade::TradeRow;

/// A destination table and its column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Table {
    pub name: &'static str,
    pub columns: &'static [&'static str],
}

/// Order-book rows, written in bulk.
pub const BOOK_EVENTS: Table = Table {
    name: "transient_raw_book_events",
    columns: &[
        "episode_timestamp",
        "order_id",
        "price",
        "amount",
        "pair_id",
        "local_timestamp",
        "channel_id",
        "exchange_timestamp",
    ],
};

/// Trades, one row per insert.
pub const TRADES: Table = Table {
    name: "transient_trades",
    columns: &[
        "id",
        "qty",
        "price",
        "local_timestamp",
        "exchange_timestamp",
        "pair_id",
        "channel_id",
    ],
};

/// Snapshot episode boundaries, written eagerly.
pub const EPISODE_MARKERS: Table = Table {
    name: "transient_raw_book_channels",
    columns: &["episode_timestamp", "pair_id", "channel_id"],
};

/// A row written individually.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Row {
    Trade(TradeRow),
    EpisodeMarker(EpisodeMarker),
}

impl Row {
    pub fn table(&self) -> &'static Table {
        match self {
            Row::Trade(_) => &TRADES,
            Row::EpisodeMarker(_) => &EPISODE_MARKERS,
        }
    }
}

#[async_trait]
pub trait StorageSink: Send + Sync {
    /// Insert one row into the row's table.
    async fn insert_row(&self, row: &Row) -> Result<(), StorageError>;

    /// Insert a batch of book rows into `table` as one atomic write.
    async fn bulk_insert(&self, table: &Table, rows: &[BookRow]) -> Result<(), StorageError>;
}

/// One recorded bulk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkWrite {
    pub table: &'static str,
    pub rows: Vec<BookRow>,
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: Vec<Row>,
    bulk_writes: Vec<BulkWrite>,
    fail_bulk: bool,
    fail_next_inserts: usize,
}

/// In-process sink that records every call.
///
/// Failures can be switched on to exercise the error paths of handlers.
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent bulk insert fail (or succeed again).
    pub fn set_fail_bulk(&self, fail: bool) {
        self.state.lock().fail_bulk = fail;
    }

    /// Make the next `count` single-row inserts fail.
    pub fn fail_next_inserts(&self, count: usize) {
        self.state.lock().fail_next_inserts = count;
    }

    pub fn rows(&self) -> Vec<Row> {
        self.state.lock().rows.clone()
    }

    pub fn trades(&self) -> Vec<TradeRow> {
        self.state
            .lock()
            .rows
            .iter()
            .filter_map(|row| match row {
                Row::Trade(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn markers(&self) -> Vec<EpisodeMarker> {
        self.state
            .lock()
            .rows
            .iter()
            .filter_map(|row| match row {
                Row::EpisodeMarker(m) => Some(*m),
                _ => None,
            })
            .collect()
    }

    pub fn bulk_writes(&self) -> Vec<BulkWrite> {
        self.state.lock().bulk_writes.clone()
    }

    /// All book rows written so far, in write order.
    pub fn book_rows(&self) -> Vec<BookRow> {
        self.state
            .lock()
            .bulk_writes
            .iter()
            .flat_map(|w| w.rows.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl StorageSink for MemorySink {
    async fn insert_row(&self, row: &Row) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        if state.fail_next_inserts > 0 {
            state.fail_next_inserts -= 1;
            return Err(StorageError::Insert {
                table: row.table().name.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        state.rows.push(row.clone());
        Ok(())
    }

    async fn bulk_insert(&self, table: &Table, rows: &[BookRow]) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        if state.fail_bulk {
            return Err(StorageError::BulkInsert {
                table: table.name.to_string(),
                rows: rows.len(),
                reason: "injected failure".to_string(),
            });
        }
        state.bulk_writes.push(BulkWrite {
            table: table.name,
            rows: rows.to_vec(),
        });
        Ok(())
    }
}
