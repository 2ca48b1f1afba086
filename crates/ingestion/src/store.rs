//! Per-shard record store backed by SQLite.
//!
//! One file holds one shard. Rows are keyed by the swap id so re-fetching a
//! page never duplicates data, and pages are committed as a single
//! transaction.

use rusqlite::{params, Connection, OpenFlags};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use swapshard_core::{Error, RawTrade, Result, SwapPayload, TimestampSecs};
use tracing::debug;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS swaps (
        id INTEGER PRIMARY KEY,
        swap TEXT NOT NULL,
        swap_time INTEGER NOT NULL,
        swap_id TEXT NOT NULL UNIQUE
    );
    CREATE INDEX IF NOT EXISTS idx_swaps_swap_time ON swaps (swap_time);
";

const UPSERT_SQL: &str = "
    INSERT INTO swaps (swap, swap_time, swap_id)
    VALUES (?1, ?2, ?3)
    ON CONFLICT (swap_id) DO NOTHING
";

/// Rows fetched per round trip while scanning.
const SCAN_BATCH: usize = 500;

/// Write side of a shard.
pub trait RecordStore {
    /// Insert a trade unless its id is already stored.
    ///
    /// Returns `true` if a new row was written.
    fn upsert(&mut self, trade: &RawTrade) -> Result<bool>;

    /// Upsert a whole page atomically. Either every row is durable on
    /// return or none is. Returns the number of newly inserted rows.
    fn upsert_page(&mut self, trades: &[RawTrade]) -> Result<usize>;

    /// Minimum `event_time` across all rows.
    fn earliest_timestamp(&self) -> Result<Option<TimestampSecs>>;
}

/// Read side of a shard.
pub trait TradeReader {
    /// Stream every stored trade in no particular order.
    fn scan_all(&self) -> Box<dyn Iterator<Item = Result<RawTrade>> + '_>;

    /// Name used in log records.
    fn label(&self) -> String {
        "shard".to_string()
    }
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::database(e.to_string())
}

/// SQLite-backed shard.
pub struct ShardStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl ShardStore {
    /// Open (or create) a shard file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        debug!(path = %path.display(), "opened shard");
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an existing shard without write access.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(db_err)?;
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// Create an isolated in-memory shard.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self { conn, path: None })
    }

    /// Number of stored trades.
    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM swaps", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(n as u64)
    }

    /// Lazily iterate over all rows in insertion order, in bounded batches.
    pub fn scan(&self) -> TradeScan<'_> {
        TradeScan {
            conn: &self.conn,
            last_rowid: 0,
            buffer: VecDeque::with_capacity(SCAN_BATCH),
            batch_size: SCAN_BATCH,
            exhausted: false,
        }
    }
}

fn insert_row(conn: &Connection, trade: &RawTrade) -> Result<bool> {
    let swap = serde_json::to_string(&trade.payload)?;
    let mut stmt = conn.prepare_cached(UPSERT_SQL).map_err(db_err)?;
    let changed = stmt
        .execute(params![swap, trade.event_time, trade.trade_id])
        .map_err(db_err)?;
    Ok(changed > 0)
}

fn decode_row(trade_id: String, swap: String, event_time: i64) -> Result<RawTrade> {
    let payload: SwapPayload = serde_json::from_str(&swap)
        .map_err(|e| Error::data(format!("stored swap {} is unreadable: {}", trade_id, e)))?;
    Ok(RawTrade {
        trade_id,
        payload,
        event_time,
    })
}

impl RecordStore for ShardStore {
    fn upsert(&mut self, trade: &RawTrade) -> Result<bool> {
        insert_row(&self.conn, trade)
    }

    fn upsert_page(&mut self, trades: &[RawTrade]) -> Result<usize> {
        let tx = self.conn.transaction().map_err(db_err)?;
        let mut inserted = 0;
        for trade in trades {
            if insert_row(&tx, trade)? {
                inserted += 1;
            }
        }
        tx.commit().map_err(db_err)?;
        Ok(inserted)
    }

    fn earliest_timestamp(&self) -> Result<Option<TimestampSecs>> {
        self.conn
            .query_row("SELECT MIN(swap_time) FROM swaps", [], |row| row.get(0))
            .map_err(db_err)
    }
}

impl TradeReader for ShardStore {
    fn scan_all(&self) -> Box<dyn Iterator<Item = Result<RawTrade>> + '_> {
        Box::new(self.scan())
    }

    fn label(&self) -> String {
        match &self.path {
            Some(path) => path.display().to_string(),
            None => ":memory:".to_string(),
        }
    }
}

/// Keyset-paginated scan over a shard.
pub struct TradeScan<'a> {
    conn: &'a Connection,
    last_rowid: i64,
    buffer: VecDeque<Result<RawTrade>>,
    batch_size: usize,
    exhausted: bool,
}

impl TradeScan<'_> {
    fn fill(&mut self) {
        let rows = self.fetch_batch();
        match rows {
            Ok(rows) => {
                if rows.len() < self.batch_size {
                    self.exhausted = true;
                }
                for (rowid, swap, time, id) in rows {
                    self.last_rowid = rowid;
                    self.buffer.push_back(decode_row(id, swap, time));
                }
            }
            Err(e) => {
                self.exhausted = true;
                self.buffer.push_back(Err(e));
            }
        }
    }

    fn fetch_batch(&self) -> Result<Vec<(i64, String, i64, String)>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT id, swap, swap_time, swap_id FROM swaps
                 WHERE id > ?1 ORDER BY id LIMIT ?2",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![self.last_rowid, self.batch_size as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}

impl Iterator for TradeScan<'_> {
    type Item = Result<RawTrade>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill();
        }
        self.buffer.pop_front()
    }
}
