// =============================================================================
// Candle Store: durable OHLC cache for one (pair, timeframe)
// =============================================================================
//
// One SQLite file per pair, one table per timeframe. Rows are keyed by the
// candle's open timestamp and written with INSERT OR REPLACE, so re-applying a
// candle is idempotent.
//
// `count`, `newest` and `oldest` are cached. Single upserts that extend the
// series at the head update the cache in place; batch upserts and backfills
// into the middle of history invalidate it and it is recomputed on next read.
// =============================================================================

use std::cell::Cell;
use std::ops::Range;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::error::StoreError;
use crate::types::{CandleKey, TimeFrame};

/// Candles must be stamped after 2009-01-03T00:00:00Z.
pub const DOMAIN_EPOCH_MS: i64 = 1_230_940_800_000;

/// A single OHLC candle; `timestamp` is the period's open time in ms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub median: f64,
    pub volume: f64,
}

impl Candle {
    /// Build a candle with `median` set to the high/low midpoint.
    pub fn new(timestamp: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            median: (high + low) / 2.0,
            volume,
        }
    }

    /// Fold a later observation of the same period into this candle.
    fn merge(&self, other: &Candle) -> Candle {
        let high = self.high.max(other.high);
        let low = self.low.min(other.low);
        let median = if high == other.high && low == other.low {
            other.median
        } else {
            (high + low) / 2.0
        };
        Candle {
            timestamp: self.timestamp,
            open: self.open,
            high,
            low,
            close: other.close,
            median,
            volume: self.volume.max(other.volume),
        }
    }

    /// The part of this candle formed after `frac` of its period.
    fn interpolate(&self, frac: f64) -> Candle {
        let lerp = |v: f64| self.open + (v - self.open) * frac;
        Candle {
            timestamp: self.timestamp,
            open: self.open,
            high: lerp(self.high),
            low: lerp(self.low),
            close: lerp(self.close),
            median: lerp(self.median),
            volume: self.volume * frac,
        }
    }
}

/// How a single upsert related to the stored series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertKind {
    /// Started a new period at or after the newest candle's next period.
    New,
    /// Merged into the newest, still-forming candle.
    Current,
    /// Wrote somewhere inside history; cached aggregates were dropped.
    Range,
}

pub struct CandleStore {
    conn: Connection,
    key: CandleKey,
    table: String,
    clock: SharedClock,
    count: Cell<Option<usize>>,
    newest: Cell<Option<Option<Candle>>>,
    oldest: Cell<Option<Option<Candle>>>,
}

impl CandleStore {
    /// Open (or create) the store at `{dir}/{pair}.db`.
    pub fn open(dir: &Path, key: CandleKey, clock: SharedClock) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.db", key.pair));
        let conn = Connection::open(&path)?;
        info!(path = %path.display(), key = %key, "candle store opened");
        Self::with_connection(conn, key, clock)
    }

    pub fn in_memory(key: CandleKey, clock: SharedClock) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, key, clock)
    }

    pub fn with_connection(
        conn: Connection,
        key: CandleKey,
        clock: SharedClock,
    ) -> Result<Self, StoreError> {
        let table = table_name(key.timeframe);
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                 Timestamp INTEGER PRIMARY KEY NOT NULL,
                 Open      REAL NOT NULL,
                 High      REAL NOT NULL,
                 Low       REAL NOT NULL,
                 Close     REAL NOT NULL,
                 Median    REAL NOT NULL,
                 Volume    REAL NOT NULL
             );"
        ))?;
        Ok(Self {
            conn,
            key,
            table,
            clock,
            count: Cell::new(None),
            newest: Cell::new(None),
            oldest: Cell::new(None),
        })
    }

    pub fn key(&self) -> &CandleKey {
        &self.key
    }

    pub fn timeframe(&self) -> TimeFrame {
        self.key.timeframe
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub fn count(&self) -> Result<usize, StoreError> {
        if let Some(n) = self.count.get() {
            return Ok(n);
        }
        let n: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |r| r.get(0))?;
        let n = n as usize;
        self.count.set(Some(n));
        Ok(n)
    }

    /// Number of candles strictly older than `ts`.
    pub fn count_before(&self, ts: i64) -> Result<usize, StoreError> {
        let n: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE Timestamp < ?1", self.table),
            params![ts],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    pub fn newest(&self) -> Result<Option<Candle>, StoreError> {
        if let Some(c) = self.newest.get() {
            return Ok(c);
        }
        let c = self.select_one("ORDER BY Timestamp DESC LIMIT 1", params![])?;
        self.newest.set(Some(c));
        Ok(c)
    }

    pub fn oldest(&self) -> Result<Option<Candle>, StoreError> {
        if let Some(c) = self.oldest.get() {
            return Ok(c);
        }
        let c = self.select_one("ORDER BY Timestamp ASC LIMIT 1", params![])?;
        self.oldest.set(Some(c));
        Ok(c)
    }

    /// The candle for the period containing `as_of`.
    ///
    /// Under a simulated clock the result is a synthetic sub-candle: every
    /// price is interpolated from the open by the fraction of the period that
    /// has elapsed at `as_of`, so sub-period polling sees a moving price.
    pub fn current(&self, as_of: i64) -> Result<Option<Candle>, StoreError> {
        let Some(candle) =
            self.select_one("WHERE Timestamp <= ?1 ORDER BY Timestamp DESC LIMIT 1", params![as_of])?
        else {
            return Ok(None);
        };
        if !self.clock.is_simulated() {
            return Ok(Some(candle));
        }
        let period = self.key.timeframe.period_ms() as f64;
        let frac = ((as_of - candle.timestamp) as f64 / period).clamp(0.0, 1.0);
        Ok(Some(candle.interpolate(frac)))
    }

    /// `current` at the clock's present time.
    pub fn current_now(&self) -> Result<Option<Candle>, StoreError> {
        self.current(self.clock.now_ms())
    }

    /// Candles by index, oldest first.
    pub fn read_range(&self, range: Range<usize>) -> Result<Vec<Candle>, StoreError> {
        let limit = range.end.saturating_sub(range.start) as i64;
        self.select_many(
            "ORDER BY Timestamp ASC LIMIT ?1 OFFSET ?2",
            params![limit, range.start as i64],
        )
    }

    /// Candles with `timestamp >= ts`, oldest first.
    pub fn read_since(&self, ts: i64) -> Result<Vec<Candle>, StoreError> {
        self.select_many("WHERE Timestamp >= ?1 ORDER BY Timestamp ASC", params![ts])
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    pub fn upsert(&mut self, candle: Candle) -> Result<UpsertKind, StoreError> {
        check_epoch(&candle)?;
        let period = self.key.timeframe.period_ms();
        let newest = self.newest()?;

        let kind = match newest {
            None => UpsertKind::New,
            Some(n) if candle.timestamp >= n.timestamp + period => UpsertKind::New,
            Some(n) if candle.timestamp >= n.timestamp => UpsertKind::Current,
            Some(_) => UpsertKind::Range,
        };

        match (kind, newest) {
            (UpsertKind::Current, Some(n)) => {
                let merged = n.merge(&candle);
                self.write_row(&merged)?;
                self.newest.set(Some(Some(merged)));
                if self.oldest.get() == Some(Some(n)) {
                    self.oldest.set(Some(Some(merged)));
                }
            }
            (UpsertKind::New, _) => {
                self.write_row(&candle)?;
                if newest.is_none() {
                    self.count.set(Some(1));
                    self.oldest.set(Some(Some(candle)));
                } else if let Some(n) = self.count.get() {
                    self.count.set(Some(n + 1));
                }
                self.newest.set(Some(Some(candle)));
            }
            _ => {
                self.write_row(&candle)?;
                self.invalidate_cache();
            }
        }

        debug!(key = %self.key, ts = candle.timestamp, kind = ?kind, "candle upserted");
        Ok(kind)
    }

    /// Insert-or-replace every candle in one transaction.
    pub fn upsert_batch(&mut self, candles: &[Candle]) -> Result<usize, StoreError> {
        for c in candles {
            check_epoch(c)?;
        }
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&insert_sql(&self.table))?;
            for c in candles {
                stmt.execute(params![
                    c.timestamp, c.open, c.high, c.low, c.close, c.median, c.volume
                ])?;
            }
        }
        tx.commit()?;
        self.invalidate_cache();
        debug!(key = %self.key, count = candles.len(), "candle batch upserted");
        Ok(candles.len())
    }

    /// Drop every stored candle.
    pub fn clear(&mut self) -> Result<(), StoreError> {
        self.conn
            .execute(&format!("DELETE FROM {}", self.table), [])?;
        self.invalidate_cache();
        info!(key = %self.key, "candle store cleared");
        Ok(())
    }

    pub fn invalidate_cache(&self) {
        self.count.set(None);
        self.newest.set(None);
        self.oldest.set(None);
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn write_row(&self, c: &Candle) -> Result<(), StoreError> {
        self.conn.execute(
            &insert_sql(&self.table),
            params![c.timestamp, c.open, c.high, c.low, c.close, c.median, c.volume],
        )?;
        Ok(())
    }

    fn select_one(
        &self,
        tail: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Option<Candle>, StoreError> {
        let sql = format!("{} {tail}", select_sql(&self.table));
        Ok(self.conn.query_row(&sql, args, row_to_candle).optional()?)
    }

    fn select_many(
        &self,
        tail: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Candle>, StoreError> {
        let sql = format!("{} {tail}", select_sql(&self.table));
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(args, row_to_candle)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn table_name(tf: TimeFrame) -> String {
    format!("\"Candles_{}\"", tf.as_str())
}

fn select_sql(table: &str) -> String {
    format!("SELECT Timestamp, Open, High, Low, Close, Median, Volume FROM {table}")
}

fn insert_sql(table: &str) -> String {
    format!(
        "INSERT OR REPLACE INTO {table} (Timestamp, Open, High, Low, Close, Median, Volume)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
    )
}

fn row_to_candle(row: &Row<'_>) -> rusqlite::Result<Candle> {
    Ok(Candle {
        timestamp: row.get(0)?,
        open: row.get(1)?,
        high: row.get(2)?,
        low: row.get(3)?,
        close: row.get(4)?,
        median: row.get(5)?,
        volume: row.get(6)?,
    })
}

fn check_epoch(c: &Candle) -> Result<(), StoreError> {
    if c.timestamp <= DOMAIN_EPOCH_MS {
        return Err(StoreError::InvalidCandle(c.timestamp));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{system, SimulatedClock};
    use std::sync::Arc;

    const T0: i64 = 1_700_000_040_000 - 1_700_000_040_000 % 60_000;
    const MIN: i64 = 60_000;

    fn store() -> CandleStore {
        CandleStore::in_memory(CandleKey::new("BTCUSDT", TimeFrame::M1), system()).unwrap()
    }

    fn candle(ts: i64, close: f64) -> Candle {
        Candle::new(ts, close - 1.0, close + 2.0, close - 3.0, close, 10.0)
    }

    #[test]
    fn upsert_twice_is_idempotent() {
        let mut once = store();
        let mut twice = store();
        let c = candle(T0, 100.0);

        once.upsert(c).unwrap();
        twice.upsert(c).unwrap();
        twice.upsert(c).unwrap();

        assert_eq!(once.count().unwrap(), twice.count().unwrap());
        assert_eq!(once.newest().unwrap(), twice.newest().unwrap());
        assert_eq!(
            once.read_range(0..10).unwrap(),
            twice.read_range(0..10).unwrap()
        );
        twice.invalidate_cache();
        assert_eq!(twice.newest().unwrap(), Some(c));
    }

    #[test]
    fn upsert_classifies_new_current_and_range() {
        let mut s = store();
        assert_eq!(s.upsert(candle(T0, 100.0)).unwrap(), UpsertKind::New);
        assert_eq!(s.upsert(candle(T0 + MIN, 101.0)).unwrap(), UpsertKind::New);
        assert_eq!(s.count().unwrap(), 2);

        // Tick inside the newest period extends it.
        let tick = Candle::new(T0 + MIN + 30_000, 110.0, 110.0, 90.0, 95.0, 3.0);
        assert_eq!(s.upsert(tick).unwrap(), UpsertKind::Current);
        let newest = s.newest().unwrap().unwrap();
        assert_eq!(newest.timestamp, T0 + MIN);
        assert_eq!(newest.open, 100.0);
        assert_eq!(newest.high, 110.0);
        assert_eq!(newest.low, 90.0);
        assert_eq!(newest.close, 95.0);
        assert_eq!(s.count().unwrap(), 2);

        // Backfill before the head drops the cached aggregates.
        assert_eq!(s.upsert(candle(T0 - 5 * MIN, 90.0)).unwrap(), UpsertKind::Range);
        assert_eq!(s.count().unwrap(), 3);
        assert_eq!(s.oldest().unwrap().unwrap().timestamp, T0 - 5 * MIN);
        assert_eq!(s.newest().unwrap().unwrap().timestamp, T0 + MIN);
    }

    #[test]
    fn batch_upsert_recomputes_aggregates_lazily() {
        let mut s = store();
        s.upsert(candle(T0, 1.0)).unwrap();
        assert_eq!(s.count().unwrap(), 1);

        let batch: Vec<Candle> = (1..=5).map(|i| candle(T0 + i * MIN, i as f64)).collect();
        assert_eq!(s.upsert_batch(&batch).unwrap(), 5);
        assert_eq!(s.count().unwrap(), 6);
        assert_eq!(s.newest().unwrap().unwrap().timestamp, T0 + 5 * MIN);
        assert_eq!(s.oldest().unwrap().unwrap().timestamp, T0);
    }

    #[test]
    fn read_range_and_count_before() {
        let mut s = store();
        let batch: Vec<Candle> = (0..10).rev().map(|i| candle(T0 + i * MIN, i as f64)).collect();
        s.upsert_batch(&batch).unwrap();

        let window = s.read_range(2..5).unwrap();
        let stamps: Vec<i64> = window.iter().map(|c| c.timestamp).collect();
        assert_eq!(stamps, vec![T0 + 2 * MIN, T0 + 3 * MIN, T0 + 4 * MIN]);

        assert_eq!(s.count_before(T0 + 4 * MIN).unwrap(), 4);
        assert_eq!(s.count_before(T0).unwrap(), 0);
        assert_eq!(s.read_since(T0 + 8 * MIN).unwrap().len(), 2);
        assert!(s.read_range(20..30).unwrap().is_empty());
    }

    #[test]
    fn rejects_candles_before_domain_epoch() {
        let mut s = store();
        let err = s.upsert(candle(DOMAIN_EPOCH_MS, 1.0)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidCandle(_)));
        assert!(s.upsert_batch(&[candle(T0, 1.0), candle(0, 1.0)]).is_err());
        assert_eq!(s.count().unwrap(), 0);
    }

    #[test]
    fn current_interpolates_under_simulated_clock() {
        let clock = Arc::new(SimulatedClock::new(T0));
        let mut s =
            CandleStore::in_memory(CandleKey::new("BTCUSDT", TimeFrame::M1), clock.clone()).unwrap();
        s.upsert(Candle::new(T0, 100.0, 120.0, 90.0, 110.0, 60.0)).unwrap();

        clock.set(T0 + 30_000);
        let half = s.current_now().unwrap().unwrap();
        assert_eq!(half.timestamp, T0);
        assert!((half.close - 105.0).abs() < 1e-9);
        assert!((half.high - 110.0).abs() < 1e-9);
        assert!((half.low - 95.0).abs() < 1e-9);
        assert!((half.volume - 30.0).abs() < 1e-9);

        // Past the period the fraction clamps to the full candle.
        let full = s.current(T0 + 10 * MIN).unwrap().unwrap();
        assert!((full.close - 110.0).abs() < 1e-9);
        assert!((full.high - 120.0).abs() < 1e-9);

        assert!(s.current(T0 - 1).unwrap().is_none());
    }

    #[test]
    fn current_is_stored_candle_on_live_clock() {
        let mut s = store();
        let c = candle(T0, 100.0);
        s.upsert(c).unwrap();
        assert_eq!(s.current(T0 + 30_000).unwrap(), Some(c));
    }

    #[test]
    fn clear_empties_the_table() {
        let mut s = store();
        s.upsert(candle(T0, 1.0)).unwrap();
        s.clear().unwrap();
        assert_eq!(s.count().unwrap(), 0);
        assert_eq!(s.newest().unwrap(), None);
    }

    #[test]
    fn candles_survive_reopen() {
        let dir = std::env::temp_dir().join(format!("candle-store-{}", uuid::Uuid::new_v4()));
        let key = CandleKey::new("ETHUSDT", TimeFrame::M5);
        {
            let mut s = CandleStore::open(&dir, key.clone(), system()).unwrap();
            s.upsert(candle(T0, 50.0)).unwrap();
        }
        let s = CandleStore::open(&dir, key, system()).unwrap();
        assert_eq!(s.count().unwrap(), 1);
        assert_eq!(s.newest().unwrap().unwrap().close, 50.0);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
