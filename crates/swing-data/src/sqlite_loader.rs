use std::path::{Path, PathBuf};
use std::time::Instant;

use rusqlite::{params, Connection, OpenFlags};
use swing_core::{Candle, CandleSource};
use tracing::debug;

use crate::error::DataError;
use crate::validate_interval;

/// Reads candles from a SQLite table
/// `candles(symbol, interval, t, o, h, l, c, v)` with `t` in milliseconds.
#[derive(Debug, Clone)]
pub struct SqliteCandleSource {
    db_path: PathBuf,
}

impl SqliteCandleSource {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn open(&self) -> Result<Connection, DataError> {
        Ok(Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY,
        )?)
    }

    /// Min/max candle time for `(symbol, interval)`, or `None` when empty.
    pub fn time_range(&self, symbol: &str, interval: &str) -> Result<Option<(i64, i64)>, DataError> {
        validate_interval(interval)?;
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT MIN(t), MAX(t) FROM candles WHERE symbol = ?1 AND interval = ?2")?;
        let range = stmt.query_row(params![symbol, interval], |row| {
            let min_t: Option<i64> = row.get(0)?;
            let max_t: Option<i64> = row.get(1)?;
            Ok(min_t.zip(max_t))
        })?;
        Ok(range)
    }
}

impl CandleSource for SqliteCandleSource {
    type Error = DataError;

    /// The last `limit` candles at or before `end_time`, ascending.
    fn fetch(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
        end_time: Option<i64>,
    ) -> Result<Vec<Candle>, DataError> {
        validate_interval(interval)?;
        let start = Instant::now();
        let conn = self.open()?;

        let mut stmt = conn.prepare(
            "SELECT t, o, h, l, c, v FROM candles \
             WHERE symbol = ?1 AND interval = ?2 AND t <= ?3 \
             ORDER BY t DESC LIMIT ?4",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(
            params![symbol, interval, end_time.unwrap_or(i64::MAX), limit],
            |row| {
                Ok(Candle {
                    time: row.get(0)?,
                    open: row.get(1)?,
                    high: row.get(2)?,
                    low: row.get(3)?,
                    close: row.get(4)?,
                    volume: row.get(5)?,
                })
            },
        )?;

        let mut candles = rows.collect::<Result<Vec<_>, _>>()?;
        candles.reverse();

        debug!(
            symbol,
            interval,
            bars = candles.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "sqlite candles loaded"
        );
        Ok(candles)
    }
}
