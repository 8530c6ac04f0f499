//! CSV candle files laid out as `<root>/<SYMBOL>/<interval>.csv`.
//!
//! Header: `timestamp,open,high,low,close,volume`, timestamps in ms. Rows may
//! appear in any order; they are sorted on load and duplicate timestamps are
//! rejected.

use std::fs::File;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use swing_core::{Candle, CandleSource, CoreError};
use tracing::debug;

use crate::error::DataError;
use crate::validate_interval;

#[derive(Debug, Deserialize)]
struct CsvRow {
    timestamp: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: f64,
}

impl From<CsvRow> for Candle {
    fn from(r: CsvRow) -> Self {
        Candle::new(r.timestamp, r.open, r.high, r.low, r.close, r.volume)
    }
}

#[derive(Debug, Clone)]
pub struct CsvCandleSource {
    root: PathBuf,
}

impl CsvCandleSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn file_path(&self, symbol: &str, interval: &str) -> PathBuf {
        self.root.join(symbol.to_uppercase()).join(format!("{interval}.csv"))
    }

    fn read_all(path: &Path) -> Result<Vec<Candle>, DataError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(File::open(path)?);
        let mut candles = Vec::new();
        for row in reader.deserialize::<CsvRow>() {
            candles.push(Candle::from(row?));
        }
        Ok(candles)
    }
}

impl CandleSource for CsvCandleSource {
    type Error = DataError;

    fn fetch(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
        end_time: Option<i64>,
    ) -> Result<Vec<Candle>, DataError> {
        validate_interval(interval)?;
        let path = self.file_path(symbol, interval);
        let mut candles = Self::read_all(&path)?;
        let total = candles.len();

        if let Some(end) = end_time {
            candles.retain(|c| c.time <= end);
        }
        candles.sort_by_key(|c| c.time);
        if let Some(idx) = candles.windows(2).position(|w| w[0].time == w[1].time) {
            return Err(CoreError::UnorderedCandles {
                index: idx + 1,
                prev: candles[idx].time,
                time: candles[idx + 1].time,
            }
            .into());
        }
        if candles.len() > limit {
            candles.drain(..candles.len() - limit);
        }

        debug!(path = %path.display(), rows = total, kept = candles.len(), "csv candles loaded");
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_csv(root: &Path, symbol: &str, interval: &str, body: &str) {
        let dir = root.join(symbol);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("{interval}.csv")), body).unwrap();
    }

    #[test]
    fn sorts_filters_and_limits() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(
            dir.path(),
            "BTCUSDT",
            "1m",
            "timestamp,open,high,low,close,volume\n\
             120000,3,3.5,2.5,3,1\n\
             0,1,1.5,0.5,1,1\n\
             60000,2,2.5,1.5,2,1\n\
             180000,4,4.5,3.5,4,1\n",
        );
        let source = CsvCandleSource::new(dir.path());

        let all = source.fetch("btcusdt", "1m", 10, None).unwrap();
        assert_eq!(all.iter().map(|c| c.close).collect::<Vec<_>>(), vec![1.0, 2.0, 3.0, 4.0]);

        let tail = source.fetch("BTCUSDT", "1m", 2, Some(120_000)).unwrap();
        assert_eq!(tail.iter().map(|c| c.time).collect::<Vec<_>>(), vec![60_000, 120_000]);
    }

    #[test]
    fn duplicate_timestamps_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(
            dir.path(),
            "ETH",
            "5m",
            "timestamp,open,high,low,close,volume\n0,1,1,1,1,0\n0,2,2,2,2,0\n",
        );
        let err = CsvCandleSource::new(dir.path()).fetch("ETH", "5m", 10, None).unwrap_err();
        assert!(matches!(err, DataError::Core(CoreError::UnorderedCandles { index: 1, .. })));
    }

    #[test]
    fn malformed_row_is_csv_error() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "ETH", "1m", "timestamp,open,high,low,close,volume\n0,x,1,1,1,0\n");
        let err = CsvCandleSource::new(dir.path()).fetch("ETH", "1m", 10, None).unwrap_err();
        assert!(matches!(err, DataError::Csv(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CsvCandleSource::new(dir.path()).fetch("SOL", "1m", 10, None).unwrap_err();
        assert!(matches!(err, DataError::Io(_)));
    }
}
