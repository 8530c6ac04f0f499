use std::fmt::Write as _;
use std::fs;

use swing_core::config::{Role, TimeframeConfig};
use swing_core::{run_backtest, BacktestConfig, BacktestRunner};
use swing_data::{load_history, CsvCandleSource, DataError};

fn write_series(root: &std::path::Path, closes: &[f64]) {
    let mut body = String::from("timestamp,open,high,low,close,volume\n");
    let mut prev = closes[0];
    for (i, &c) in closes.iter().enumerate() {
        let (hi, lo) = (prev.max(c), prev.min(c));
        writeln!(body, "{},{prev},{hi},{lo},{c},1", i as i64 * 60_000).unwrap();
        prev = c;
    }
    let dir = root.join("BTCUSDT");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("1m.csv"), body).unwrap();
}

fn config() -> BacktestConfig {
    let mut cfg = BacktestConfig::default();
    cfg.timeframes = vec![TimeframeConfig::new("1m", Role::Primary)];
    cfg
}

#[test]
fn csv_history_feeds_a_backtest() {
    let dir = tempfile::tempdir().unwrap();
    write_series(dir.path(), &[100.0, 101.0, 102.0, 103.0, 99.0, 98.6, 98.2, 97.8, 97.4]);
    let source = CsvCandleSource::new(dir.path());
    let cfg = config();
    let required = BacktestRunner::new(&cfg).unwrap().required_history().unwrap();

    let candles = load_history(&source, "BTCUSDT", "1m", 1_000, None, required).unwrap();
    assert_eq!(candles.len(), 9);
    let res = run_backtest(&candles, &cfg).unwrap();
    assert_eq!(res.stats.primary_signals, 1);
    assert_eq!(res.trades.len(), 1);
}

#[test]
fn short_history_reported_with_counts() {
    let dir = tempfile::tempdir().unwrap();
    write_series(dir.path(), &[100.0, 101.0, 102.0]);
    let source = CsvCandleSource::new(dir.path());
    let err = load_history(&source, "BTCUSDT", "1m", 1_000, None, 30).unwrap_err();
    assert!(matches!(
        err,
        DataError::NotEnoughCandles {
            required: 30,
            available: 3,
            ..
        }
    ));
}
