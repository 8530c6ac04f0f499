//! Swing pivot backtesting core.
//!
//! Base candles are aggregated into the configured timeframes, swing pivots
//! are detected per timeframe, optionally confirmed across timeframes, and
//! turned into simulated orders with fees, slippage and funding.

pub mod accounting;
pub mod aggregator;
pub mod candle;
pub mod cascade;
pub mod config;
pub mod engine;
pub mod error;
pub mod lookback;
pub mod order;
pub mod pivot;
pub mod report;
pub mod sweep;

pub use candle::{Candle, CandleSource};
pub use config::{load_config, load_config_str, BacktestConfig};
pub use engine::{run_backtest, timeframe_pivots, BacktestResult, BacktestRunner};
pub use error::CoreError;
pub use pivot::{Pivot, PivotKind, Signal};
pub use report::{summarize, BacktestSummary};
pub use sweep::{run_sweep, SweepOptions, SweepResult, SweepSpec};
