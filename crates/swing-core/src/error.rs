//! Error type shared by every fallible operation in the core crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Not enough candles to cover the configured lookback.
    #[error("insufficient history: need at least {required} candles, got {available}")]
    InsufficientHistory { required: usize, available: usize },

    /// Candle timestamps must be strictly increasing.
    #[error("candles out of order at index {index}: {time} does not follow {prev}")]
    UnorderedCandles { index: usize, prev: i64, time: i64 },

    #[error("invalid timeframe: {0:?}")]
    InvalidTimeframe(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("unknown sweep override path: {0}")]
    UnknownOverride(String),

    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// A sweep worker returned an error or panicked; the sweep is aborted.
    #[error("sweep worker {worker} failed on combination {combo}: {message}")]
    WorkerFailed {
        worker: usize,
        combo: usize,
        message: String,
    },

    #[error("sweep cancelled after {completed} of {total} combinations")]
    Cancelled { completed: usize, total: usize },
}
