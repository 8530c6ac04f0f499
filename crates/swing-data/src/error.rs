//! Errors returned by candle sources and the pivot cache.

use swing_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("csv: {0}")]
    Csv(#[from] csv::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid interval: {0}")]
    InvalidInterval(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    /// The source holds fewer candles than the run needs.
    #[error("not enough candles for {symbol} {interval}: need {required}, found {available}")]
    NotEnoughCandles {
        symbol: String,
        interval: String,
        required: usize,
        available: usize,
    },
}
