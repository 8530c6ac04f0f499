//! Candle sources and the pivot cache.

pub mod csv_loader;
pub mod error;
pub mod pivot_cache;
pub mod sqlite_loader;

use swing_core::candle::validate_series;
use swing_core::{Candle, CandleSource};
use tracing::info;

pub use csv_loader::CsvCandleSource;
pub use error::DataError;
pub use pivot_cache::{PivotCache, PivotCacheEntry, PivotCacheKey};
pub use sqlite_loader::SqliteCandleSource;

/// Intervals accepted by the bundled sources.
pub const VALID_INTERVALS: &[&str] = &["1m", "3m", "5m", "15m", "30m", "1h", "4h", "1d"];

pub(crate) fn validate_interval(interval: &str) -> Result<(), DataError> {
    if !VALID_INTERVALS.contains(&interval) {
        return Err(DataError::InvalidInterval(interval.to_string()));
    }
    Ok(())
}

/// Fetch up to `limit` candles and fail unless at least `required` came back
/// in strictly increasing time order.
pub fn load_history<S>(
    source: &S,
    symbol: &str,
    interval: &str,
    limit: usize,
    end_time: Option<i64>,
    required: usize,
) -> Result<Vec<Candle>, DataError>
where
    S: CandleSource<Error = DataError>,
{
    let candles = source.fetch(symbol, interval, limit, end_time)?;
    if candles.len() < required {
        return Err(DataError::NotEnoughCandles {
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            required,
            available: candles.len(),
        });
    }
    validate_series(&candles)?;
    info!(symbol, interval, candles = candles.len(), "loaded candle history");
    Ok(candles)
}
