//! OHLCV candle representation and timeframe helpers.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

pub const MINUTE_MS: i64 = 60_000;
pub const HOUR_MS: i64 = 60 * MINUTE_MS;
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// One OHLCV bar. `time` is the bar open time in ms since epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// A flat bar where every price equals `price`.
    pub fn flat(time: i64, price: f64) -> Self {
        Self::new(time, price, price, price, price, 0.0)
    }

    /// Whether `price` lies inside `[low, high]`.
    #[inline]
    pub fn contains(&self, price: f64) -> bool {
        price >= self.low && price <= self.high
    }

    #[inline]
    pub fn clamp(&self, price: f64) -> f64 {
        price.clamp(self.low, self.high)
    }
}

/// Contract for anything that can supply a candle series for a symbol.
///
/// Implementations must return candles in ascending time order with no
/// duplicate timestamps. Fetch failures are returned, never papered over.
pub trait CandleSource {
    type Error: std::error::Error + Send + Sync + 'static;

    fn fetch(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
        end_time: Option<i64>,
    ) -> Result<Vec<Candle>, Self::Error>;
}

/// Parse a timeframe label ("1m", "15m", "4h", "1d", "1w") into milliseconds.
/// A bare number is read as minutes.
pub fn parse_timeframe(label: &str) -> Result<i64, CoreError> {
    let tf = label.trim().to_ascii_lowercase();
    let invalid = || CoreError::InvalidTimeframe(label.to_string());

    let (digits, unit_ms) = match tf.chars().last() {
        Some('m') => (&tf[..tf.len() - 1], MINUTE_MS),
        Some('h') => (&tf[..tf.len() - 1], HOUR_MS),
        Some('d') => (&tf[..tf.len() - 1], DAY_MS),
        Some('w') => (&tf[..tf.len() - 1], 7 * DAY_MS),
        Some(c) if c.is_ascii_digit() => (tf.as_str(), MINUTE_MS),
        _ => return Err(invalid()),
    };

    let n: i64 = digits.parse().map_err(|_| invalid())?;
    if n <= 0 {
        return Err(invalid());
    }
    Ok(n * unit_ms)
}

/// Start of the bucket containing `time` for a timeframe of `tf_ms`.
#[inline]
pub fn bucket_start(time: i64, tf_ms: i64) -> i64 {
    time.div_euclid(tf_ms) * tf_ms
}

/// Check that timestamps are strictly increasing.
pub fn validate_series(candles: &[Candle]) -> Result<(), CoreError> {
    for (i, pair) in candles.windows(2).enumerate() {
        if pair[1].time <= pair[0].time {
            return Err(CoreError::UnorderedCandles {
                index: i + 1,
                prev: pair[0].time,
                time: pair[1].time,
            });
        }
    }
    Ok(())
}

/// Weekday code (`Su M T W Th F Sa`) of a UTC timestamp.
pub fn weekday_code(time: i64) -> &'static str {
    const CODES: [&str; 7] = ["Su", "M", "T", "W", "Th", "F", "Sa"];
    // 1970-01-01 was a Thursday.
    let days = time.div_euclid(DAY_MS);
    CODES[(days + 4).rem_euclid(7) as usize]
}

/// Index of the candle whose time is nearest to `time`. Ties resolve to the
/// earlier candle.
pub fn nearest_index(candles: &[Candle], time: i64) -> Option<usize> {
    if candles.is_empty() {
        return None;
    }
    let idx = candles.partition_point(|c| c.time < time);
    if idx == 0 {
        return Some(0);
    }
    if idx == candles.len() {
        return Some(candles.len() - 1);
    }
    let before = time - candles[idx - 1].time;
    let after = candles[idx].time - time;
    if after < before {
        Some(idx)
    } else {
        Some(idx - 1)
    }
}
