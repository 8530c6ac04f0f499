//! SQLite-backed cache of detected pivots.
//!
//! Rows are keyed by the JSON of [`PivotCacheKey`]. A row is only trusted when
//! its stored key is byte-identical to the requested one and the SHA-256
//! checksum over the payload verifies; anything else is a miss.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use swing_core::config::{AggregatorSeed, DetectorKind, PriceSource};
use swing_core::{BacktestConfig, Candle, CoreError, Pivot};
use tracing::{debug, warn};

use crate::error::DataError;

/// Every setting the cached pivots depend on, plus the base candle window
/// they were detected over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotCacheKey {
    pub symbol: String,
    pub base_interval: String,
    pub interval: String,
    pub detector: DetectorKind,
    pub price_source: PriceSource,
    pub aggregator_seed: AggregatorSeed,
    pub swing_threshold: f64,
    pub short_window: usize,
    pub long_window: usize,
    pub min_leg_bars: usize,
    pub enforce_min_leg_bars: bool,
    pub first_time: Option<i64>,
    pub last_time: Option<i64>,
    pub base_candles: usize,
}

impl PivotCacheKey {
    /// Key for timeframe `tf` of `cfg` detected over `base`.
    pub fn new(symbol: &str, cfg: &BacktestConfig, tf: usize, base: &[Candle]) -> Result<Self, DataError> {
        let interval = cfg
            .timeframes
            .get(tf)
            .map(|t| t.interval.clone())
            .ok_or_else(|| CoreError::InvalidConfig(format!("no timeframe at index {tf}")))?;
        Ok(Self {
            symbol: symbol.to_string(),
            base_interval: cfg.data.base_interval.clone(),
            interval,
            detector: cfg.pivot.detector,
            price_source: cfg.pivot.price_source,
            aggregator_seed: cfg.data.aggregator_seed,
            swing_threshold: cfg.swing_threshold_for(tf),
            short_window: cfg.lookback_for(tf),
            long_window: cfg.pivot.avg_swing_window,
            min_leg_bars: cfg.min_leg_bars_for(tf),
            enforce_min_leg_bars: cfg.pivot.enforce_min_leg_bars,
            first_time: base.first().map(|c| c.time),
            last_time: base.last().map(|c| c.time),
            base_candles: base.len(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotCacheEntry {
    pub pivots: Vec<Pivot>,
    pub candles: Vec<Candle>,
}

fn sha256_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn ensure_table(conn: &Connection) -> Result<(), DataError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS pivot_cache (
             key_json     TEXT PRIMARY KEY,
             pivots_json  TEXT NOT NULL,
             candles_json TEXT NOT NULL,
             checksum     TEXT NOT NULL
         );",
    )?;
    Ok(())
}

pub struct PivotCache {
    conn: Connection,
}

impl PivotCache {
    pub fn open(db_path: &Path) -> Result<Self, DataError> {
        let conn = Connection::open(db_path)?;
        ensure_table(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, DataError> {
        let conn = Connection::open_in_memory()?;
        ensure_table(&conn)?;
        Ok(Self { conn })
    }

    /// Replace whatever is stored under `key`.
    pub fn store(&self, key: &PivotCacheKey, entry: &PivotCacheEntry) -> Result<(), DataError> {
        let key_json = serde_json::to_string(key)?;
        let pivots_json = serde_json::to_string(&entry.pivots)?;
        let candles_json = serde_json::to_string(&entry.candles)?;
        let checksum = sha256_hex(&[&pivots_json, &candles_json]);
        self.conn.execute(
            "INSERT OR REPLACE INTO pivot_cache (key_json, pivots_json, candles_json, checksum) \
             VALUES (?1, ?2, ?3, ?4)",
            params![key_json, pivots_json, candles_json, checksum],
        )?;
        debug!(key = %key_json, pivots = entry.pivots.len(), "pivot cache stored");
        Ok(())
    }

    /// `Ok(None)` on a miss, including a corrupted row.
    pub fn load(&self, key: &PivotCacheKey) -> Result<Option<PivotCacheEntry>, DataError> {
        let key_json = serde_json::to_string(key)?;
        let row = self
            .conn
            .query_row(
                "SELECT key_json, pivots_json, candles_json, checksum FROM pivot_cache WHERE key_json = ?1",
                params![key_json],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((stored_key, pivots_json, candles_json, checksum)) = row else {
            return Ok(None);
        };
        if stored_key.as_bytes() != key_json.as_bytes() {
            return Ok(None);
        }
        let actual = sha256_hex(&[&pivots_json, &candles_json]);
        if actual != checksum {
            warn!(key = %key_json, "pivot cache checksum mismatch, treating as miss");
            return Ok(None);
        }
        Ok(Some(PivotCacheEntry {
            pivots: serde_json::from_str(&pivots_json)?,
            candles: serde_json::from_str(&candles_json)?,
        }))
    }
}
