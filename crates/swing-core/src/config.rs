//! Backtest configuration.
//!
//! YAML merge hierarchy: defaults <- global <- symbols.<SYMBOL>.
//! Every section carries `#[serde(default)]` so a file only needs the keys
//! that differ from the defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::candle::{parse_timeframe, MINUTE_MS};
use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// How primary-timeframe pivots turn into trades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    /// Every primary pivot is a signal.
    #[default]
    Pivot,
    /// Primary pivots wait for cross-timeframe confirmation.
    Cascade,
}

/// Which candle prices the pivot detectors read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    #[default]
    HighLow,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    /// Retracement state machine.
    #[default]
    Swing,
    /// Fixed-window local extreme.
    Lookback,
}

/// Seed values for a freshly opened aggregate candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregatorSeed {
    /// open = high = low = close = base close.
    #[default]
    Close,
    /// Copy the opening base candle's OHLCV.
    Ohlc,
}

/// Role a timeframe plays in cascade confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Primary,
    #[default]
    Confirmation,
    Execution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    #[default]
    Market,
    Limit,
}

/// Entry direction filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeDirection {
    #[default]
    Both,
    Buy,
    Sell,
    /// Trade every signal in the inverted direction.
    Alternate,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Sizing {
    /// Constant margin per trade.
    Fixed { amount: f64 },
    /// `risk_pct` percent of current capital.
    Percent { risk_pct: f64 },
    /// Percent of capital, but never below `minimum`.
    Minimum { risk_pct: f64, minimum: f64 },
}

impl Default for Sizing {
    fn default() -> Self {
        Sizing::Percent { risk_pct: 100.0 }
    }
}

impl Sizing {
    pub fn trade_size(&self, capital: f64) -> f64 {
        match *self {
            Sizing::Fixed { amount } => amount,
            Sizing::Percent { risk_pct } => capital * risk_pct / 100.0,
            Sizing::Minimum { risk_pct, minimum } => (capital * risk_pct / 100.0).max(minimum),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum SlippageConfig {
    #[default]
    None,
    Fixed {
        pct: f64,
    },
    /// Uniform draw in `[min_pct, max_pct]` per fill.
    Random {
        min_pct: f64,
        max_pct: f64,
    },
    /// `base_pct + pct_per_1k_notional * notional / 1000`.
    MarketImpact {
        base_pct: f64,
        pct_per_1k_notional: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FundingRate {
    Fixed { rate_pct: f64 },
    Random { min_pct: f64, max_pct: f64 },
}

impl Default for FundingRate {
    fn default() -> Self {
        FundingRate::Fixed { rate_pct: 0.01 }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Interval of the raw candle stream fed to the runner.
    pub base_interval: String,
    /// Lower bound on the number of base candles a run accepts.
    pub min_history_candles: usize,
    pub aggregator_seed: AggregatorSeed,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            base_interval: "1m".to_string(),
            min_history_candles: 2,
            aggregator_seed: AggregatorSeed::Close,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PivotConfig {
    pub detector: DetectorKind,
    pub price_source: PriceSource,
    /// Fraction, e.g. 0.001 for 0.1%.
    pub swing_threshold: f64,
    pub lookback: usize,
    pub min_leg_bars: usize,
    pub enforce_min_leg_bars: bool,
    /// Pivots kept per timeframe for cascade lookups.
    pub history_len: usize,
    /// Number of recent pivots averaged for order distance and cancellation.
    pub avg_swing_window: usize,
}

impl Default for PivotConfig {
    fn default() -> Self {
        Self {
            detector: DetectorKind::Swing,
            price_source: PriceSource::HighLow,
            swing_threshold: 0.01,
            lookback: 1,
            min_leg_bars: 1,
            enforce_min_leg_bars: false,
            history_len: 64,
            avg_swing_window: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeframeConfig {
    pub interval: String,
    pub role: Role,
    pub weight: f64,
    /// Confirm with the inverted signal on this timeframe.
    pub opposite: bool,
    pub swing_threshold: Option<f64>,
    pub lookback: Option<usize>,
    pub min_leg_bars: Option<usize>,
}

impl Default for TimeframeConfig {
    fn default() -> Self {
        Self {
            interval: "15m".to_string(),
            role: Role::Confirmation,
            weight: 1.0,
            opposite: false,
            swing_threshold: None,
            lookback: None,
            min_leg_bars: None,
        }
    }
}

impl TimeframeConfig {
    pub fn new(interval: &str, role: Role) -> Self {
        Self {
            interval: interval.to_string(),
            role,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    /// Primary plus confirmations needed to accept a signal.
    pub min_timeframes_required: usize,
    pub confirmation_window_minutes: u32,
    pub execution_window_minutes: u32,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            min_timeframes_required: 2,
            confirmation_window_minutes: 5,
            execution_window_minutes: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradeConfig {
    pub initial_capital: f64,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub leverage: f64,
    pub order_type: OrderType,
    /// Limit offset as a percent of the average recent swing.
    pub order_distance_pct: f64,
    /// Cancel distance as a percent of the average recent swing.
    pub cancel_threshold_pct: f64,
    /// Zero disables the timeout.
    pub max_trade_time_minutes: u32,
    pub direction: TradeDirection,
    pub sizing: Sizing,
    pub entry_delay_minutes: u32,
    pub no_trade_days: Vec<String>,
    pub enter_all: bool,
    pub max_concurrent_trades: usize,
}

impl Default for TradeConfig {
    fn default() -> Self {
        Self {
            initial_capital: 1000.0,
            take_profit_pct: 2.0,
            stop_loss_pct: 1.0,
            leverage: 1.0,
            order_type: OrderType::Market,
            order_distance_pct: 50.0,
            cancel_threshold_pct: 100.0,
            max_trade_time_minutes: 0,
            direction: TradeDirection::Both,
            sizing: Sizing::default(),
            entry_delay_minutes: 0,
            no_trade_days: Vec::new(),
            enter_all: false,
            max_concurrent_trades: 1,
        }
    }
}

impl TradeConfig {
    /// Upper bound on live orders and positions.
    pub fn position_limit(&self) -> usize {
        if self.enter_all {
            self.max_concurrent_trades.max(1)
        } else {
            1
        }
    }

    pub fn max_trade_time_ms(&self) -> Option<i64> {
        (self.max_trade_time_minutes > 0).then(|| self.max_trade_time_minutes as i64 * MINUTE_MS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeesConfig {
    /// Percent of notional on limit entries and take-profit exits.
    pub maker_fee_pct: f64,
    /// Percent of notional on market entries and every other exit.
    pub taker_fee_pct: f64,
}

impl Default for FeesConfig {
    fn default() -> Self {
        Self {
            maker_fee_pct: 0.02,
            taker_fee_pct: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FundingConfig {
    pub enabled: bool,
    pub interval_hours: u32,
    pub rate: FundingRate,
}

impl Default for FundingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_hours: 8,
            rate: FundingRate::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub trading_mode: TradingMode,
    /// Seed for randomised slippage and funding draws.
    pub seed: u64,
    pub data: DataConfig,
    pub pivot: PivotConfig,
    pub timeframes: Vec<TimeframeConfig>,
    pub cascade: CascadeConfig,
    pub trade: TradeConfig,
    pub fees: FeesConfig,
    pub slippage: SlippageConfig,
    pub funding: FundingConfig,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Pivot,
            seed: 42,
            data: DataConfig::default(),
            pivot: PivotConfig::default(),
            timeframes: vec![TimeframeConfig::new("15m", Role::Primary)],
            cascade: CascadeConfig::default(),
            trade: TradeConfig::default(),
            fees: FeesConfig::default(),
            slippage: SlippageConfig::None,
            funding: FundingConfig::default(),
        }
    }
}

impl BacktestConfig {
    /// Index of the single primary timeframe.
    pub fn primary_index(&self) -> Option<usize> {
        self.timeframes.iter().position(|tf| tf.role == Role::Primary)
    }

    pub fn base_ms(&self) -> Result<i64, CoreError> {
        parse_timeframe(&self.data.base_interval)
    }

    /// Effective swing threshold for timeframe `idx`.
    pub fn swing_threshold_for(&self, idx: usize) -> f64 {
        self.timeframes
            .get(idx)
            .and_then(|tf| tf.swing_threshold)
            .unwrap_or(self.pivot.swing_threshold)
    }

    pub fn lookback_for(&self, idx: usize) -> usize {
        self.timeframes
            .get(idx)
            .and_then(|tf| tf.lookback)
            .unwrap_or(self.pivot.lookback)
    }

    pub fn min_leg_bars_for(&self, idx: usize) -> usize {
        self.timeframes
            .get(idx)
            .and_then(|tf| tf.min_leg_bars)
            .unwrap_or(self.pivot.min_leg_bars)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let invalid = |msg: String| Err(CoreError::InvalidConfig(msg));

        let base_ms = self.base_ms()?;
        let primaries = self
            .timeframes
            .iter()
            .filter(|tf| tf.role == Role::Primary)
            .count();
        match primaries {
            0 => return invalid("no primary timeframe configured".to_string()),
            1 => {}
            n => return invalid(format!("{n} primary timeframes configured, expected one")),
        }

        for tf in &self.timeframes {
            let tf_ms = parse_timeframe(&tf.interval)?;
            if tf_ms < base_ms || tf_ms % base_ms != 0 {
                return invalid(format!(
                    "timeframe {} is not a whole multiple of base interval {}",
                    tf.interval, self.data.base_interval
                ));
            }
            if tf.weight < 0.0 {
                return invalid(format!("timeframe {} has negative weight", tf.interval));
            }
            if tf.swing_threshold.is_some_and(|t| t < 0.0) {
                return invalid(format!("timeframe {} has negative swing_threshold", tf.interval));
            }
        }
        let mut labels: Vec<&str> = self.timeframes.iter().map(|tf| tf.interval.as_str()).collect();
        labels.sort_unstable();
        if labels.windows(2).any(|w| w[0] == w[1]) {
            return invalid("duplicate timeframe interval".to_string());
        }

        let t = &self.trade;
        if !(t.leverage > 0.0) {
            return invalid(format!("leverage must be positive, got {}", t.leverage));
        }
        if !(t.initial_capital > 0.0) {
            return invalid(format!("initial_capital must be positive, got {}", t.initial_capital));
        }
        let pcts = [
            ("trade.take_profit_pct", t.take_profit_pct),
            ("trade.stop_loss_pct", t.stop_loss_pct),
            ("trade.order_distance_pct", t.order_distance_pct),
            ("trade.cancel_threshold_pct", t.cancel_threshold_pct),
            ("pivot.swing_threshold", self.pivot.swing_threshold),
            ("fees.maker_fee_pct", self.fees.maker_fee_pct),
            ("fees.taker_fee_pct", self.fees.taker_fee_pct),
        ];
        for (name, value) in pcts {
            if value < 0.0 || !value.is_finite() {
                return invalid(format!("{name} must be a non-negative number, got {value}"));
            }
        }
        match t.sizing {
            Sizing::Fixed { amount } if amount < 0.0 => {
                return invalid("sizing amount must be non-negative".to_string())
            }
            Sizing::Percent { risk_pct } | Sizing::Minimum { risk_pct, .. } if risk_pct < 0.0 => {
                return invalid("sizing risk_pct must be non-negative".to_string())
            }
            _ => {}
        }
        match self.slippage {
            SlippageConfig::Fixed { pct } if pct < 0.0 => {
                return invalid("slippage pct must be non-negative".to_string())
            }
            SlippageConfig::Random { min_pct, max_pct } if min_pct < 0.0 || max_pct < min_pct => {
                return invalid("slippage range must satisfy 0 <= min_pct <= max_pct".to_string())
            }
            SlippageConfig::MarketImpact {
                base_pct,
                pct_per_1k_notional,
            } if base_pct < 0.0 || pct_per_1k_notional < 0.0 => {
                return invalid("market impact slippage must be non-negative".to_string())
            }
            _ => {}
        }
        if self.funding.enabled {
            if self.funding.interval_hours == 0 {
                return invalid("funding interval_hours must be positive".to_string());
            }
            if let FundingRate::Random { min_pct, max_pct } = self.funding.rate {
                if max_pct < min_pct {
                    return invalid("funding range must satisfy min_pct <= max_pct".to_string());
                }
            }
        }
        const DAYS: [&str; 7] = ["Su", "M", "T", "W", "Th", "F", "Sa"];
        if let Some(day) = t.no_trade_days.iter().find(|d| !DAYS.contains(&d.as_str())) {
            return invalid(format!("unknown no_trade_days entry {day:?}"));
        }
        if self.trading_mode == TradingMode::Cascade && self.cascade.min_timeframes_required == 0 {
            return invalid("cascade.min_timeframes_required must be at least 1".to_string());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// YAML overlay structure
// ---------------------------------------------------------------------------
//
// ```yaml
// global:
//   trade: { ... }
//   pivot: { ... }
// symbols:
//   BTCUSDT:
//     trade: { leverage: 5 }
// ```
//
// Overlays are deep-merged at the `serde_yaml::Value` level on top of the
// serialised defaults, so a partial section keeps every other default key.

#[derive(Debug, Deserialize)]
struct YamlRoot {
    #[serde(default)]
    global: serde_yaml::Value,
    #[serde(default)]
    symbols: serde_yaml::Value,
}

/// Recursively merge `overlay` into `base`. Mappings merge key by key;
/// anything else is replaced. A null overlay keeps the base value.
fn deep_merge(base: &mut serde_yaml::Value, overlay: &serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(ref mut base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, overlay_val) in overlay_map.iter() {
                if let Some(base_val) = base_map.get_mut(key) {
                    deep_merge(base_val, overlay_val);
                } else {
                    base_map.insert(key.clone(), overlay_val.clone());
                }
            }
        }
        (base, overlay) => {
            if !overlay.is_null() {
                *base = overlay.clone();
            }
        }
    }
}

/// Parse a YAML document and resolve it for `symbol`.
pub fn load_config_str(raw: &str, symbol: Option<&str>) -> Result<BacktestConfig, CoreError> {
    let root: YamlRoot = if raw.trim().is_empty() {
        YamlRoot {
            global: serde_yaml::Value::Null,
            symbols: serde_yaml::Value::Null,
        }
    } else {
        serde_yaml::from_str(raw)?
    };

    let mut merged = serde_yaml::to_value(BacktestConfig::default())?;

    if !root.global.is_null() {
        deep_merge(&mut merged, &root.global);
    }

    if let (Some(sym), serde_yaml::Value::Mapping(symbols_map)) = (symbol, &root.symbols) {
        let exact = serde_yaml::Value::String(sym.to_string());
        let upper = serde_yaml::Value::String(sym.to_uppercase());
        if let Some(overrides) = symbols_map.get(&exact).or_else(|| symbols_map.get(&upper)) {
            deep_merge(&mut merged, overrides);
        }
    }

    Ok(serde_yaml::from_value(merged)?)
}

/// Load a config file. A missing file yields defaults; a malformed one is an error.
pub fn load_config(path: &Path, symbol: Option<&str>) -> Result<BacktestConfig, CoreError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "config file does not exist, using defaults");
            return Ok(BacktestConfig::default());
        }
        Err(e) => return Err(e.into()),
    };
    load_config_str(&raw, symbol)
}
