//! Fee, slippage, funding and P&L primitives shared by the order machine and
//! the runner. All percentages are in percent units (0.05 = 0.05%).

use rand::rngs::StdRng;
use rand::Rng;

use crate::config::{FeesConfig, FundingConfig, FundingRate, SlippageConfig};
use crate::candle::HOUR_MS;

/// Precision scale used for deterministic rounding of ledger values.
pub const ACCOUNTING_QUANTUM: f64 = 1_000_000_000_000.0;

#[inline]
pub fn quantize(value: f64) -> f64 {
    (value * ACCOUNTING_QUANTUM).round() / ACCOUNTING_QUANTUM
}

/// Fee role used by maker/taker models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeRole {
    Maker,
    Taker,
}

#[derive(Debug, Clone, Copy)]
pub struct FeeModel {
    pub maker_fee_pct: f64,
    pub taker_fee_pct: f64,
}

impl From<&FeesConfig> for FeeModel {
    fn from(cfg: &FeesConfig) -> Self {
        Self {
            maker_fee_pct: cfg.maker_fee_pct,
            taker_fee_pct: cfg.taker_fee_pct,
        }
    }
}

impl FeeModel {
    #[inline]
    pub fn role_pct(self, role: FeeRole) -> f64 {
        match role {
            FeeRole::Maker => self.maker_fee_pct,
            FeeRole::Taker => self.taker_fee_pct,
        }
    }
}

/// Price moved against the trader by slippage.
#[derive(Debug, Clone, Copy)]
pub struct SlippageModel(pub SlippageConfig);

impl SlippageModel {
    /// Slippage in percent for a fill of `notional`.
    pub fn pct(&self, notional: f64, rng: &mut StdRng) -> f64 {
        match self.0 {
            SlippageConfig::None => 0.0,
            SlippageConfig::Fixed { pct } => pct,
            SlippageConfig::Random { min_pct, max_pct } => {
                if max_pct > min_pct {
                    rng.gen_range(min_pct..=max_pct)
                } else {
                    min_pct
                }
            }
            SlippageConfig::MarketImpact {
                base_pct,
                pct_per_1k_notional,
            } => base_pct + pct_per_1k_notional * notional.max(0.0) / 1000.0,
        }
    }

    /// Apply slippage to `price`. `buying` is true when the fill buys
    /// (long entry or short exit), which pushes the price up.
    pub fn apply(&self, price: f64, buying: bool, notional: f64, rng: &mut StdRng) -> f64 {
        let pct = self.pct(notional, rng);
        if buying {
            price * (1.0 + pct / 100.0)
        } else {
            price * (1.0 - pct / 100.0)
        }
    }
}

/// Periodic funding charged on open positions.
#[derive(Debug, Clone, Copy)]
pub struct FundingModel {
    pub enabled: bool,
    pub interval_ms: i64,
    pub rate: FundingRate,
}

impl From<&FundingConfig> for FundingModel {
    fn from(cfg: &FundingConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            interval_ms: cfg.interval_hours.max(1) as i64 * HOUR_MS,
            rate: cfg.rate,
        }
    }
}

impl FundingModel {
    /// Funding slot index of `time`.
    #[inline]
    pub fn slot(&self, time: i64) -> i64 {
        time.div_euclid(self.interval_ms)
    }

    /// Funding cost in percent of notional for crossing `boundaries` slots.
    pub fn accrue(&self, boundaries: i64, rng: &mut StdRng) -> f64 {
        if !self.enabled || boundaries <= 0 {
            return 0.0;
        }
        match self.rate {
            FundingRate::Fixed { rate_pct } => rate_pct * boundaries as f64,
            FundingRate::Random { min_pct, max_pct } => (0..boundaries)
                .map(|_| {
                    if max_pct > min_pct {
                        rng.gen_range(min_pct..=max_pct)
                    } else {
                        min_pct
                    }
                })
                .sum(),
        }
    }
}

/// Fee, slippage and funding models bundled for one run.
#[derive(Debug, Clone, Copy)]
pub struct CostModel {
    pub fees: FeeModel,
    pub slippage: SlippageModel,
    pub funding: FundingModel,
}

impl CostModel {
    pub fn new(fees: &FeesConfig, slippage: SlippageConfig, funding: &FundingConfig) -> Self {
        Self {
            fees: fees.into(),
            slippage: SlippageModel(slippage),
            funding: funding.into(),
        }
    }

    /// No fees, slippage or funding.
    pub fn free() -> Self {
        Self {
            fees: FeeModel {
                maker_fee_pct: 0.0,
                taker_fee_pct: 0.0,
            },
            slippage: SlippageModel(SlippageConfig::None),
            funding: FundingModel {
                enabled: false,
                interval_ms: 8 * HOUR_MS,
                rate: FundingRate::Fixed { rate_pct: 0.0 },
            },
        }
    }
}

/// Closed-position return before capital is applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeReturn {
    /// Price move in percent, signed by side.
    pub raw_pct: f64,
    /// Return on margin after fees and funding, scaled by leverage.
    pub return_pct: f64,
}

/// `long` is true for buy-side positions.
pub fn trade_return(
    long: bool,
    entry: f64,
    exit: f64,
    leverage: f64,
    entry_fee_pct: f64,
    exit_fee_pct: f64,
    funding_pct: f64,
) -> TradeReturn {
    if entry <= 0.0 {
        return TradeReturn {
            raw_pct: 0.0,
            return_pct: 0.0,
        };
    }
    let mv = (exit - entry) / entry * 100.0;
    let raw_pct = if long { mv } else { -mv };
    let net = raw_pct - entry_fee_pct - exit_fee_pct - funding_pct;
    TradeReturn {
        raw_pct,
        return_pct: net * leverage,
    }
}

/// Ledger transition for one closed trade.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Settlement {
    pub pnl_value: f64,
    pub pnl_percent: f64,
    pub capital_before: f64,
    pub capital_after: f64,
}

/// Apply a trade's return to the ledger. Capital never drops below zero;
/// a floored trade reports the full balance as its loss so that
/// `capital_after == capital_before * (1 + pnl_percent / 100)` holds.
pub fn settle(capital_before: f64, trade_size: f64, return_pct: f64) -> Settlement {
    let pnl_value = quantize(trade_size * return_pct / 100.0);
    let capital_after = quantize(capital_before + pnl_value);
    if capital_after <= 0.0 || capital_before <= 0.0 {
        return Settlement {
            pnl_value: -capital_before.max(0.0),
            pnl_percent: if capital_before > 0.0 { -100.0 } else { 0.0 },
            capital_before: capital_before.max(0.0),
            capital_after: 0.0,
        };
    }
    Settlement {
        pnl_value,
        pnl_percent: (capital_after - capital_before) / capital_before * 100.0,
        capital_before,
        capital_after,
    }
}
