//! Summary statistics over a finished run.
//!
//! End-of-data closes are bookkeeping, not strategy exits: they move the
//! capital but are left out of trade counts, win rate and profit factor.

use serde::{Deserialize, Serialize};

use crate::engine::{BacktestResult, SignalStats};
use crate::order::{ExitReason, Trade};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestSummary {
    pub trade_count: usize,
    pub wins: usize,
    pub losses: usize,
    /// Fraction in `[0, 1]`.
    pub win_rate: f64,
    pub net_pnl_pct: f64,
    pub profit_factor: f64,
    /// Largest peak-to-trough fall of the capital curve, percent of peak.
    pub max_drawdown_pct: f64,
    pub initial_capital: f64,
    pub final_capital: f64,
    pub end_of_data_count: usize,
    pub take_profit_count: usize,
    pub stop_loss_count: usize,
    pub timeout_count: usize,
    pub avg_pnl_pct: f64,
    pub stats: SignalStats,
}

fn is_strategy_exit(t: &Trade) -> bool {
    t.exit_reason() != Some(ExitReason::EndOfData)
}

pub fn summarize(result: &BacktestResult) -> BacktestSummary {
    let closes: Vec<&Trade> = result.trades.iter().filter(|t| is_strategy_exit(t)).collect();
    let count_reason = |r: ExitReason| closes.iter().filter(|t| t.exit_reason() == Some(r)).count();

    let mut wins = 0;
    let mut losses = 0;
    let mut gross_profit: f64 = 0.0;
    let mut gross_loss: f64 = 0.0;
    for t in &closes {
        if t.pnl_value > 0.0 {
            wins += 1;
            gross_profit += t.pnl_value;
        } else if t.pnl_value < 0.0 {
            losses += 1;
            gross_loss += t.pnl_value;
        }
    }

    let trade_count = closes.len();
    let win_rate = if trade_count > 0 {
        wins as f64 / trade_count as f64
    } else {
        0.0
    };
    let profit_factor = if gross_loss.abs() > 1e-12 {
        gross_profit / gross_loss.abs()
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };
    let avg_pnl_pct = if trade_count > 0 {
        closes.iter().map(|t| t.pnl_percent).sum::<f64>() / trade_count as f64
    } else {
        0.0
    };
    let net_pnl_pct = if result.initial_capital > 0.0 {
        (result.final_capital - result.initial_capital) / result.initial_capital * 100.0
    } else {
        0.0
    };

    BacktestSummary {
        trade_count,
        wins,
        losses,
        win_rate,
        net_pnl_pct,
        profit_factor,
        max_drawdown_pct: max_drawdown_pct(&result.equity_curve),
        initial_capital: result.initial_capital,
        final_capital: result.final_capital,
        end_of_data_count: result.trades.len() - trade_count,
        take_profit_count: count_reason(ExitReason::TakeProfit),
        stop_loss_count: count_reason(ExitReason::StopLoss),
        timeout_count: count_reason(ExitReason::Timeout),
        avg_pnl_pct,
        stats: result.stats.clone(),
    }
}

/// Maximum drawdown of `(time, capital)` points as a percent of the running peak.
pub fn max_drawdown_pct(curve: &[(i64, f64)]) -> f64 {
    let Some(&(_, first)) = curve.first() else {
        return 0.0;
    };
    let mut peak = first;
    let mut max_dd: f64 = 0.0;
    for &(_, bal) in curve {
        if bal > peak {
            peak = bal;
        }
        if peak > 1e-12 {
            max_dd = max_dd.max((peak - bal) / peak * 100.0);
        }
    }
    max_dd
}
