//! End-to-end runs over synthetic candle series.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use swing_core::candle::MINUTE_MS;
use swing_core::config::{
    FundingRate, OrderType, Role, Sizing, SlippageConfig, TimeframeConfig, TradeDirection, TradingMode,
};
use swing_core::order::{ExitReason, Side};
use swing_core::pivot::{PivotKind, SwingParams, SwingPivotTracker};
use swing_core::{run_backtest, BacktestConfig, Candle, CoreError};

fn flat_series(prices: &[f64]) -> Vec<Candle> {
    prices
        .iter()
        .enumerate()
        .map(|(i, &p)| Candle::flat(i as i64 * MINUTE_MS, p))
        .collect()
}

/// Oscillating 1m series with wicks, deterministic for a given seed.
fn wavy_series(n: usize, seed: u64) -> Vec<Candle> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut prev: f64 = 100.0;
    (0..n)
        .map(|i| {
            let trend = 100.0 + 6.0 * (i as f64 / 25.0).sin();
            let close: f64 = trend + rng.gen_range(-0.6..0.6);
            let open = prev;
            let high = open.max(close) + rng.gen_range(0.0..0.4);
            let low = open.min(close) - rng.gen_range(0.0..0.4);
            prev = close;
            Candle::new(i as i64 * MINUTE_MS, open, high, low, close, 10.0)
        })
        .collect()
}

fn busy_config() -> BacktestConfig {
    let mut cfg = BacktestConfig::default();
    cfg.timeframes = vec![TimeframeConfig::new("5m", Role::Primary)];
    cfg.trade.enter_all = true;
    cfg.trade.max_concurrent_trades = 3;
    cfg.trade.sizing = Sizing::Percent { risk_pct: 20.0 };
    cfg.trade.leverage = 3.0;
    cfg.trade.max_trade_time_minutes = 90;
    cfg.slippage = SlippageConfig::Random {
        min_pct: 0.0,
        max_pct: 0.05,
    };
    cfg.funding.enabled = true;
    cfg.funding.interval_hours = 1;
    cfg.funding.rate = FundingRate::Random {
        min_pct: -0.01,
        max_pct: 0.02,
    };
    cfg
}

#[test]
fn scenario_a_high_pivot_at_103() {
    let mut tracker = SwingPivotTracker::new(SwingParams::default());
    let pivots: Vec<_> = flat_series(&[100.0, 101.0, 102.0, 103.0, 99.0, 98.0])
        .iter()
        .filter_map(|c| tracker.update(c))
        .collect();
    assert_eq!(pivots.len(), 1);
    let p = &pivots[0];
    assert_eq!(p.kind, PivotKind::High);
    assert_eq!(p.price, 103.0);
    assert_eq!(p.time, 3 * MINUTE_MS);
    assert_eq!(p.confirmation_time, 4 * MINUTE_MS);
    assert!((p.move_pct - 400.0 / 103.0).abs() < 1e-9);
}

#[test]
fn runs_are_reproducible() {
    let candles = wavy_series(1_500, 7);
    let cfg = busy_config();
    let a = run_backtest(&candles, &cfg).unwrap();
    let b = run_backtest(&candles, &cfg).unwrap();
    assert!(!a.trades.is_empty());
    assert_eq!(
        serde_json::to_string(&a).unwrap(),
        serde_json::to_string(&b).unwrap()
    );
    assert_eq!(a.final_capital.to_bits(), b.final_capital.to_bits());

    let mut other_seed = cfg.clone();
    other_seed.seed = cfg.seed + 1;
    let c = run_backtest(&candles, &other_seed).unwrap();
    assert_ne!(a.final_capital.to_bits(), c.final_capital.to_bits());
}

#[test]
fn capital_chains_through_every_trade() {
    let candles = wavy_series(2_000, 11);
    let res = run_backtest(&candles, &busy_config()).unwrap();
    assert!(res.trades.len() > 3);

    let mut capital = res.initial_capital;
    for t in &res.trades {
        assert_eq!(t.capital_before, capital);
        let expected = t.capital_before * (1.0 + t.pnl_percent / 100.0);
        assert!((t.capital_after - expected).abs() <= 1e-9 * t.capital_before.max(1.0));
        assert!(t.capital_after >= 0.0);
        capital = t.capital_after;
    }
    assert_eq!(capital, res.final_capital);
}

#[test]
fn fills_and_exits_stay_inside_their_candles() {
    let candles = wavy_series(2_000, 3);
    let mut cfg = busy_config();
    // Inverted signals put limits on the far side of the market, so they
    // fill on the next candle at its clamped extreme.
    cfg.trade.direction = TradeDirection::Alternate;
    cfg.trade.order_type = OrderType::Limit;
    cfg.trade.order_distance_pct = 20.0;
    cfg.slippage = SlippageConfig::Fixed { pct: 0.5 };
    let res = run_backtest(&candles, &cfg).unwrap();
    assert!(!res.trades.is_empty());

    let at = |time: i64| {
        candles
            .iter()
            .find(|c| c.time == time)
            .copied()
            .unwrap()
    };
    for t in &res.trades {
        let fill = at(t.order.fill_time.unwrap());
        let price = t.order.fill_price.unwrap();
        assert!(price >= fill.low && price <= fill.high, "fill {price} outside {fill:?}");

        let exit = at(t.order.exit_time.unwrap());
        let price = t.order.exit_price.unwrap();
        assert!(price >= exit.low && price <= exit.high, "exit {price} outside {exit:?}");
        assert!(t.order.exit_time >= t.order.fill_time);
    }
}

#[test]
fn timeouts_close_at_the_limit() {
    let candles = wavy_series(1_500, 5);
    let mut cfg = busy_config();
    cfg.trade.take_profit_pct = 50.0;
    cfg.trade.stop_loss_pct = 50.0;
    cfg.trade.max_trade_time_minutes = 30;
    let res = run_backtest(&candles, &cfg).unwrap();
    let timeouts: Vec<_> = res
        .trades
        .iter()
        .filter(|t| t.exit_reason() == Some(ExitReason::Timeout))
        .collect();
    assert!(!timeouts.is_empty());
    for t in timeouts {
        assert!(t.duration_ms >= 30 * MINUTE_MS);
        assert!(t.duration_ms < 31 * MINUTE_MS);
    }
}

fn cascade_config(min_timeframes_required: usize) -> BacktestConfig {
    let mut cfg = BacktestConfig::default();
    cfg.trading_mode = TradingMode::Cascade;
    cfg.timeframes = vec![
        TimeframeConfig::new("2m", Role::Primary),
        TimeframeConfig::new("1m", Role::Confirmation),
    ];
    cfg.cascade.min_timeframes_required = min_timeframes_required;
    cfg
}

#[test]
fn cascade_confirmed_by_finer_timeframe() {
    // 1m High at 103 (t=3) confirms at t=4; the 2m High (bucket t=2)
    // completes at t=5 and is accepted immediately.
    let candles = flat_series(&[100.0, 101.0, 102.0, 103.0, 99.0, 98.0, 97.5, 97.0, 96.5, 96.0]);
    let res = run_backtest(&candles, &cascade_config(2)).unwrap();
    assert_eq!(res.stats.primary_signals, 1);
    assert_eq!(res.stats.confirmed_signals, 1);
    assert_eq!(res.trades.len(), 1);
    let t = &res.trades[0];
    assert_eq!(t.order.side, Side::Sell);
    assert_eq!(t.order.fill_time, Some(5 * MINUTE_MS));
    assert_eq!(t.order.fill_price, Some(98.0));
    assert_eq!(t.exit_reason(), Some(ExitReason::TakeProfit));
}

#[test]
fn cascade_window_expires_without_enough_timeframes() {
    let candles = flat_series(&[100.0, 101.0, 102.0, 103.0, 99.0, 98.0, 97.5, 97.0, 96.5, 96.0]);
    let res = run_backtest(&candles, &cascade_config(3)).unwrap();
    assert_eq!(res.stats.primary_signals, 1);
    assert_eq!(res.stats.confirmed_signals, 0);
    assert_eq!(res.stats.expired_windows, 1);
    assert!(res.trades.is_empty());
    assert_eq!(res.final_capital, res.initial_capital);
}

#[test]
fn wiped_out_capital_blocks_further_trades() {
    let mut cfg = BacktestConfig::default();
    cfg.timeframes = vec![TimeframeConfig::new("1m", Role::Primary)];
    cfg.trade.leverage = 200.0;
    // Short at 99 stops out on the gap to 101; the Low pivot confirmed by
    // the same candle finds no capital left.
    let candles = flat_series(&[100.0, 101.0, 102.0, 103.0, 99.0, 101.0, 102.0]);
    let res = run_backtest(&candles, &cfg).unwrap();
    assert_eq!(res.trades.len(), 1);
    let t = &res.trades[0];
    assert_eq!(t.exit_reason(), Some(ExitReason::StopLoss));
    assert_eq!(t.order.exit_price, Some(101.0));
    assert_eq!(t.capital_after, 0.0);
    assert_eq!(t.pnl_percent, -100.0);
    assert_eq!(res.final_capital, 0.0);
    assert_eq!(res.stats.primary_signals, 2);
    assert_eq!(res.stats.blocked_by_margin, 1);
}

#[test]
fn short_history_is_rejected() {
    let cfg = busy_config();
    let err = run_backtest(&wavy_series(5, 1), &cfg).unwrap_err();
    assert!(matches!(err, CoreError::InsufficientHistory { available: 5, .. }));
}
