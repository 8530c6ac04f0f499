//! Backtest runner.
//!
//! Folds one base candle series through aggregation, pivot detection,
//! optional cascade confirmation and the order lifecycle. Per candle:
//! exits on open positions → pending orders (cancel / fill) → settlement →
//! aggregation and pivots → signals → order placement.
//!
//! A run is a pure function of `(candles, config)`: the only randomness is
//! the `StdRng` seeded from `config.seed`.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::aggregator::CandleAggregator;
use crate::accounting::CostModel;
use crate::candle::{parse_timeframe, validate_series, weekday_code, Candle, MINUTE_MS};
use crate::cascade::{CascadeEngine, PivotBook};
use crate::config::{BacktestConfig, TradeDirection, TradingMode};
use crate::error::CoreError;
use crate::order::{ExitReason, Order, OrderParams, OrderRequest, OrderStatus, PendingOutcome, Side, Trade};
use crate::pivot::{EdgeSnapshot, Pivot, PivotDetector, Signal};

// ---------------------------------------------------------------------------
// Public result types
// ---------------------------------------------------------------------------

/// Edge snapshots by timeframe label, then by candle time.
pub type EdgeMap = FxHashMap<String, FxHashMap<i64, EdgeSnapshot>>;

/// Signal and order counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalStats {
    pub primary_signals: u64,
    pub confirmed_signals: u64,
    pub expired_windows: u64,
    pub orders_placed: u64,
    pub executed_orders: u64,
    pub cancelled_orders: u64,
    pub blocked_by_direction: u64,
    pub blocked_by_day: u64,
    pub blocked_by_max_positions: u64,
    pub blocked_by_margin: u64,
    pub skipped_no_swing: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub trades: Vec<Trade>,
    pub initial_capital: f64,
    pub final_capital: f64,
    /// `(time, capital)` after every settlement, starting with the initial balance.
    pub equity_curve: Vec<(i64, f64)>,
    /// Primary-timeframe pivots in emission order.
    pub primary_pivots: Vec<Pivot>,
    pub stats: SignalStats,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// A signal ready for placement.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    signal: Signal,
    reference_price: f64,
}

pub struct BacktestRunner<'a> {
    cfg: &'a BacktestConfig,
    edges: Option<&'a EdgeMap>,
    base_ms: i64,
    primary: usize,
}

impl<'a> BacktestRunner<'a> {
    pub fn new(cfg: &'a BacktestConfig) -> Result<Self, CoreError> {
        cfg.validate()?;
        let primary = cfg
            .primary_index()
            .ok_or_else(|| CoreError::InvalidConfig("no primary timeframe configured".to_string()))?;
        Ok(Self {
            cfg,
            edges: None,
            base_ms: cfg.base_ms()?,
            primary,
        })
    }

    /// Attach precomputed edge snapshots to emitted pivots.
    pub fn with_edges(mut self, edges: &'a EdgeMap) -> Self {
        self.edges = Some(edges);
        self
    }

    /// Base candles needed before the primary timeframe can produce a pivot.
    pub fn required_history(&self) -> Result<usize, CoreError> {
        let primary_ms = parse_timeframe(&self.cfg.timeframes[self.primary].interval)?;
        let bars = (primary_ms / self.base_ms) as usize;
        let lookback = self.cfg.lookback_for(self.primary);
        Ok(self.cfg.data.min_history_candles.max(bars * (lookback + 1)))
    }

    pub fn run(&self, candles: &[Candle]) -> Result<BacktestResult, CoreError> {
        validate_series(candles)?;
        let required = self.required_history()?;
        if candles.len() < required {
            return Err(CoreError::InsufficientHistory {
                required,
                available: candles.len(),
            });
        }

        let mut state = RunState::new(self.cfg, self.base_ms, self.primary)?;
        if let Some(first) = candles.first() {
            state.equity_curve[0].0 = first.time;
        }
        for (i, candle) in candles.iter().enumerate() {
            state.step(self, candle, &candles[..=i]);
        }
        if let Some(last) = candles.last() {
            state.finish(last);
        }

        debug!(
            trades = state.trades.len(),
            final_capital = state.capital,
            "backtest finished"
        );
        Ok(BacktestResult {
            trades: state.trades,
            initial_capital: self.cfg.trade.initial_capital,
            final_capital: state.capital,
            equity_curve: state.equity_curve,
            primary_pivots: state.primary_pivots,
            stats: state.stats,
        })
    }
}

/// Convenience wrapper: validate, build a runner and run it.
pub fn run_backtest(candles: &[Candle], cfg: &BacktestConfig) -> Result<BacktestResult, CoreError> {
    BacktestRunner::new(cfg)?.run(candles)
}

/// Closed bars and pivots of timeframe `tf`, stamped the way the runner
/// stamps them. The unfinished tail bucket is left out.
pub fn timeframe_pivots(
    cfg: &BacktestConfig,
    tf: usize,
    candles: &[Candle],
) -> Result<(Vec<Candle>, Vec<Pivot>), CoreError> {
    let label = cfg
        .timeframes
        .get(tf)
        .map(|t| t.interval.as_str())
        .ok_or_else(|| CoreError::InvalidConfig(format!("no timeframe at index {tf}")))?;
    validate_series(candles)?;
    let mut aggregator = CandleAggregator::new(&[label], cfg.base_ms()?, cfg.data.aggregator_seed)?;
    let mut detector = PivotDetector::for_timeframe(cfg, tf);
    let mut bars = Vec::new();
    let mut pivots = Vec::new();
    for candle in candles {
        for (_, bar) in aggregator.update(candle) {
            bars.push(bar);
            if let Some(pivot) = detector.update(&bar) {
                pivots.push(Pivot {
                    confirmation_time: candle.time,
                    ..pivot
                });
            }
        }
    }
    Ok((bars, pivots))
}

// ---------------------------------------------------------------------------
// Per-run mutable state
// ---------------------------------------------------------------------------

struct RunState {
    aggregator: CandleAggregator,
    detectors: Vec<PivotDetector>,
    book: PivotBook,
    cascade: CascadeEngine,
    costs: CostModel,
    params: OrderParams,
    rng: StdRng,
    capital: f64,
    next_id: usize,
    /// Unfilled and filled orders, in placement order.
    live: Vec<Order>,
    pending_windows: Vec<Pivot>,
    primary_pivots: Vec<Pivot>,
    trades: Vec<Trade>,
    equity_curve: Vec<(i64, f64)>,
    stats: SignalStats,
}

impl RunState {
    fn new(cfg: &BacktestConfig, base_ms: i64, primary: usize) -> Result<Self, CoreError> {
        let labels: Vec<&str> = cfg.timeframes.iter().map(|tf| tf.interval.as_str()).collect();
        let aggregator = CandleAggregator::new(labels.as_slice(), base_ms, cfg.data.aggregator_seed)?;
        let detectors = (0..labels.len())
            .map(|idx| PivotDetector::for_timeframe(cfg, idx))
            .collect();
        Ok(Self {
            aggregator,
            detectors,
            book: PivotBook::new(labels.len(), cfg.pivot.history_len),
            cascade: CascadeEngine::from_config(cfg, primary),
            costs: CostModel::new(&cfg.fees, cfg.slippage, &cfg.funding),
            params: OrderParams::from(&cfg.trade),
            rng: StdRng::seed_from_u64(cfg.seed),
            capital: cfg.trade.initial_capital,
            next_id: 0,
            live: Vec::new(),
            pending_windows: Vec::new(),
            primary_pivots: Vec::new(),
            trades: Vec::new(),
            equity_curve: vec![(0, cfg.trade.initial_capital)],
            stats: SignalStats::default(),
        })
    }

    fn step(&mut self, runner: &BacktestRunner<'_>, candle: &Candle, seen: &[Candle]) {
        // ── Exits on positions filled before this candle ─────────────────
        for order in self.live.iter_mut().filter(|o| o.is_filled()) {
            if let Some(reason) = order.step_filled(candle, &self.params, &self.costs, &mut self.rng) {
                debug!(id = order.id, ?reason, price = ?order.exit_price, "position closed");
            }
        }

        // ── Pending orders: cancellation, then fill ──────────────────────
        for order in self.live.iter_mut().filter(|o| !o.is_filled()) {
            match order.step_pending(candle, &self.params, &self.costs, &mut self.rng) {
                PendingOutcome::Filled => {
                    self.stats.executed_orders += 1;
                    debug!(id = order.id, side = ?order.side, price = ?order.fill_price, "order filled");
                }
                PendingOutcome::Cancelled => {
                    self.stats.cancelled_orders += 1;
                    debug!(id = order.id, "order cancelled");
                }
                PendingOutcome::Waiting => {}
            }
        }
        self.settle_terminal();

        // ── Aggregation and pivots ───────────────────────────────────────
        let mut new_primary = Vec::new();
        for (tf, bar) in self.aggregator.update(candle) {
            let Some(pivot) = self.detectors[tf].update(&bar) else {
                continue;
            };
            // Aggregates are stamped with their bucket start; the pivot is
            // known once the base candle closing the bucket arrives.
            let edges = runner
                .edges
                .and_then(|m| m.get(self.aggregator.label(tf)))
                .and_then(|m| m.get(&pivot.time))
                .cloned();
            let pivot = Pivot {
                confirmation_time: candle.time,
                ..pivot
            }
            .with_edges(edges);
            if tf == runner.primary {
                new_primary.push(pivot.clone());
            }
            self.book.push(tf, pivot);
        }

        // ── Signals ──────────────────────────────────────────────────────
        let mut candidates = Vec::new();
        for pivot in new_primary {
            self.stats.primary_signals += 1;
            self.primary_pivots.push(pivot.clone());
            match runner.cfg.trading_mode {
                TradingMode::Pivot => {
                    self.stats.confirmed_signals += 1;
                    candidates.push(Candidate {
                        signal: pivot.signal(),
                        reference_price: pivot.price,
                    });
                }
                TradingMode::Cascade => self.pending_windows.push(pivot),
            }
        }

        if !self.pending_windows.is_empty() {
            let mut waiting = Vec::with_capacity(self.pending_windows.len());
            for pivot in std::mem::take(&mut self.pending_windows) {
                if candle.time > self.cascade.deadline(&pivot) {
                    self.stats.expired_windows += 1;
                } else if let Some(res) = self.cascade.confirm(&pivot, candle.time, &self.book, seen) {
                    self.stats.confirmed_signals += 1;
                    debug!(
                        signal = ?res.signal,
                        strength = res.strength,
                        confirmations = res.confirmations.len(),
                        "cascade confirmed"
                    );
                    candidates.push(Candidate {
                        signal: res.signal,
                        reference_price: res.execution_price,
                    });
                } else {
                    waiting.push(pivot);
                }
            }
            self.pending_windows = waiting;
        }

        for cand in candidates {
            self.place(runner, cand, candle);
        }
    }

    fn place(&mut self, runner: &BacktestRunner<'_>, cand: Candidate, candle: &Candle) {
        let trade = &runner.cfg.trade;

        let Some(signal) = apply_direction_filter(cand.signal, trade.direction) else {
            self.stats.blocked_by_direction += 1;
            return;
        };
        let day = weekday_code(candle.time);
        if trade.no_trade_days.iter().any(|d| d == day) {
            self.stats.blocked_by_day += 1;
            return;
        }
        if self.live.len() >= trade.position_limit() {
            self.stats.blocked_by_max_positions += 1;
            return;
        }

        let size = trade.sizing.trade_size(self.capital);
        let committed: f64 = self.live.iter().map(|o| o.trade_size).sum();
        let available = self.capital - committed;
        if self.capital <= 0.0 || size <= 0.0 || size > available + 1e-9 {
            self.stats.blocked_by_margin += 1;
            return;
        }

        let req = OrderRequest {
            side: Side::from_signal(signal),
            order_type: trade.order_type,
            reference_price: cand.reference_price,
            avg_swing_pct: self.book.avg_recent_swing(runner.primary, runner.cfg.pivot.avg_swing_window),
            placed_time: candle.time,
            activation_time: candle.time + trade.entry_delay_minutes as i64 * MINUTE_MS,
            trade_size: size,
        };
        let Some(mut order) = Order::place(self.next_id, &req, &self.params) else {
            self.stats.skipped_no_swing += 1;
            return;
        };
        self.next_id += 1;
        self.stats.orders_placed += 1;

        if order.status == OrderStatus::Open {
            order.fill_market(candle, &self.params, &self.costs, &mut self.rng);
            self.stats.executed_orders += 1;
            debug!(id = order.id, side = ?order.side, price = ?order.fill_price, "market order filled");
        }
        self.live.push(order);
    }

    /// Move closed positions into the ledger and drop cancelled orders.
    fn settle_terminal(&mut self) {
        if self.live.iter().all(Order::is_live) {
            return;
        }
        let (done, live): (Vec<Order>, Vec<Order>) = std::mem::take(&mut self.live)
            .into_iter()
            .partition(|o| !o.is_live());
        self.live = live;
        for order in done {
            if order.status != OrderStatus::Closed {
                continue;
            }
            if let Some(trade) = order.settle(self.capital) {
                self.capital = trade.capital_after;
                let time = trade.order.exit_time.unwrap_or_default();
                self.equity_curve.push((time, self.capital));
                self.trades.push(trade);
            }
        }
    }

    /// Close what is still open at the final candle.
    fn finish(&mut self, last: &Candle) {
        for order in self.live.iter_mut() {
            if order.is_filled() {
                order.force_close(last, ExitReason::EndOfData, &self.costs, &mut self.rng);
            } else {
                order.cancel(last.time);
                self.stats.cancelled_orders += 1;
            }
        }
        self.settle_terminal();
        self.stats.expired_windows += self.pending_windows.len() as u64;
        self.pending_windows.clear();
    }
}

/// `None` when the direction filter rejects the signal.
pub fn apply_direction_filter(signal: Signal, direction: TradeDirection) -> Option<Signal> {
    match (direction, signal) {
        (TradeDirection::Both, s) => Some(s),
        (TradeDirection::Buy, Signal::Long) | (TradeDirection::Sell, Signal::Short) => Some(signal),
        (TradeDirection::Alternate, s) => Some(s.opposite()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OrderType, Role, TimeframeConfig};
    use crate::pivot::EdgeReading;

    const M: i64 = 60_000;

    fn flat_series(prices: &[f64]) -> Vec<Candle> {
        prices
            .iter()
            .enumerate()
            .map(|(i, &p)| Candle::flat(i as i64 * M, p))
            .collect()
    }

    fn one_minute_cfg() -> BacktestConfig {
        let mut cfg = BacktestConfig::default();
        cfg.timeframes = vec![TimeframeConfig::new("1m", Role::Primary)];
        cfg.fees.maker_fee_pct = 0.0;
        cfg.fees.taker_fee_pct = 0.0;
        cfg
    }

    #[test]
    fn direction_filter() {
        assert_eq!(apply_direction_filter(Signal::Long, TradeDirection::Both), Some(Signal::Long));
        assert_eq!(apply_direction_filter(Signal::Long, TradeDirection::Sell), None);
        assert_eq!(apply_direction_filter(Signal::Short, TradeDirection::Sell), Some(Signal::Short));
        assert_eq!(apply_direction_filter(Signal::Short, TradeDirection::Alternate), Some(Signal::Long));
    }

    #[test]
    fn insufficient_history_fails_fast() {
        let mut cfg = one_minute_cfg();
        cfg.timeframes = vec![TimeframeConfig::new("15m", Role::Primary)];
        let candles = flat_series(&[100.0; 10]);
        let err = run_backtest(&candles, &cfg).unwrap_err();
        assert!(matches!(
            err,
            CoreError::InsufficientHistory {
                required: 30,
                available: 10
            }
        ));
    }

    #[test]
    fn unordered_candles_rejected() {
        let mut candles = flat_series(&[100.0, 101.0, 102.0]);
        candles.swap(0, 2);
        assert!(matches!(
            run_backtest(&candles, &one_minute_cfg()),
            Err(CoreError::UnorderedCandles { .. })
        ));
    }

    #[test]
    fn high_pivot_opens_short_that_takes_profit() {
        let cfg = one_minute_cfg();
        // High pivot at 103 confirmed on the 99 close; short fills at 99,
        // TP at 97.02 is reached on the 97 close.
        let candles = flat_series(&[100.0, 101.0, 102.0, 103.0, 99.0, 98.5, 97.0]);
        let res = run_backtest(&candles, &cfg).unwrap();
        assert_eq!(res.stats.primary_signals, 1);
        assert_eq!(res.trades.len(), 1);
        let t = &res.trades[0];
        assert_eq!(t.order.side, Side::Sell);
        assert_eq!(t.order.fill_price, Some(99.0));
        assert_eq!(t.exit_reason(), Some(ExitReason::TakeProfit));
        assert!(res.final_capital > cfg.trade.initial_capital);
    }

    #[test]
    fn open_position_closed_at_end_of_data() {
        let cfg = one_minute_cfg();
        let candles = flat_series(&[100.0, 101.0, 102.0, 103.0, 99.0, 98.8]);
        let res = run_backtest(&candles, &cfg).unwrap();
        assert_eq!(res.trades.len(), 1);
        assert_eq!(res.trades[0].exit_reason(), Some(ExitReason::EndOfData));
        assert_eq!(res.trades[0].order.exit_price, Some(98.8));
    }

    #[test]
    fn single_trade_mode_blocks_second_signal() {
        let mut cfg = one_minute_cfg();
        cfg.trade.take_profit_pct = 50.0;
        cfg.trade.stop_loss_pct = 50.0;
        let candles = flat_series(&[100.0, 102.0, 100.0, 102.0, 100.0, 102.0, 100.0]);
        let res = run_backtest(&candles, &cfg).unwrap();
        assert!(res.stats.primary_signals >= 3);
        assert_eq!(res.stats.orders_placed, 1);
        assert!(res.stats.blocked_by_max_positions >= 2);

        let mut many = cfg.clone();
        many.trade.enter_all = true;
        many.trade.max_concurrent_trades = 5;
        many.trade.sizing = crate::config::Sizing::Fixed { amount: 100.0 };
        let res = run_backtest(&candles, &many).unwrap();
        assert!(res.stats.orders_placed >= 3);
    }

    #[test]
    fn no_trade_day_blocks_orders() {
        let mut cfg = one_minute_cfg();
        // Epoch day 0 is a Thursday.
        cfg.trade.no_trade_days = vec!["Th".to_string()];
        let candles = flat_series(&[100.0, 101.0, 102.0, 103.0, 99.0, 98.0]);
        let res = run_backtest(&candles, &cfg).unwrap();
        assert_eq!(res.stats.orders_placed, 0);
        assert_eq!(res.stats.blocked_by_day, 1);
    }

    #[test]
    fn limit_order_without_fill_is_cancelled_at_end() {
        let mut cfg = one_minute_cfg();
        cfg.trade.order_type = OrderType::Limit;
        cfg.trade.cancel_threshold_pct = 1_000.0;
        let candles = flat_series(&[100.0, 101.0, 102.0, 103.0, 99.0, 98.9]);
        let res = run_backtest(&candles, &cfg).unwrap();
        // Sell limit above the pivot price never trades.
        assert_eq!(res.stats.orders_placed, 1);
        assert_eq!(res.stats.cancelled_orders, 1);
        assert!(res.trades.is_empty());
        assert_eq!(res.final_capital, cfg.trade.initial_capital);
    }

    #[test]
    fn standalone_detection_matches_runner() {
        let mut cfg = one_minute_cfg();
        cfg.timeframes = vec![TimeframeConfig::new("2m", Role::Primary)];
        let candles = flat_series(&[
            100.0, 101.0, 102.0, 103.0, 104.0, 105.0, 99.0, 98.0, 97.0, 96.0, 95.0, 94.0, 100.0, 101.0, 102.0,
        ]);
        let (bars, pivots) = timeframe_pivots(&cfg, 0, &candles).unwrap();
        assert_eq!(bars.len(), 7);
        assert_eq!(pivots.len(), 2);
        // Known on the second minute of the retracing bucket.
        assert_eq!((pivots[0].time, pivots[0].confirmation_time), (4 * M, 7 * M));
        assert_eq!((pivots[1].time, pivots[1].confirmation_time), (10 * M, 13 * M));

        let res = run_backtest(&candles, &cfg).unwrap();
        assert_eq!(res.primary_pivots, pivots);
    }

    #[test]
    fn edges_propagate_to_pivots() {
        let cfg = one_minute_cfg();
        let snap = EdgeSnapshot {
            entries: vec![EdgeReading {
                timeframe: "1h".to_string(),
                position: 87.5,
            }],
        };
        let mut per_time = FxHashMap::default();
        per_time.insert(3 * M, snap.clone());
        per_time.insert(4 * M, EdgeSnapshot::default());
        let mut edges = EdgeMap::default();
        edges.insert("1m".to_string(), per_time);
        let candles = flat_series(&[100.0, 101.0, 102.0, 103.0, 99.0, 98.0]);
        let runner = BacktestRunner::new(&cfg).unwrap().with_edges(&edges);
        let res = runner.run(&candles).unwrap();
        assert_eq!(res.stats.primary_signals, 1);
        // Looked up by the extreme's time, not the confirming candle's.
        let pivot = &res.primary_pivots[0];
        assert_eq!(pivot.time, 3 * M);
        assert_eq!(pivot.confirmation_time, 4 * M);
        assert_eq!(pivot.edges, Some(snap));

        let plain = run_backtest(&candles, &cfg).unwrap();
        assert_eq!(plain.primary_pivots[0].edges, None);
    }
}
