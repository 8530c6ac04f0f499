//! Swing pivot detection.
//!
//! The tracker is an explicit [`TrackerState`] plus a pure [`transition`]
//! function. [`SwingPivotTracker`] is the stateful wrapper the runner drives;
//! [`PivotDetector`] picks between it and the fixed-window detector in
//! [`crate::lookback`].

use serde::{Deserialize, Serialize};

use crate::candle::Candle;
use crate::config::{BacktestConfig, DetectorKind, PriceSource};
use crate::lookback::{LookbackDetector, LookbackParams};

// ---------------------------------------------------------------------------
// Pivot types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PivotKind {
    High,
    Low,
}

impl PivotKind {
    /// A swing high is a short signal, a swing low a long one.
    pub fn signal(self) -> Signal {
        match self {
            PivotKind::High => Signal::Short,
            PivotKind::Low => Signal::Long,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Long,
    Short,
}

impl Signal {
    pub fn opposite(self) -> Signal {
        match self {
            Signal::Long => Signal::Short,
            Signal::Short => Signal::Long,
        }
    }
}

/// Relative position of price inside a rolling range on one timeframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeReading {
    pub timeframe: String,
    /// 0 at the range low, 100 at the range high.
    pub position: f64,
}

/// Edge readings produced outside the core and carried through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeSnapshot {
    pub entries: Vec<EdgeReading>,
}

/// A confirmed swing extreme. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pivot {
    pub kind: PivotKind,
    pub price: f64,
    /// Time of the extreme candle.
    pub time: i64,
    /// Time the pivot became known.
    pub confirmation_time: i64,
    /// Retracement that confirmed the pivot, in percent.
    pub move_pct: f64,
    pub bars_in_leg: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edges: Option<EdgeSnapshot>,
}

impl Pivot {
    #[inline]
    pub fn signal(&self) -> Signal {
        self.kind.signal()
    }

    pub fn with_edges(self, edges: Option<EdgeSnapshot>) -> Self {
        Self { edges, ..self }
    }
}

// ---------------------------------------------------------------------------
// Swing state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Seeking,
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwingParams {
    /// Fraction, e.g. 0.01 for 1%.
    pub swing_threshold: f64,
    pub min_leg_bars: usize,
    pub enforce_min_leg_bars: bool,
    pub price_source: PriceSource,
}

impl Default for SwingParams {
    fn default() -> Self {
        Self {
            swing_threshold: 0.01,
            min_leg_bars: 1,
            enforce_min_leg_bars: false,
            price_source: PriceSource::HighLow,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrackerState {
    pub direction: Direction,
    /// Set by the first candle; `None` until then.
    pub reference_price: Option<f64>,
    pub pivot_price: Option<f64>,
    pub pivot_time: Option<i64>,
    pub extreme_price: f64,
    pub extreme_time: i64,
    pub leg_bars: usize,
}

#[inline]
fn extremes(candle: &Candle, source: PriceSource) -> (f64, f64) {
    match source {
        PriceSource::HighLow => (candle.high, candle.low),
        PriceSource::Close => (candle.close, candle.close),
    }
}

/// Advance the tracker by one candle. Emits at most one pivot.
pub fn transition(
    state: &TrackerState,
    candle: &Candle,
    params: &SwingParams,
) -> (TrackerState, Option<Pivot>) {
    let mut next = *state;
    let Some(reference) = state.reference_price else {
        next.reference_price = Some(candle.close);
        next.extreme_price = candle.close;
        next.extreme_time = candle.time;
        return (next, None);
    };

    let (hi, lo) = extremes(candle, params.price_source);
    let threshold = params.swing_threshold;
    next.leg_bars += 1;

    match state.direction {
        Direction::Seeking => {
            if reference <= 0.0 {
                return (next, None);
            }
            let up = (hi - reference) / reference;
            let down = (reference - lo) / reference;
            if up >= threshold && up >= down {
                next.direction = Direction::Up;
                next.extreme_price = hi;
                next.extreme_time = candle.time;
            } else if down >= threshold {
                next.direction = Direction::Down;
                next.extreme_price = lo;
                next.extreme_time = candle.time;
            }
            (next, None)
        }
        Direction::Up => {
            if hi > next.extreme_price {
                next.extreme_price = hi;
                next.extreme_time = candle.time;
            }
            if next.extreme_price <= 0.0 {
                return (next, None);
            }
            let retracement = (next.extreme_price - lo) / next.extreme_price;
            if retracement >= threshold && leg_long_enough(next.leg_bars, params) {
                let pivot = confirm(&mut next, PivotKind::High, retracement, candle, lo);
                next.direction = Direction::Down;
                (next, Some(pivot))
            } else {
                (next, None)
            }
        }
        Direction::Down => {
            if lo < next.extreme_price {
                next.extreme_price = lo;
                next.extreme_time = candle.time;
            }
            if next.extreme_price <= 0.0 {
                return (next, None);
            }
            let retracement = (hi - next.extreme_price) / next.extreme_price;
            if retracement >= threshold && leg_long_enough(next.leg_bars, params) {
                let pivot = confirm(&mut next, PivotKind::Low, retracement, candle, hi);
                next.direction = Direction::Up;
                (next, Some(pivot))
            } else {
                (next, None)
            }
        }
    }
}

#[inline]
fn leg_long_enough(leg_bars: usize, params: &SwingParams) -> bool {
    !params.enforce_min_leg_bars || leg_bars >= params.min_leg_bars
}

/// Emit the pivot at the running extreme and start the opposite leg from
/// the confirming candle's `new_extreme`.
fn confirm(
    state: &mut TrackerState,
    kind: PivotKind,
    retracement: f64,
    candle: &Candle,
    new_extreme: f64,
) -> Pivot {
    let pivot = Pivot {
        kind,
        price: state.extreme_price,
        time: state.extreme_time,
        confirmation_time: candle.time,
        move_pct: retracement * 100.0,
        bars_in_leg: state.leg_bars,
        edges: None,
    };
    state.pivot_price = Some(pivot.price);
    state.pivot_time = Some(pivot.time);
    state.extreme_price = new_extreme;
    state.extreme_time = candle.time;
    state.leg_bars = 0;
    pivot
}

/// Stateful wrapper over [`transition`].
#[derive(Debug, Clone)]
pub struct SwingPivotTracker {
    params: SwingParams,
    state: TrackerState,
}

impl SwingPivotTracker {
    pub fn new(params: SwingParams) -> Self {
        Self {
            params,
            state: TrackerState::default(),
        }
    }

    pub fn state(&self) -> &TrackerState {
        &self.state
    }

    pub fn update(&mut self, candle: &Candle) -> Option<Pivot> {
        let (next, pivot) = transition(&self.state, candle, &self.params);
        self.state = next;
        pivot
    }
}

// ---------------------------------------------------------------------------
// Detector selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum PivotDetector {
    Swing(SwingPivotTracker),
    Lookback(LookbackDetector),
}

impl PivotDetector {
    /// Build the detector for timeframe `idx`, honouring per-timeframe overrides.
    pub fn for_timeframe(cfg: &BacktestConfig, idx: usize) -> Self {
        match cfg.pivot.detector {
            DetectorKind::Swing => PivotDetector::Swing(SwingPivotTracker::new(SwingParams {
                swing_threshold: cfg.swing_threshold_for(idx),
                min_leg_bars: cfg.min_leg_bars_for(idx),
                enforce_min_leg_bars: cfg.pivot.enforce_min_leg_bars,
                price_source: cfg.pivot.price_source,
            })),
            DetectorKind::Lookback => PivotDetector::Lookback(LookbackDetector::new(LookbackParams {
                lookback: cfg.lookback_for(idx),
                min_swing_pct: cfg.swing_threshold_for(idx) * 100.0,
                price_source: cfg.pivot.price_source,
            })),
        }
    }

    pub fn update(&mut self, candle: &Candle) -> Option<Pivot> {
        match self {
            PivotDetector::Swing(t) => t.update(candle),
            PivotDetector::Lookback(d) => d.update(candle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closes(prices: &[f64]) -> Vec<Candle> {
        prices
            .iter()
            .enumerate()
            .map(|(i, &p)| Candle::flat(i as i64 * 60_000, p))
            .collect()
    }

    fn run(params: SwingParams, candles: &[Candle]) -> Vec<Pivot> {
        let mut t = SwingPivotTracker::new(params);
        candles.iter().filter_map(|c| t.update(c)).collect()
    }

    #[test]
    fn high_pivot_confirmed_on_retracement() {
        let pivots = run(
            SwingParams::default(),
            &closes(&[100.0, 101.0, 102.0, 103.0, 99.0, 98.0]),
        );
        assert_eq!(pivots.len(), 1);
        let p = &pivots[0];
        assert_eq!(p.kind, PivotKind::High);
        assert_eq!(p.price, 103.0);
        assert_eq!(p.time, 3 * 60_000);
        assert_eq!(p.confirmation_time, 4 * 60_000);
        assert!((p.move_pct - 400.0 / 103.0).abs() < 1e-9);
        assert_eq!(p.signal(), Signal::Short);
    }

    #[test]
    fn first_candle_only_initialises() {
        let mut t = SwingPivotTracker::new(SwingParams::default());
        assert!(t.update(&Candle::new(0, 100.0, 150.0, 50.0, 100.0, 1.0)).is_none());
        assert_eq!(t.state().reference_price, Some(100.0));
        assert_eq!(t.state().direction, Direction::Seeking);
    }

    #[test]
    fn seeking_enters_down_leg_then_confirms_low() {
        let pivots = run(
            SwingParams::default(),
            &closes(&[100.0, 98.0, 97.0, 99.0, 100.0]),
        );
        assert_eq!(pivots.len(), 1);
        assert_eq!(pivots[0].kind, PivotKind::Low);
        assert_eq!(pivots[0].price, 97.0);
        assert_eq!(pivots[0].bars_in_leg, 3);
    }

    #[test]
    fn transition_is_pure() {
        let params = SwingParams::default();
        let state = TrackerState {
            direction: Direction::Up,
            reference_price: Some(100.0),
            extreme_price: 110.0,
            extreme_time: 0,
            ..TrackerState::default()
        };
        let candle = Candle::new(60_000, 109.0, 109.5, 105.0, 106.0, 1.0);
        let a = transition(&state, &candle, &params);
        let b = transition(&state, &candle, &params);
        assert_eq!(a, b);
        let (next, pivot) = a;
        assert_eq!(next.direction, Direction::Down);
        assert_eq!(next.extreme_price, 105.0);
        assert_eq!(next.leg_bars, 0);
        assert_eq!(pivot.unwrap().price, 110.0);
    }

    #[test]
    fn close_source_ignores_wicks() {
        let params = SwingParams {
            price_source: PriceSource::Close,
            ..SwingParams::default()
        };
        // Wicks reach 5% but closes never move 1%.
        let candles: Vec<Candle> = (0..10)
            .map(|i| Candle::new(i * 60_000, 100.0, 105.0, 95.0, 100.0 + (i % 2) as f64 * 0.5, 1.0))
            .collect();
        assert!(run(params, &candles).is_empty());
        assert!(!run(SwingParams::default(), &candles).is_empty());
    }

    #[test]
    fn min_leg_bars_only_applies_when_enforced() {
        let candles = closes(&[100.0, 102.0, 100.0, 102.5, 100.0, 103.0]);
        let loose = run(
            SwingParams {
                min_leg_bars: 3,
                ..SwingParams::default()
            },
            &candles,
        );
        let strict = run(
            SwingParams {
                min_leg_bars: 3,
                enforce_min_leg_bars: true,
                ..SwingParams::default()
            },
            &candles,
        );
        assert!(loose.len() > strict.len());
        assert!(strict.iter().all(|p| p.bars_in_leg >= 3));
    }
}
