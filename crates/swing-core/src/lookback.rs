//! Fixed-window pivot detector.
//!
//! Candle `i` is a High pivot when its price strictly exceeds each of the
//! previous `lookback` candles, and a Low pivot when strictly below them.
//! With `lookback == 0` only the previous candle is compared and the larger
//! excursion wins when both directions qualify. Pivots are confirmed on the
//! candle itself and do not necessarily alternate.

use std::collections::VecDeque;

use crate::candle::Candle;
use crate::config::PriceSource;
use crate::pivot::{Pivot, PivotKind};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LookbackParams {
    pub lookback: usize,
    /// Minimum swing versus the window, in percent. Zero disables the check.
    pub min_swing_pct: f64,
    pub price_source: PriceSource,
}

#[derive(Debug, Clone)]
pub struct LookbackDetector {
    params: LookbackParams,
    /// Previous candles, oldest first.
    window: VecDeque<Candle>,
    bars_since_pivot: usize,
}

impl LookbackDetector {
    pub fn new(params: LookbackParams) -> Self {
        Self {
            params,
            window: VecDeque::with_capacity(params.lookback.max(1)),
            bars_since_pivot: 0,
        }
    }

    fn window_len(&self) -> usize {
        self.params.lookback.max(1)
    }

    fn high_of(&self, c: &Candle) -> f64 {
        match self.params.price_source {
            PriceSource::HighLow => c.high,
            PriceSource::Close => c.close,
        }
    }

    fn low_of(&self, c: &Candle) -> f64 {
        match self.params.price_source {
            PriceSource::HighLow => c.low,
            PriceSource::Close => c.close,
        }
    }

    pub fn update(&mut self, candle: &Candle) -> Option<Pivot> {
        let pivot = self.evaluate(candle);
        self.bars_since_pivot += 1;
        if pivot.is_some() {
            self.bars_since_pivot = 0;
        }
        if self.window.len() == self.window_len() {
            self.window.pop_front();
        }
        self.window.push_back(*candle);
        pivot
    }

    fn evaluate(&self, candle: &Candle) -> Option<Pivot> {
        if self.window.len() < self.window_len() {
            return None;
        }
        let hi = self.high_of(candle);
        let lo = self.low_of(candle);

        let (is_high, is_low) = if self.params.lookback == 0 {
            let prev = self.window.back()?;
            let (prev_hi, prev_lo) = (self.high_of(prev), self.low_of(prev));
            let is_high = hi > prev_hi;
            let is_low = lo < prev_lo;
            if is_high && is_low {
                let up = (hi - prev_hi).abs();
                let down = (prev_lo - lo).abs();
                (up >= down, up < down)
            } else {
                (is_high, is_low)
            }
        } else {
            (
                self.window.iter().all(|c| hi > self.high_of(c)),
                self.window.iter().all(|c| lo < self.low_of(c)),
            )
        };

        let kind = if is_high {
            PivotKind::High
        } else if is_low {
            PivotKind::Low
        } else {
            return None;
        };
        let price = if is_high { hi } else { lo };

        let mut max_swing_pct = 0.0_f64;
        for c in &self.window {
            let compare = match (self.params.price_source, kind) {
                (PriceSource::Close, _) => c.close,
                (PriceSource::HighLow, PivotKind::High) => c.low,
                (PriceSource::HighLow, PivotKind::Low) => c.high,
            };
            if compare == 0.0 {
                continue;
            }
            max_swing_pct = max_swing_pct.max(((price - compare) / compare * 100.0).abs());
        }
        if max_swing_pct < self.params.min_swing_pct {
            return None;
        }

        Some(Pivot {
            kind,
            price,
            time: candle.time,
            confirmation_time: candle.time,
            move_pct: max_swing_pct,
            bars_in_leg: self.bars_since_pivot + 1,
            edges: None,
        })
    }
}
