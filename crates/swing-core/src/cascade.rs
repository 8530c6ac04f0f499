//! Cross-timeframe cascade confirmation.
//!
//! A primary pivot is accepted once enough other timeframes printed a pivot
//! with the same signal (or the inverted one, for `opposite` timeframes)
//! inside a role-dependent window after the primary's extreme.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::candle::{nearest_index, Candle, MINUTE_MS};
pub use crate::config::Role;
use crate::config::BacktestConfig;
use crate::pivot::{Pivot, Signal};

// ---------------------------------------------------------------------------
// Pivot history
// ---------------------------------------------------------------------------

/// Bounded per-timeframe pivot history, oldest first.
#[derive(Debug, Clone)]
pub struct PivotBook {
    per_timeframe: Vec<VecDeque<Pivot>>,
    capacity: usize,
}

impl PivotBook {
    pub fn new(timeframes: usize, capacity: usize) -> Self {
        Self {
            per_timeframe: vec![VecDeque::new(); timeframes],
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, tf: usize, pivot: Pivot) {
        let Some(q) = self.per_timeframe.get_mut(tf) else {
            return;
        };
        if q.len() == self.capacity {
            q.pop_front();
        }
        q.push_back(pivot);
    }

    pub fn pivots(&self, tf: usize) -> impl Iterator<Item = &Pivot> {
        self.per_timeframe.get(tf).into_iter().flatten()
    }

    /// Mean `move_pct` of the last `window` pivots on `tf`; zero without history.
    pub fn avg_recent_swing(&self, tf: usize, window: usize) -> f64 {
        let Some(q) = self.per_timeframe.get(tf) else {
            return 0.0;
        };
        let n = window.min(q.len());
        if n == 0 {
            return 0.0;
        }
        q.iter().rev().take(n).map(|p| p.move_pct).sum::<f64>() / n as f64
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeConfirmation {
    pub timeframe: String,
    pub pivot: Pivot,
    pub role: Role,
    pub confirm_time: i64,
    pub weight: f64,
    /// Matched the inverted signal.
    pub inverted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeResult {
    pub primary: Pivot,
    pub signal: Signal,
    pub confirmations: Vec<CascadeConfirmation>,
    /// `(1 + confirmations) / total timeframes`.
    pub strength: f64,
    pub weighted_strength: f64,
    pub execution_time: i64,
    pub execution_price: f64,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CascadeTimeframe {
    pub label: String,
    pub role: Role,
    pub weight: f64,
    pub opposite: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeSettings {
    pub min_timeframes_required: usize,
    pub confirmation_window_ms: i64,
    pub execution_window_ms: i64,
}

impl Default for CascadeSettings {
    fn default() -> Self {
        Self {
            min_timeframes_required: 2,
            confirmation_window_ms: 5 * MINUTE_MS,
            execution_window_ms: MINUTE_MS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CascadeEngine {
    timeframes: Vec<CascadeTimeframe>,
    primary: usize,
    settings: CascadeSettings,
}

impl CascadeEngine {
    pub fn new(timeframes: Vec<CascadeTimeframe>, primary: usize, settings: CascadeSettings) -> Self {
        Self {
            timeframes,
            primary,
            settings,
        }
    }

    pub fn from_config(cfg: &BacktestConfig, primary: usize) -> Self {
        let timeframes = cfg
            .timeframes
            .iter()
            .map(|tf| CascadeTimeframe {
                label: tf.interval.clone(),
                role: tf.role,
                weight: tf.weight,
                opposite: tf.opposite,
            })
            .collect();
        let settings = CascadeSettings {
            min_timeframes_required: cfg.cascade.min_timeframes_required,
            confirmation_window_ms: cfg.cascade.confirmation_window_minutes as i64 * MINUTE_MS,
            execution_window_ms: cfg.cascade.execution_window_minutes as i64 * MINUTE_MS,
        };
        Self::new(timeframes, primary, settings)
    }

    pub fn settings(&self) -> &CascadeSettings {
        &self.settings
    }

    fn window_ms(&self, role: Role) -> i64 {
        match role {
            Role::Execution => self.settings.execution_window_ms,
            Role::Confirmation | Role::Primary => self.settings.confirmation_window_ms,
        }
    }

    /// Time after which a pending primary pivot can no longer be confirmed.
    pub fn deadline(&self, primary: &Pivot) -> i64 {
        primary.confirmation_time
            + self
                .settings
                .confirmation_window_ms
                .max(self.settings.execution_window_ms)
    }

    /// Evaluate `primary` against everything known at `at_time`.
    ///
    /// `base` is the finest-granularity series seen so far. The execution
    /// time is the latest extreme among the primary and its confirmations;
    /// the execution price is the close of the base candle nearest to it.
    pub fn confirm(&self, primary: &Pivot, at_time: i64, book: &PivotBook, base: &[Candle]) -> Option<CascadeResult> {
        let signal = primary.signal();
        let mut confirmations = Vec::new();

        for (idx, tf) in self.timeframes.iter().enumerate() {
            if idx == self.primary {
                continue;
            }
            let target = if tf.opposite { signal.opposite() } else { signal };
            let window_end = primary.time + self.window_ms(tf.role);
            let hit = book.pivots(idx).find(|p| {
                p.confirmation_time <= at_time
                    && p.signal() == target
                    && p.time >= primary.time
                    && p.time <= window_end
            });
            if let Some(p) = hit {
                confirmations.push(CascadeConfirmation {
                    timeframe: tf.label.clone(),
                    pivot: p.clone(),
                    role: tf.role,
                    confirm_time: p.confirmation_time,
                    weight: tf.weight,
                    inverted: tf.opposite,
                });
            }
        }

        if !self.accepts(&confirmations) {
            return None;
        }

        let execution_time = confirmations
            .iter()
            .map(|c| c.pivot.time)
            .fold(primary.time, i64::max);
        let execution_price = base[nearest_index(base, execution_time)?].close;

        let total = self.timeframes.len().max(1) as f64;
        let strength = (1 + confirmations.len()) as f64 / total;
        let weight_all: f64 = self.timeframes.iter().map(|t| t.weight).sum();
        let weight_hit = self.timeframes.get(self.primary).map_or(0.0, |t| t.weight)
            + confirmations.iter().map(|c| c.weight).sum::<f64>();
        let weighted_strength = if weight_all > 0.0 { weight_hit / weight_all } else { 0.0 };

        Some(CascadeResult {
            primary: primary.clone(),
            signal,
            confirmations,
            strength,
            weighted_strength,
            execution_time,
            execution_price,
        })
    }

    /// Count rule plus door rule: an execution-role hit needs a
    /// confirmation-role hit alongside it.
    fn accepts(&self, confirmations: &[CascadeConfirmation]) -> bool {
        if 1 + confirmations.len() < self.settings.min_timeframes_required {
            return false;
        }
        let has_execution = confirmations.iter().any(|c| c.role == Role::Execution);
        let has_confirmation = confirmations.iter().any(|c| c.role == Role::Confirmation);
        !has_execution || has_confirmation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pivot::PivotKind;

    const M: i64 = 60_000;

    fn pivot(kind: PivotKind, time: i64, confirmation_time: i64) -> Pivot {
        Pivot {
            kind,
            price: 100.0,
            time,
            confirmation_time,
            move_pct: 1.5,
            bars_in_leg: 3,
            edges: None,
        }
    }

    fn tf(label: &str, role: Role) -> CascadeTimeframe {
        CascadeTimeframe {
            label: label.to_string(),
            role,
            weight: 1.0,
            opposite: false,
        }
    }

    fn engine(min_required: usize) -> CascadeEngine {
        CascadeEngine::new(
            vec![tf("15m", Role::Primary), tf("5m", Role::Confirmation), tf("1m", Role::Execution)],
            0,
            CascadeSettings {
                min_timeframes_required: min_required,
                ..CascadeSettings::default()
            },
        )
    }

    fn base() -> Vec<Candle> {
        (0..30).map(|i| Candle::flat(i * M, 100.0 + i as f64)).collect()
    }

    #[test]
    fn no_confirmations_rejected_when_more_than_one_required() {
        let book = PivotBook::new(3, 16);
        let primary = pivot(PivotKind::High, 0, 15 * M);
        assert!(engine(2).confirm(&primary, 20 * M, &book, &base()).is_none());
        let solo = engine(1).confirm(&primary, 20 * M, &book, &base()).unwrap();
        assert!((solo.strength - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn confirmation_and_execution_accepted() {
        let mut book = PivotBook::new(3, 16);
        book.push(1, pivot(PivotKind::High, 2 * M, 10 * M));
        book.push(2, pivot(PivotKind::High, 30_000, 12 * M));
        let primary = pivot(PivotKind::High, 0, 15 * M);
        let res = engine(3).confirm(&primary, 16 * M, &book, &base()).unwrap();
        assert_eq!(res.signal, Signal::Short);
        assert_eq!(res.confirmations.len(), 2);
        assert!((res.strength - 1.0).abs() < 1e-12);
        // Latest extreme, not latest confirmation.
        assert_eq!(res.execution_time, 2 * M);
        assert_eq!(res.execution_price, 102.0);
    }

    #[test]
    fn execution_only_fails_door_rule() {
        let mut book = PivotBook::new(3, 16);
        book.push(2, pivot(PivotKind::Low, 20_000, 5 * M));
        let primary = pivot(PivotKind::Low, 0, 3 * M);
        assert!(engine(2).confirm(&primary, 6 * M, &book, &base()).is_none());
    }

    #[test]
    fn ignores_wrong_signal_out_of_window_and_unconfirmed() {
        let mut book = PivotBook::new(3, 16);
        book.push(1, pivot(PivotKind::Low, 2 * M, 4 * M));
        book.push(1, pivot(PivotKind::High, 6 * M, 8 * M));
        book.push(1, pivot(PivotKind::High, 3 * M, 30 * M));
        let primary = pivot(PivotKind::High, 0, 5 * M);
        assert!(engine(2).confirm(&primary, 10 * M, &book, &base()).is_none());
        // Once the late pivot is known it counts.
        let res = engine(2).confirm(&primary, 30 * M, &book, &base()).unwrap();
        assert_eq!(res.confirmations[0].pivot.time, 3 * M);
        assert_eq!(res.execution_time, 3 * M);
        assert_eq!(res.execution_price, 103.0);
    }

    #[test]
    fn execution_time_ignores_late_confirmation() {
        let mut book = PivotBook::new(3, 16);
        book.push(1, pivot(PivotKind::Low, 4 * M, 9 * M));
        let primary = pivot(PivotKind::Low, 3 * M, 6 * M);
        let res = engine(2).confirm(&primary, 9 * M, &book, &base()).unwrap();
        assert_eq!(res.confirmations[0].confirm_time, 9 * M);
        assert_eq!(res.execution_time, 4 * M);
        assert_eq!(res.execution_price, 104.0);

        // The primary's own extreme wins when it is the latest.
        let mut book = PivotBook::new(3, 16);
        book.push(1, pivot(PivotKind::Low, 3 * M, 5 * M));
        let res = engine(2).confirm(&primary, 9 * M, &book, &base()).unwrap();
        assert_eq!(res.execution_time, 3 * M);
        assert_eq!(res.execution_price, 103.0);
    }

    #[test]
    fn opposite_timeframe_confirms_inverted_signal() {
        let mut e = engine(2);
        e.timeframes[1].opposite = true;
        e.timeframes[1].weight = 3.0;
        let mut book = PivotBook::new(3, 16);
        book.push(1, pivot(PivotKind::Low, M, 2 * M));
        let primary = pivot(PivotKind::High, 0, 2 * M);
        let res = e.confirm(&primary, 3 * M, &book, &base()).unwrap();
        assert!(res.confirmations[0].inverted);
        assert!((res.weighted_strength - 4.0 / 5.0).abs() < 1e-12);
    }

    #[test]
    fn avg_recent_swing_uses_tail() {
        let mut book = PivotBook::new(1, 3);
        assert_eq!(book.avg_recent_swing(0, 5), 0.0);
        for (i, mv) in [1.0, 2.0, 3.0, 4.0].iter().enumerate() {
            let mut p = pivot(PivotKind::High, i as i64, i as i64);
            p.move_pct = *mv;
            book.push(0, p);
        }
        assert_eq!(book.pivots(0).count(), 3);
        assert!((book.avg_recent_swing(0, 2) - 3.5).abs() < 1e-12);
        assert!((book.avg_recent_swing(0, 10) - 3.0).abs() < 1e-12);
    }
}
