use proptest::prelude::*;

use swing_core::candle::MINUTE_MS;
use swing_core::config::PriceSource;
use swing_core::pivot::{Pivot, SwingParams, SwingPivotTracker};
use swing_core::Candle;

fn series(steps: &[(f64, f64)]) -> Vec<Candle> {
    let mut close: f64 = 100.0;
    steps
        .iter()
        .enumerate()
        .map(|(i, &(step, wick))| {
            let open = close;
            close = (close * (1.0 + step / 100.0)).max(1.0);
            let high = open.max(close) * (1.0 + wick / 100.0);
            let low = open.min(close) * (1.0 - wick / 100.0);
            Candle::new(i as i64 * MINUTE_MS, open, high, low, close, 1.0)
        })
        .collect()
}

fn run(candles: &[Candle], params: SwingParams) -> Vec<Pivot> {
    let mut tracker = SwingPivotTracker::new(params);
    candles.iter().filter_map(|c| tracker.update(c)).collect()
}

fn arb_params() -> impl Strategy<Value = SwingParams> {
    (0.002f64..0.05, 1usize..6, any::<bool>(), any::<bool>()).prop_map(|(threshold, bars, enforce, closes)| {
        SwingParams {
            swing_threshold: threshold,
            min_leg_bars: bars,
            enforce_min_leg_bars: enforce,
            price_source: if closes { PriceSource::Close } else { PriceSource::HighLow },
        }
    })
}

proptest! {
    #[test]
    fn pivots_alternate(steps in prop::collection::vec((-2.0f64..2.0, 0.0f64..0.8), 2..400), params in arb_params()) {
        let pivots = run(&series(&steps), params);
        for pair in pivots.windows(2) {
            prop_assert_ne!(pair[0].kind, pair[1].kind);
            prop_assert!(pair[0].confirmation_time < pair[1].confirmation_time);
        }
    }

    #[test]
    fn pivots_clear_the_threshold(steps in prop::collection::vec((-2.0f64..2.0, 0.0f64..0.8), 2..400), params in arb_params()) {
        let pivots = run(&series(&steps), params);
        for p in &pivots {
            prop_assert!(p.move_pct >= params.swing_threshold * 100.0 - 1e-9);
            prop_assert!(p.time <= p.confirmation_time);
            if params.enforce_min_leg_bars {
                prop_assert!(p.bars_in_leg >= params.min_leg_bars);
            }
        }
    }
}
