//! Incremental multi-timeframe candle aggregation.
//!
//! Each configured timeframe owns a [`SlotState`] holding the in-progress
//! bucket and the last fully closed one. A bucket closes when the base candle
//! that completes it arrives, or when a base candle from a later bucket shows
//! up first (gaps in the base stream).

use rustc_hash::FxHashMap;

use crate::candle::{bucket_start, parse_timeframe, Candle};
use crate::config::AggregatorSeed;
use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SlotState {
    pub active: Option<Candle>,
    pub last_closed: Option<Candle>,
}

/// Candles closed by one ingest on one timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Closed {
    /// Bucket left unfinished by a gap and closed by a later bucket.
    pub superseded: Option<Candle>,
    /// Bucket completed by this base candle.
    pub completed: Option<Candle>,
}

impl Closed {
    pub fn iter(&self) -> impl Iterator<Item = Candle> {
        self.superseded.into_iter().chain(self.completed)
    }
}

fn seed_candle(base: &Candle, bucket: i64, seed: AggregatorSeed) -> Candle {
    match seed {
        AggregatorSeed::Ohlc => Candle { time: bucket, ..*base },
        AggregatorSeed::Close => Candle::new(bucket, base.close, base.close, base.close, base.close, base.volume),
    }
}

/// Pure slot transition for one base candle.
pub fn transition(
    state: &SlotState,
    base: &Candle,
    tf_ms: i64,
    base_ms: i64,
    seed: AggregatorSeed,
) -> (SlotState, Closed) {
    let bucket = bucket_start(base.time, tf_ms);
    // A base-interval timeframe is the base candle itself.
    let seed = if tf_ms == base_ms { AggregatorSeed::Ohlc } else { seed };
    let mut next = *state;
    let mut closed = Closed::default();

    let active = match state.active {
        Some(a) if a.time == bucket => Candle {
            high: a.high.max(base.high),
            low: a.low.min(base.low),
            close: base.close,
            volume: a.volume + base.volume,
            ..a
        },
        Some(a) => {
            closed.superseded = Some(a);
            next.last_closed = Some(a);
            seed_candle(base, bucket, seed)
        }
        None => seed_candle(base, bucket, seed),
    };

    if base.time + base_ms >= bucket + tf_ms {
        closed.completed = Some(active);
        next.last_closed = Some(active);
        next.active = None;
    } else {
        next.active = Some(active);
    }
    (next, closed)
}

#[derive(Debug, Clone)]
struct Timeframe {
    label: String,
    tf_ms: i64,
    slot: SlotState,
}

/// Builds every configured timeframe from a single base stream.
#[derive(Debug, Clone)]
pub struct CandleAggregator {
    timeframes: Vec<Timeframe>,
    index: FxHashMap<String, usize>,
    base_ms: i64,
    seed: AggregatorSeed,
}

impl CandleAggregator {
    pub fn new<S: AsRef<str>>(labels: &[S], base_ms: i64, seed: AggregatorSeed) -> Result<Self, CoreError> {
        let mut timeframes = Vec::with_capacity(labels.len());
        let mut index = FxHashMap::default();
        for (i, label) in labels.iter().enumerate() {
            let label = label.as_ref();
            let tf_ms = parse_timeframe(label)?;
            if tf_ms < base_ms || tf_ms % base_ms != 0 {
                return Err(CoreError::InvalidTimeframe(label.to_string()));
            }
            index.insert(label.to_string(), i);
            timeframes.push(Timeframe {
                label: label.to_string(),
                tf_ms,
                slot: SlotState::default(),
            });
        }
        Ok(Self {
            timeframes,
            index,
            base_ms,
            seed,
        })
    }

    /// Ingest one base candle. Returns `(timeframe index, closed candle)` in
    /// timeframe order, oldest first within a timeframe.
    pub fn update(&mut self, base: &Candle) -> Vec<(usize, Candle)> {
        let mut out = Vec::new();
        for (i, tf) in self.timeframes.iter_mut().enumerate() {
            let (slot, closed) = transition(&tf.slot, base, tf.tf_ms, self.base_ms, self.seed);
            tf.slot = slot;
            out.extend(closed.iter().map(|c| (i, c)));
        }
        out
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.index.get(label).copied()
    }

    pub fn label(&self, idx: usize) -> &str {
        &self.timeframes[idx].label
    }

    pub fn timeframe_ms(&self, idx: usize) -> i64 {
        self.timeframes[idx].tf_ms
    }

    pub fn len(&self) -> usize {
        self.timeframes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timeframes.is_empty()
    }

    /// The currently forming candle. Never closed data.
    pub fn active(&self, label: &str) -> Option<&Candle> {
        self.index_of(label)
            .and_then(|i| self.timeframes[i].slot.active.as_ref())
    }

    pub fn last_closed(&self, label: &str) -> Option<&Candle> {
        self.index_of(label)
            .and_then(|i| self.timeframes[i].slot.last_closed.as_ref())
    }
}
