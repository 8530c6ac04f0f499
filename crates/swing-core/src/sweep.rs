//! Parallel parameter sweep.
//!
//! Generates the cartesian product of config overrides from a [`SweepSpec`],
//! splits it into `concurrency` contiguous batches and runs each batch on a
//! dedicated rayon pool thread. Workers share the candle set read-only and
//! stream [`WorkerMessage`]s back over a channel; the coordinator collects,
//! reports progress, and sorts once every worker is done.
//!
//! Failure contract: the first worker error (or panic) stops dispatch of new
//! combinations, the remaining workers drain, and the whole sweep returns
//! [`CoreError::WorkerFailed`]. Partial results are discarded.

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::candle::Candle;
use crate::config::BacktestConfig;
use crate::engine::run_backtest;
use crate::error::CoreError;
use crate::report::{summarize, BacktestSummary};

// ---------------------------------------------------------------------------
// Sweep axes (loaded from YAML)
// ---------------------------------------------------------------------------

/// A single axis in the parameter sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepAxis {
    /// Dot-separated config path, e.g. "trade.take_profit_pct"
    pub path: String,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepSpec {
    pub axes: Vec<SweepAxis>,
    #[serde(default)]
    pub initial_capital: Option<f64>,
}

// ---------------------------------------------------------------------------
// Sweep result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepResult {
    /// Position in generation order.
    pub combo_index: usize,
    pub config_id: String,
    pub overrides: Vec<(String, f64)>,
    pub summary: BacktestSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepProgress {
    pub completed: usize,
    pub total: usize,
}

/// Worker → coordinator protocol.
#[derive(Debug)]
pub enum WorkerMessage {
    Result(Box<SweepResult>),
    Failed { worker: usize, combo: usize, message: String },
    Done { worker: usize },
}

#[derive(Debug, Clone)]
pub struct SweepOptions {
    pub concurrency: usize,
    /// Set by the caller to stop dispatching new combinations.
    pub cancel: Arc<AtomicBool>,
    /// Emit a progress log line every this many completions.
    pub log_every: usize,
}

impl SweepOptions {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            cancel: Arc::new(AtomicBool::new(false)),
            log_every: 50,
        }
    }
}

// ---------------------------------------------------------------------------
// Config generation (cartesian product)
// ---------------------------------------------------------------------------

/// Generate all combinations (cartesian product) from the sweep axes.
pub fn generate_combinations(axes: &[SweepAxis]) -> Vec<Vec<(String, f64)>> {
    if axes.is_empty() {
        return vec![vec![]];
    }

    let mut result = Vec::new();
    let sub = generate_combinations(&axes[1..]);
    for val in &axes[0].values {
        for combo in &sub {
            let mut new_combo = vec![(axes[0].path.clone(), *val)];
            new_combo.extend(combo.iter().cloned());
            result.push(new_combo);
        }
    }
    result
}

// ---------------------------------------------------------------------------
// Overrides: set a config field by dot-path
// ---------------------------------------------------------------------------

pub fn apply_overrides(base: &BacktestConfig, overrides: &[(String, f64)]) -> Result<BacktestConfig, CoreError> {
    let mut cfg = base.clone();
    for (path, value) in overrides {
        apply_one(&mut cfg, path, *value)?;
    }
    Ok(cfg)
}

/// Set a single numeric config value by dot-separated path. Integer fields
/// are cast from f64; booleans read non-zero as true.
pub fn apply_one(cfg: &mut BacktestConfig, path: &str, value: f64) -> Result<(), CoreError> {
    match path {
        // === Trade ===
        "trade.take_profit_pct" => cfg.trade.take_profit_pct = value,
        "trade.stop_loss_pct" => cfg.trade.stop_loss_pct = value,
        "trade.leverage" => cfg.trade.leverage = value,
        "trade.initial_capital" => cfg.trade.initial_capital = value,
        "trade.order_distance_pct" => cfg.trade.order_distance_pct = value,
        "trade.cancel_threshold_pct" => cfg.trade.cancel_threshold_pct = value,
        "trade.max_trade_time_minutes" => cfg.trade.max_trade_time_minutes = value as u32,
        "trade.entry_delay_minutes" => cfg.trade.entry_delay_minutes = value as u32,
        "trade.max_concurrent_trades" => cfg.trade.max_concurrent_trades = value as usize,
        "trade.enter_all" => cfg.trade.enter_all = value != 0.0,

        // === Pivot ===
        "pivot.swing_threshold" => cfg.pivot.swing_threshold = value,
        "pivot.lookback" => cfg.pivot.lookback = value as usize,
        "pivot.min_leg_bars" => cfg.pivot.min_leg_bars = value as usize,
        "pivot.avg_swing_window" => cfg.pivot.avg_swing_window = value as usize,
        "pivot.enforce_min_leg_bars" => cfg.pivot.enforce_min_leg_bars = value != 0.0,

        // === Cascade ===
        "cascade.min_timeframes_required" => cfg.cascade.min_timeframes_required = value as usize,
        "cascade.confirmation_window_minutes" => cfg.cascade.confirmation_window_minutes = value as u32,
        "cascade.execution_window_minutes" => cfg.cascade.execution_window_minutes = value as u32,

        // === Fees ===
        "fees.maker_fee_pct" => cfg.fees.maker_fee_pct = value,
        "fees.taker_fee_pct" => cfg.fees.taker_fee_pct = value,

        "seed" => cfg.seed = value as u64,

        _ => return Err(CoreError::UnknownOverride(path.to_string())),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

fn run_combo(
    combo_index: usize,
    base_cfg: &BacktestConfig,
    overrides: &[(String, f64)],
    candles: &[Candle],
) -> Result<SweepResult, CoreError> {
    let cfg = apply_overrides(base_cfg, overrides)?;
    let result = run_backtest(candles, &cfg)?;
    Ok(SweepResult {
        combo_index,
        config_id: format!("sweep_{combo_index:04}"),
        overrides: overrides.to_vec(),
        summary: summarize(&result),
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Run a parameter sweep. Results are sorted by `net_pnl_pct` descending,
/// ties broken by generation order.
pub fn run_sweep(
    candles: Arc<[Candle]>,
    base_cfg: &BacktestConfig,
    spec: &SweepSpec,
    options: &SweepOptions,
    mut on_progress: impl FnMut(SweepProgress),
) -> Result<Vec<SweepResult>, CoreError> {
    if options.concurrency == 0 {
        return Err(CoreError::InvalidConfig("sweep concurrency must be at least 1".to_string()));
    }
    let mut base = base_cfg.clone();
    if let Some(capital) = spec.initial_capital {
        base.trade.initial_capital = capital;
    }
    base.validate()?;
    // Reject typos before any worker starts.
    for axis in &spec.axes {
        apply_one(&mut base.clone(), &axis.path, axis.values.first().copied().unwrap_or_default())?;
    }

    let combos = generate_combinations(&spec.axes);
    let total = combos.len();
    let workers = options.concurrency.min(total.max(1));
    info!(total, axes = spec.axes.len(), workers, "sweep generated combinations");

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("sweep-worker-{i}"))
        .build()
        .map_err(|e| CoreError::InvalidConfig(format!("failed to build sweep thread pool: {e}")))?;

    let base = Arc::new(base);
    let (tx, rx) = mpsc::channel::<WorkerMessage>();
    let batch_size = total.div_ceil(workers).max(1);
    let mut indexed: Vec<(usize, Vec<(String, f64)>)> = combos.into_iter().enumerate().collect();

    let mut worker = 0;
    while !indexed.is_empty() {
        let rest = indexed.split_off(batch_size.min(indexed.len()));
        let batch = std::mem::replace(&mut indexed, rest);
        let tx = tx.clone();
        let candles = Arc::clone(&candles);
        let base = Arc::clone(&base);
        let cancel = Arc::clone(&options.cancel);
        let id = worker;
        pool.spawn(move || {
            for (combo_index, overrides) in batch {
                if cancel.load(Ordering::Relaxed) {
                    break;
                }
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    run_combo(combo_index, &base, &overrides, &candles)
                }));
                let msg = match outcome {
                    Ok(Ok(res)) => WorkerMessage::Result(Box::new(res)),
                    Ok(Err(e)) => WorkerMessage::Failed {
                        worker: id,
                        combo: combo_index,
                        message: e.to_string(),
                    },
                    Err(payload) => WorkerMessage::Failed {
                        worker: id,
                        combo: combo_index,
                        message: panic_message(payload.as_ref()),
                    },
                };
                let failed = matches!(msg, WorkerMessage::Failed { .. });
                if tx.send(msg).is_err() || failed {
                    break;
                }
            }
            let _ = tx.send(WorkerMessage::Done { worker: id });
        });
        worker += 1;
    }
    // Only worker clones remain, so the loop below ends when all workers exit.
    drop(tx);

    let mut results = Vec::with_capacity(total);
    let mut failure: Option<CoreError> = None;
    let mut finished = 0;
    for msg in rx {
        match msg {
            WorkerMessage::Result(res) => {
                results.push(*res);
                let completed = results.len();
                on_progress(SweepProgress { completed, total });
                if options.log_every > 0 && completed % options.log_every == 0 {
                    info!(completed, total, "sweep progress");
                }
            }
            WorkerMessage::Failed {
                worker,
                combo,
                message,
            } => {
                warn!(worker, combo, %message, "sweep worker failed, aborting");
                options.cancel.store(true, Ordering::Relaxed);
                failure.get_or_insert(CoreError::WorkerFailed {
                    worker,
                    combo,
                    message,
                });
            }
            WorkerMessage::Done { .. } => finished += 1,
        }
    }

    if let Some(err) = failure {
        return Err(err);
    }
    if finished < worker {
        return Err(CoreError::WorkerFailed {
            worker: finished,
            combo: results.len(),
            message: "worker exited without reporting completion".to_string(),
        });
    }
    if results.len() < total {
        return Err(CoreError::Cancelled {
            completed: results.len(),
            total,
        });
    }

    results.sort_by(|a, b| {
        b.summary
            .net_pnl_pct
            .partial_cmp(&a.summary.net_pnl_pct)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.combo_index.cmp(&b.combo_index))
    });
    info!(total, "sweep complete");
    Ok(results)
}

/// Load sweep axes from a YAML file.
pub fn load_sweep_spec(path: &Path) -> Result<SweepSpec, CoreError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&raw)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
