//! CLI entry point for the swing pivot backtester.
//!
//! Subcommands:
//!   - `replay`  Run a single backtest over one symbol's candles
//!   - `sweep`   Parallel parameter sweep (cartesian product of axes)
//!   - `pivots`  Detect primary-timeframe pivots, through the pivot cache

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use swing_core::sweep::{load_sweep_spec, run_sweep, SweepOptions};
use swing_core::{load_config, summarize, timeframe_pivots, BacktestConfig, BacktestRunner, Candle, CandleSource};
use swing_data::{
    load_history, CsvCandleSource, DataError, PivotCache, PivotCacheEntry, PivotCacheKey, SqliteCandleSource,
};

// ---------------------------------------------------------------------------
// CLI argument structs
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "swing-backtester",
    version,
    about = "Swing pivot and multi-timeframe cascade backtester",
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single backtest
    Replay(ReplayArgs),
    /// Run a parallel parameter sweep
    Sweep(SweepArgs),
    /// Detect pivots on the primary timeframe
    Pivots(PivotArgs),
}

#[derive(Args)]
struct SourceArgs {
    /// Root directory of `<SYMBOL>/<interval>.csv` files
    #[arg(long, conflicts_with = "candles_db")]
    csv_root: Option<PathBuf>,

    /// SQLite candle database with a `candles` table
    #[arg(long)]
    candles_db: Option<PathBuf>,

    /// Symbol to load, e.g. BTCUSDT
    #[arg(long)]
    symbol: String,

    /// Base candle interval. Defaults to `data.base_interval` from the config.
    #[arg(long)]
    interval: Option<String>,

    /// Maximum number of base candles to load
    #[arg(long, default_value_t = 100_000)]
    limit: usize,

    /// Only load candles at or before this timestamp (ms)
    #[arg(long)]
    end_ts: Option<i64>,
}

#[derive(Args)]
struct ReplayArgs {
    /// Path to the backtest YAML config
    #[arg(long, default_value = "backtest.yaml")]
    config: PathBuf,

    #[command(flatten)]
    source: SourceArgs,

    /// Write the JSON report to this file instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,

    /// Include the full trade log in the JSON output
    #[arg(long, default_value_t = false)]
    trades: bool,

    /// Include the capital curve in the JSON output
    #[arg(long, default_value_t = false)]
    equity_curve: bool,
}

#[derive(Args)]
struct SweepArgs {
    /// Path to the base backtest YAML config
    #[arg(long, default_value = "backtest.yaml")]
    config: PathBuf,

    /// Path to the sweep spec YAML (axes)
    #[arg(long)]
    sweep_spec: PathBuf,

    #[command(flatten)]
    source: SourceArgs,

    /// Worker threads. Defaults to the number of available cores.
    #[arg(long)]
    threads: Option<usize>,

    /// Only print/write the top N results
    #[arg(long)]
    top_n: Option<usize>,

    /// Write JSONL results to this file instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct PivotArgs {
    /// Path to the backtest YAML config
    #[arg(long, default_value = "backtest.yaml")]
    config: PathBuf,

    #[command(flatten)]
    source: SourceArgs,

    /// SQLite pivot cache; reused when its key matches the current settings
    #[arg(long)]
    cache: Option<PathBuf>,

    /// Write JSON to this file instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Candle source selection
// ---------------------------------------------------------------------------

enum Source {
    Csv(CsvCandleSource),
    Sqlite(SqliteCandleSource),
}

impl CandleSource for Source {
    type Error = DataError;

    fn fetch(&self, symbol: &str, interval: &str, limit: usize, end_time: Option<i64>) -> Result<Vec<Candle>, DataError> {
        match self {
            Source::Csv(s) => s.fetch(symbol, interval, limit, end_time),
            Source::Sqlite(s) => s.fetch(symbol, interval, limit, end_time),
        }
    }
}

impl SourceArgs {
    fn open(&self) -> Result<Source> {
        match (&self.csv_root, &self.candles_db) {
            (Some(root), None) => Ok(Source::Csv(CsvCandleSource::new(root))),
            (None, Some(db)) => Ok(Source::Sqlite(SqliteCandleSource::new(db))),
            _ => bail!("exactly one of --csv-root or --candles-db is required"),
        }
    }

    /// Load base candles covering at least the runner's warmup.
    fn load(&self, cfg: &BacktestConfig) -> Result<Vec<Candle>> {
        let interval = self.interval.clone().unwrap_or_else(|| cfg.data.base_interval.clone());
        if interval != cfg.data.base_interval {
            bail!(
                "--interval {interval} does not match data.base_interval {} in the config",
                cfg.data.base_interval
            );
        }
        let required = BacktestRunner::new(cfg)?.required_history()?;
        let source = self.open()?;
        let candles = load_history(&source, &self.symbol, &interval, self.limit, self.end_ts, required)
            .with_context(|| format!("loading {} {interval} candles", self.symbol))?;
        Ok(candles)
    }
}

fn open_output(path: Option<&PathBuf>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(p) => Box::new(BufWriter::new(
            File::create(p).with_context(|| format!("creating {}", p.display()))?,
        )),
        None => Box::new(std::io::stdout().lock()),
    })
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

fn cmd_replay(args: ReplayArgs) -> Result<()> {
    let cfg = load_config(&args.config, Some(&args.source.symbol))
        .with_context(|| format!("loading config {}", args.config.display()))?;
    let candles = args.source.load(&cfg)?;

    let start = Instant::now();
    let result = BacktestRunner::new(&cfg)?.run(&candles)?;
    let summary = summarize(&result);
    info!(
        symbol = %args.source.symbol,
        trades = summary.trade_count,
        net_pnl_pct = summary.net_pnl_pct,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "replay complete"
    );

    let mut report = json!({
        "symbol": args.source.symbol,
        "candles": candles.len(),
        "summary": summary,
    });
    if args.trades {
        report["trades"] = serde_json::to_value(&result.trades)?;
    }
    if args.equity_curve {
        report["equity_curve"] = serde_json::to_value(&result.equity_curve)?;
    }

    let mut out = open_output(args.output.as_ref())?;
    serde_json::to_writer_pretty(&mut out, &report)?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

fn cmd_sweep(args: SweepArgs) -> Result<()> {
    let cfg = load_config(&args.config, Some(&args.source.symbol))
        .with_context(|| format!("loading config {}", args.config.display()))?;
    let spec = load_sweep_spec(&args.sweep_spec)
        .with_context(|| format!("loading sweep spec {}", args.sweep_spec.display()))?;
    for axis in &spec.axes {
        info!(path = %axis.path, values = ?axis.values, "sweep axis");
    }

    let candles: Arc<[Candle]> = args.source.load(&cfg)?.into();
    let threads = args
        .threads
        .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()));

    let start = Instant::now();
    let mut results = run_sweep(candles, &cfg, &spec, &SweepOptions::new(threads), |_| {})?;
    info!(
        combinations = results.len(),
        threads,
        elapsed_s = start.elapsed().as_secs_f64(),
        "sweep finished"
    );
    if let Some(n) = args.top_n {
        results.truncate(n);
    }

    let mut out = open_output(args.output.as_ref())?;
    for r in &results {
        serde_json::to_writer(&mut out, r)?;
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}

fn cmd_pivots(args: PivotArgs) -> Result<()> {
    let cfg = load_config(&args.config, Some(&args.source.symbol))
        .with_context(|| format!("loading config {}", args.config.display()))?;
    cfg.validate()?;
    let Some(primary) = cfg.primary_index() else {
        bail!("no primary timeframe configured");
    };
    // The loaded window is part of the key, so candles are always read.
    let base = args.source.load(&cfg)?;
    let key = PivotCacheKey::new(&args.source.symbol, &cfg, primary, &base)?;

    let cache = args.cache.as_deref().map(PivotCache::open).transpose()?;
    let cached = match &cache {
        Some(c) => c.load(&key)?,
        None => None,
    };

    let entry = match cached {
        Some(entry) => {
            info!(pivots = entry.pivots.len(), "pivot cache hit");
            entry
        }
        None => {
            let (candles, pivots) = timeframe_pivots(&cfg, primary, &base)?;
            let entry = PivotCacheEntry { pivots, candles };
            if let Some(c) = &cache {
                c.store(&key, &entry)?;
            }
            info!(pivots = entry.pivots.len(), bars = entry.candles.len(), "pivots detected");
            entry
        }
    };

    let mut out = open_output(args.output.as_ref())?;
    serde_json::to_writer_pretty(&mut out, &json!({ "key": key, "pivots": entry.pivots }))?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Replay(args) => cmd_replay(args),
        Commands::Sweep(args) => cmd_sweep(args),
        Commands::Pivots(args) => cmd_pivots(args),
    }
}
