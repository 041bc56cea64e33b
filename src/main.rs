use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use serde_json::{Map, Value, json};

use grid_optimizer::data::observed_price_range;
use grid_optimizer::{
    CsvPriceSource, GridStrategy, OptimizationDriver, PriceSource, ResultReporter, RunSettings,
    SamplerKind, Trial, TrialObserver,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Grid trading backtester and parameter optimizer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct Common {
    /// JSON run configuration (flat key/value record)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Daily bars as CSV: date,open,high,low,close
    #[arg(long)]
    data_file: PathBuf,
    /// Overrides `symbol` from the configuration
    #[arg(long)]
    symbol: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one backtest with the strategy values from the configuration
    Backtest {
        #[command(flatten)]
        common: Common,
        /// Write the outcome as JSON
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Search the strategy parameter space
    Optimize {
        #[command(flatten)]
        common: Common,
        #[arg(long)]
        trials: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        /// random or tpe
        #[arg(long)]
        sampler: Option<String>,
        /// Run a refinement phase around the first phase's best trial
        #[arg(long)]
        two_phase: bool,
        #[arg(long, default_value = "grid_optimizer_result.json")]
        out: PathBuf,
    },
}

struct ProgressObserver {
    pb: ProgressBar,
}

impl ProgressObserver {
    fn new() -> Self {
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        Self { pb }
    }
}

impl TrialObserver for ProgressObserver {
    fn phase_started(&self, phase: u8, n_trials: usize) {
        self.pb.set_length(n_trials as u64);
        self.pb.set_position(0);
        self.pb.set_message(format!("phase {phase}"));
    }

    fn trial_finished(&self, _trial: &Trial, best: Option<&Trial>) {
        self.pb.inc(1);
        if let Some(b) = best {
            self.pb
                .set_message(format!("best {:.2}%", b.profit_rate.unwrap_or(0.0)));
        }
    }
}

fn load_settings(common: &Common) -> Result<RunSettings> {
    let mut params: Map<String, Value> = match &common.config {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let value: Value = serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            match value {
                Value::Object(m) => m,
                _ => bail!("{} must hold a JSON object", path.display()),
            }
        }
        None => Map::new(),
    };
    if let Some(symbol) = &common.symbol {
        params.insert("symbol".to_string(), Value::from(symbol.clone()));
    }
    RunSettings::from_params(&params).context("invalid configuration")
}

/// Configured grid band, or the observed low/high over the run's dates.
fn resolve_price_range(settings: &RunSettings, source: &dyn PriceSource) -> Result<(f64, f64)> {
    if let Some(range) = settings.price_range {
        return Ok(range);
    }
    let bars = source
        .get_price_bars(&settings.symbol, settings.start, settings.end, settings.kind)
        .context("cannot derive a price range")?;
    let Some((lo, hi)) = observed_price_range(&bars) else {
        bail!("no bars to derive a price range from");
    };
    if lo >= hi {
        bail!("flat price series, set price_range_min/max explicitly");
    }
    info!("price range derived from data: {lo:.3} - {hi:.3}");
    Ok((lo, hi))
}

fn open_source(path: &Path) -> Result<CsvPriceSource> {
    CsvPriceSource::from_path(path).with_context(|| format!("failed to load {}", path.display()))
}

fn run_backtest(common: &Common, out: Option<&Path>) -> Result<()> {
    let settings = load_settings(common)?;
    let source = open_source(&common.data_file)?;
    let range = resolve_price_range(&settings, &source)?;
    let account = settings.account(range);

    let mut strategy = GridStrategy::new(settings.strategy, account).with_options(settings.options);
    if let Some(day) = settings.as_of {
        strategy = strategy.with_today(day);
    }
    let outcome = strategy.backtest(
        &source,
        &settings.symbol,
        settings.kind,
        settings.start,
        settings.end,
    )?;

    for line in ResultReporter::default().format_backtest(&settings.strategy, &account, &outcome) {
        println!("{line}");
    }

    if let Some(path) = out {
        let payload = json!({
            "symbol": settings.symbol,
            "generated_at_utc": Utc::now().to_rfc3339(),
            "data_file": common.data_file,
            "params": settings.strategy,
            "account": account,
            "outcome": outcome,
        });
        fs::write(path, serde_json::to_string_pretty(&payload)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("\nSaved result: {}", path.display());
    }
    Ok(())
}

fn run_optimize(
    common: &Common,
    trials: Option<usize>,
    seed: Option<u64>,
    sampler: Option<&str>,
    two_phase: bool,
    out: &Path,
) -> Result<()> {
    let mut settings = load_settings(common)?;
    if let Some(n) = trials {
        if n == 0 {
            bail!("--trials must be >= 1");
        }
        settings.n_trials = n;
    }
    if let Some(s) = seed {
        settings.seed = s;
    }
    if let Some(name) = sampler {
        settings.sampler = name.parse::<SamplerKind>()?;
    }
    settings.two_phase |= two_phase;

    let source = open_source(&common.data_file)?;
    let range = resolve_price_range(&settings, &source)?;
    let fixed = settings.fixed_config(range);
    let ranges = settings.parameter_ranges(fixed.account.base_price.unwrap_or(range.0));

    info!(
        "symbol={} kind={} {}..{} trials={} sampler={} segments={}",
        settings.symbol,
        settings.kind.as_str(),
        settings.start,
        settings.end,
        settings.n_trials,
        settings.sampler.as_str(),
        settings.segmentation.enabled
    );

    let observer = ProgressObserver::new();
    let driver = OptimizationDriver::new(&source)
        .with_sampler(settings.sampler)
        .with_seed(settings.seed)
        .with_two_phase(settings.two_phase)
        .with_observer(&observer);
    let result = driver.optimize(&ranges, settings.n_trials, &fixed)?;
    observer.pb.finish_with_message("optimisation completed");

    let reporter = ResultReporter {
        top_n: settings.top_n,
        only_profitable: false,
    };
    for line in reporter.format_ranking(&result.ranked_trials) {
        println!("{line}");
    }

    let failed = result.history.len() - result.ranked_trials.len();
    if failed > 0 {
        warn!("{failed} trials failed or were skipped");
    }

    let top: Vec<&Trial> = reporter.select(&result.ranked_trials);
    let payload = json!({
        "objective": format!("maximize grid profit on {}", settings.symbol),
        "symbol": settings.symbol,
        "generated_at_utc": Utc::now().to_rfc3339(),
        "data_file": common.data_file,
        "trials": settings.n_trials,
        "seed": settings.seed,
        "sampler": settings.sampler.as_str(),
        "two_phase": settings.two_phase,
        "settings": settings,
        "ranges": ranges,
        "refined_ranges": result.refined_ranges,
        "cancelled": result.cancelled,
        "evaluated": result.history.len(),
        "unscored": failed,
        "best_trial": result.best_trial,
        "top_trials": top,
    });
    fs::write(out, serde_json::to_string_pretty(&payload)?)
        .with_context(|| format!("failed to write {}", out.display()))?;
    println!("\nSaved result: {}", out.display());

    if result.best_trial.is_none() {
        println!("WARNING: no trial completed, check the data file and date range.");
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Backtest { common, out } => run_backtest(&common, out.as_deref()),
        Command::Optimize {
            common,
            trials,
            seed,
            sampler,
            two_phase,
            out,
        } => run_optimize(&common, trials, seed, sampler.as_deref(), two_phase, &out),
    }
}
