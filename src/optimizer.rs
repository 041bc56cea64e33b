//! Parameter search over the backtest engine.
//!
//! Every trial owns a fresh `GridStrategy`; nothing leaks between trials.
//! Scores follow the minimisation convention: `score = -profit_rate`.

use std::cmp::Ordering;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use chrono::NaiveDate;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::data::{CachedPriceSource, PriceSource, SeriesCalendar, TradingCalendar};
use crate::engine::{EngineOptions, GridStrategy};
use crate::error::{ErrorKind, GridError, Result};
use crate::model::{AccountSettings, FailedTradeCounters, Segment, SecurityKind, StrategyParameters};
use crate::sampler::{ParameterRanges, ParameterSampler, SamplerKind, sample_consistent};
use crate::segments::build_segments;

/// Half-width of the phase-two window around the phase-one best, as a fraction.
pub const REFINE_RATIO: f64 = 0.2;
const MAX_RESAMPLE: usize = 50;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    #[default]
    Mean,
    Median,
}

impl Aggregation {
    pub fn as_str(self) -> &'static str {
        match self {
            Aggregation::Mean => "mean",
            Aggregation::Median => "median",
        }
    }

    pub fn apply(self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        match self {
            Aggregation::Mean => values.iter().sum::<f64>() / values.len() as f64,
            Aggregation::Median => {
                let mut v = values.to_vec();
                v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
                let mid = v.len() / 2;
                if v.len() % 2 == 0 {
                    (v[mid - 1] + v[mid]) / 2.0
                } else {
                    v[mid]
                }
            }
        }
    }
}

impl FromStr for Aggregation {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mean" => Ok(Aggregation::Mean),
            "median" => Ok(Aggregation::Median),
            other => Err(GridError::invalid(format!(
                "aggregation must be mean or median (value: {other})"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segmentation {
    pub enabled: bool,
    pub frequency_hint: i64,
    pub aggregation: Aggregation,
    /// Carry ending cash and positions into the next segment.
    pub connect: bool,
}

impl Default for Segmentation {
    fn default() -> Self {
        Self {
            enabled: false,
            frequency_hint: 3,
            aggregation: Aggregation::Mean,
            connect: false,
        }
    }
}

/// Everything a trial needs besides the sampled strategy parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FixedConfig {
    pub symbol: String,
    pub kind: SecurityKind,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub account: AccountSettings,
    pub options: EngineOptions,
    pub segmentation: Segmentation,
    /// Trades dated after this are ignored. `None` means the local date.
    #[serde(default)]
    pub as_of: Option<NaiveDate>,
}

impl FixedConfig {
    pub fn new(
        symbol: &str,
        kind: SecurityKind,
        start: NaiveDate,
        end: NaiveDate,
        account: AccountSettings,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            kind,
            start,
            end,
            account,
            options: EngineOptions::default(),
            segmentation: Segmentation::default(),
            as_of: None,
        }
    }

    fn engine(&self, params: &StrategyParameters, account: AccountSettings) -> GridStrategy {
        let engine = GridStrategy::new(*params, account).with_options(self.options);
        match self.as_of {
            Some(day) => engine.with_today(day),
            None => engine,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.start > self.end {
            return Err(GridError::invalid(format!(
                "start date {} is after end date {}",
                self.start, self.end
            )));
        }
        self.account.validate()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentResult {
    pub segment: Segment,
    pub start_cash: f64,
    pub start_positions: u64,
    pub profit_rate: f64,
    pub trade_count: usize,
    pub failed: FailedTradeCounters,
    pub final_cash: f64,
    pub final_positions: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialFailure {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TrialStatus {
    Complete,
    /// The backtest raised; excluded from ranking.
    Failed(TrialFailure),
    /// No draw satisfied the rate invariant; never scored.
    Skipped { reason: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub number: usize,
    pub phase: u8,
    pub params: StrategyParameters,
    pub status: TrialStatus,
    pub score: Option<f64>,
    pub profit_rate: Option<f64>,
    pub trade_count: usize,
    pub failed: FailedTradeCounters,
    pub ma_skips: u64,
    pub aggregation: Option<Aggregation>,
    pub segments: Vec<SegmentResult>,
}

impl Trial {
    fn unscored(number: usize, phase: u8, params: StrategyParameters, status: TrialStatus) -> Self {
        Self {
            number,
            phase,
            params,
            status,
            score: None,
            profit_rate: None,
            trade_count: 0,
            failed: FailedTradeCounters::default(),
            ma_skips: 0,
            aggregation: None,
            segments: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == TrialStatus::Complete && self.score.is_some()
    }

    pub fn is_segmented(&self) -> bool {
        !self.segments.is_empty()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub best_trial: Option<Trial>,
    /// Completed trials, best first; equal scores keep trial order.
    pub ranked_trials: Vec<Trial>,
    /// Every trial in the order it ran, failed and skipped ones included.
    pub history: Vec<Trial>,
    pub cancelled: bool,
    pub refined_ranges: Option<ParameterRanges>,
}

/// Cooperative stop flag, checked between trials.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::SeqCst)
    }
}

/// Progress hooks for UI layers.
pub trait TrialObserver {
    fn phase_started(&self, _phase: u8, _n_trials: usize) {}

    fn trial_finished(&self, _trial: &Trial, _best: Option<&Trial>) {}
}

pub struct OptimizationDriver<'a> {
    source: &'a dyn PriceSource,
    calendar: Option<&'a dyn TradingCalendar>,
    sampler: SamplerKind,
    seed: u64,
    two_phase: bool,
    cancel: CancelToken,
    observer: Option<&'a dyn TrialObserver>,
}

struct RunState {
    history: Vec<Trial>,
    best: Option<Trial>,
    cancelled: bool,
}

impl<'a> OptimizationDriver<'a> {
    pub fn new(source: &'a dyn PriceSource) -> Self {
        Self {
            source,
            calendar: None,
            sampler: SamplerKind::default(),
            seed: 42,
            two_phase: false,
            cancel: CancelToken::default(),
            observer: None,
        }
    }

    /// Without an explicit calendar, trading days come from the price series.
    pub fn with_calendar(mut self, calendar: &'a dyn TradingCalendar) -> Self {
        self.calendar = Some(calendar);
        self
    }

    pub fn with_sampler(mut self, sampler: SamplerKind) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_two_phase(mut self, two_phase: bool) -> Self {
        self.two_phase = two_phase;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_observer(mut self, observer: &'a dyn TrialObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn optimize(
        &self,
        ranges: &ParameterRanges,
        n_trials: usize,
        fixed: &FixedConfig,
    ) -> Result<OptimizationResult> {
        if n_trials == 0 {
            return Err(GridError::invalid("n_trials must be at least 1"));
        }
        ranges.validate()?;
        fixed.validate()?;

        let cached = CachedPriceSource::new(self.source);
        let segments = if fixed.segmentation.enabled {
            let series_cal = SeriesCalendar::new(&cached, &fixed.symbol, fixed.kind);
            let calendar: &dyn TradingCalendar = match self.calendar {
                Some(c) => c,
                None => &series_cal,
            };
            let segs = build_segments(
                fixed.start,
                fixed.end,
                fixed.segmentation.frequency_hint,
                calendar,
            );
            info!(
                "{} segments, aggregated by {}{}",
                segs.len(),
                fixed.segmentation.aggregation.as_str(),
                if fixed.segmentation.connect { ", connected" } else { "" }
            );
            Some(segs)
        } else {
            None
        };

        let mut run = RunState {
            history: Vec::new(),
            best: None,
            cancelled: false,
        };

        let mut sampler = self.sampler.build(self.seed);
        info!(
            "phase 1: {n_trials} trials with the {} sampler (seed {})",
            sampler.name(),
            self.seed
        );
        self.run_phase(1, sampler.as_mut(), ranges, n_trials, fixed, segments.as_deref(), &cached, &mut run);

        let mut refined_ranges = None;
        if self.two_phase && !run.cancelled {
            if let Some(best) = run.best.clone() {
                let refined = ranges.refined_around(&best.params, REFINE_RATIO);
                let n2 = (n_trials / 2).max(1);
                info!(
                    "phase 2: {n2} trials around trial {} (profit {:.2}%)",
                    best.number,
                    best.profit_rate.unwrap_or(0.0)
                );
                let mut sampler = self.sampler.build(self.seed.wrapping_add(1));
                self.run_phase(2, sampler.as_mut(), &refined, n2, fixed, segments.as_deref(), &cached, &mut run);
                refined_ranges = Some(refined);
            } else {
                warn!("phase 1 produced no completed trial, skipping refinement");
            }
        }

        let ranked_trials = rank_trials(&run.history);
        if let Some(best) = ranked_trials.first() {
            info!(
                "best trial {} (phase {}): profit {:.2}%, {} trades",
                best.number,
                best.phase,
                best.profit_rate.unwrap_or(0.0),
                best.trade_count
            );
        } else {
            warn!("no trial completed");
        }

        Ok(OptimizationResult {
            best_trial: ranked_trials.first().cloned(),
            ranked_trials,
            history: run.history,
            cancelled: run.cancelled,
            refined_ranges,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn run_phase(
        &self,
        phase: u8,
        sampler: &mut dyn ParameterSampler,
        ranges: &ParameterRanges,
        n_trials: usize,
        fixed: &FixedConfig,
        segments: Option<&[Segment]>,
        source: &dyn PriceSource,
        run: &mut RunState,
    ) {
        if let Some(obs) = self.observer {
            obs.phase_started(phase, n_trials);
        }

        for i in 1..=n_trials {
            if self.cancel.is_cancelled() {
                info!("optimisation cancelled after {} trials", run.history.len());
                run.cancelled = true;
                return;
            }

            let number = run.history.len();
            let trial = match sample_consistent(sampler, ranges, MAX_RESAMPLE) {
                Err(params) => {
                    warn!("[phase {phase} {i}/{n_trials}] no consistent draw after {MAX_RESAMPLE} attempts");
                    Trial::unscored(
                        number,
                        phase,
                        params,
                        TrialStatus::Skipped {
                            reason: "callback/rebound not below trigger rate".to_string(),
                        },
                    )
                }
                Ok(params) => match evaluate(source, &params, fixed, segments) {
                    Ok(mut trial) => {
                        trial.number = number;
                        trial.phase = phase;
                        let score = trial.score.unwrap_or(f64::INFINITY);
                        sampler.observe(&params, score);
                        info!(
                            "[phase {phase} {i}/{n_trials}] score={score:.4} profit={:.2}% trades={}",
                            trial.profit_rate.unwrap_or(0.0),
                            trial.trade_count
                        );
                        trial
                    }
                    Err(e) => {
                        warn!("[phase {phase} {i}/{n_trials}] trial failed: {e}");
                        Trial::unscored(
                            number,
                            phase,
                            params,
                            TrialStatus::Failed(TrialFailure {
                                kind: e.kind(),
                                message: e.to_string(),
                            }),
                        )
                    }
                },
            };

            if trial.is_complete()
                && run
                    .best
                    .as_ref()
                    .map(|b| trial.score < b.score)
                    .unwrap_or(true)
            {
                run.best = Some(trial.clone());
            }
            if let Some(obs) = self.observer {
                obs.trial_finished(&trial, run.best.as_ref());
            }
            run.history.push(trial);
        }
    }
}

/// Runs one parameter set over the whole range or over each segment.
pub fn evaluate(
    source: &dyn PriceSource,
    params: &StrategyParameters,
    fixed: &FixedConfig,
    segments: Option<&[Segment]>,
) -> Result<Trial> {
    let mut trial = Trial::unscored(0, 1, *params, TrialStatus::Complete);

    let Some(segments) = segments else {
        let mut engine = fixed.engine(params, fixed.account);
        let out = engine.backtest(source, &fixed.symbol, fixed.kind, fixed.start, fixed.end)?;
        trial.score = Some(-out.profit_rate);
        trial.profit_rate = Some(out.profit_rate);
        trial.trade_count = out.trade_count();
        trial.failed = out.failed;
        trial.ma_skips = out.ma_skips;
        return Ok(trial);
    };

    let mut account = fixed.account;
    let mut profits = Vec::with_capacity(segments.len());
    for seg in segments {
        let mut engine = fixed.engine(params, account);
        let out = engine.backtest(source, &fixed.symbol, fixed.kind, seg.start, seg.end)?;
        profits.push(out.profit_rate);
        trial.trade_count += out.trade_count();
        trial.failed.merge(&out.failed);
        trial.ma_skips += out.ma_skips;
        trial.segments.push(SegmentResult {
            segment: *seg,
            start_cash: account.initial_cash,
            start_positions: account.initial_positions,
            profit_rate: out.profit_rate,
            trade_count: out.trade_count(),
            failed: out.failed,
            final_cash: out.final_cash,
            final_positions: out.final_positions,
        });
        if fixed.segmentation.connect {
            account.initial_cash = out.final_cash;
            account.initial_positions = out.final_positions;
        }
    }

    let aggregation = fixed.segmentation.aggregation;
    let profit = aggregation.apply(&profits);
    trial.score = Some(-profit);
    trial.profit_rate = Some(profit);
    trial.aggregation = Some(aggregation);
    Ok(trial)
}

/// Completed trials by ascending score. The sort is stable.
pub fn rank_trials(history: &[Trial]) -> Vec<Trial> {
    let mut ranked: Vec<Trial> = history.iter().filter(|t| t.is_complete()).cloned().collect();
    ranked.sort_by(|a, b| {
        let sa = a.score.unwrap_or(f64::INFINITY);
        let sb = b.score.unwrap_or(f64::INFINITY);
        sa.partial_cmp(&sb).unwrap_or(Ordering::Equal)
    });
    ranked
}
