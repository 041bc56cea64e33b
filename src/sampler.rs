//! Parameter ranges and the samplers that draw trial candidates from them.

use std::cmp::Ordering;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{GridError, Result};
use crate::model::StrategyParameters;

const RATE_PRECISION: i32 = 6;
const DIMS: usize = 5;

/// Default cap of callback/rebound relative to the triggering rate.
pub const DEFAULT_MAX_CALLBACK_RATIO: f64 = 0.3;

/// Inclusive `[min, max]` searched on a `step` grid anchored at `min`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl ParamRange {
    pub fn new(min: f64, max: f64, step: f64) -> Self {
        Self { min, max, step }
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if !(self.min.is_finite() && self.max.is_finite() && self.step.is_finite()) {
            return Err(GridError::invalid(format!("{name} range must be finite")));
        }
        if self.min <= 0.0 {
            return Err(GridError::invalid(format!(
                "{name} range must start above zero (min: {})",
                self.min
            )));
        }
        if self.min > self.max {
            return Err(GridError::invalid(format!(
                "{name} range is inverted: [{}, {}]",
                self.min, self.max
            )));
        }
        if self.step <= 0.0 {
            return Err(GridError::invalid(format!("{name} step must be positive")));
        }
        Ok(())
    }

    pub fn contains(&self, v: f64) -> bool {
        v >= self.min - 1e-9 && v <= self.max + 1e-9
    }

    /// `[center*(1-ratio), center*(1+ratio)]` clipped to this range. The new
    /// minimum is raised onto this range's step grid so draws stay on it.
    pub fn narrowed(&self, center: f64, ratio: f64) -> ParamRange {
        let lo = clamp(center * (1.0 - ratio), self.min, self.max);
        let hi = clamp(center * (1.0 + ratio), self.min, self.max);
        let (lo, hi) = (lo.min(hi), hi.max(lo));
        let on_grid = |k: f64| round_to(self.min + k * self.step, RATE_PRECISION);
        let snapped = on_grid(((lo - self.min) / self.step - 1e-9).ceil().max(0.0));
        if snapped <= hi + 1e-12 {
            return ParamRange::new(snapped, hi, self.step);
        }
        let nearest = clamp(on_grid(((center - self.min) / self.step).round()), self.min, self.max);
        ParamRange::new(nearest, nearest, self.step)
    }

    fn width(&self) -> f64 {
        (self.max - self.min).max(self.step)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterRanges {
    pub up_sell_rate: ParamRange,
    pub up_callback_rate: ParamRange,
    pub down_buy_rate: ParamRange,
    pub down_rebound_rate: ParamRange,
    pub shares_per_trade: ParamRange,
    /// Upper bound of callback/rebound as a fraction of the sampled trigger rate.
    pub max_callback_ratio: Option<f64>,
}

impl ParameterRanges {
    pub fn default_for(initial_cash: f64, base_price: f64) -> Self {
        let step = 1000.0;
        let max_shares = if base_price > 0.0 {
            ((initial_cash / base_price) / step).floor() * step
        } else {
            step
        };
        Self {
            up_sell_rate: ParamRange::new(0.003, 0.03, 0.0005),
            up_callback_rate: ParamRange::new(0.001, 0.01, 0.0005),
            down_buy_rate: ParamRange::new(0.003, 0.03, 0.0005),
            down_rebound_rate: ParamRange::new(0.001, 0.01, 0.0005),
            shares_per_trade: ParamRange::new(step, max_shares.max(step), step),
            max_callback_ratio: Some(DEFAULT_MAX_CALLBACK_RATIO),
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, r) in self.named() {
            r.validate(name)?;
        }
        let s = self.shares_per_trade;
        if s.step < 1.0 || s.step.fract() != 0.0 {
            return Err(GridError::invalid(format!(
                "shares_per_trade step must be a whole number (value: {})",
                s.step
            )));
        }
        if share_grid(&s).is_none() {
            return Err(GridError::invalid(format!(
                "shares_per_trade range [{}, {}] holds no multiple of {}",
                s.min, s.max, s.step
            )));
        }
        if let Some(ratio) = self.max_callback_ratio {
            if !ratio.is_finite() || ratio <= 0.0 {
                return Err(GridError::invalid(format!(
                    "max_callback_ratio must be positive (value: {ratio})"
                )));
            }
        }
        Ok(())
    }

    pub fn named(&self) -> [(&'static str, ParamRange); DIMS] {
        [
            ("up_sell_rate", self.up_sell_rate),
            ("up_callback_rate", self.up_callback_rate),
            ("down_buy_rate", self.down_buy_rate),
            ("down_rebound_rate", self.down_rebound_rate),
            ("shares_per_trade", self.shares_per_trade),
        ]
    }

    pub fn contains(&self, p: &StrategyParameters) -> bool {
        self.named()
            .iter()
            .zip(to_vector(p))
            .all(|((_, r), v)| r.contains(v))
    }

    /// Second-phase ranges centred on `best`, each clipped to the current bounds.
    pub fn refined_around(&self, best: &StrategyParameters, ratio: f64) -> ParameterRanges {
        let mut shares = self.shares_per_trade.narrowed(best.shares_per_trade as f64, ratio);
        if share_grid(&shares).is_none() {
            let v = best.shares_per_trade as f64;
            shares = ParamRange::new(v, v, self.shares_per_trade.step);
        }
        ParameterRanges {
            up_sell_rate: self.up_sell_rate.narrowed(best.up_sell_rate, ratio),
            up_callback_rate: self.up_callback_rate.narrowed(best.up_callback_rate, ratio),
            down_buy_rate: self.down_buy_rate.narrowed(best.down_buy_rate, ratio),
            down_rebound_rate: self.down_rebound_rate.narrowed(best.down_rebound_rate, ratio),
            shares_per_trade: shares,
            max_callback_ratio: self.max_callback_ratio,
        }
    }

    /// Callback/rebound range after applying the ratio cap for a trigger rate.
    fn capped(&self, range: ParamRange, trigger_rate: f64) -> ParamRange {
        match self.max_callback_ratio {
            Some(ratio) => {
                let hi = range.max.min(trigger_rate * ratio).max(range.min);
                ParamRange::new(range.min, hi, range.step)
            }
            None => range,
        }
    }

    /// Pulls a raw point onto the sampling grid, dimension by dimension.
    fn snap(&self, raw: [f64; DIMS]) -> StrategyParameters {
        let up_sell_rate = snap_rate(&self.up_sell_rate, raw[0]);
        let down_buy_rate = snap_rate(&self.down_buy_rate, raw[2]);
        StrategyParameters {
            up_sell_rate,
            up_callback_rate: snap_rate(&self.capped(self.up_callback_rate, up_sell_rate), raw[1]),
            down_buy_rate,
            down_rebound_rate: snap_rate(&self.capped(self.down_rebound_rate, down_buy_rate), raw[3]),
            shares_per_trade: snap_shares(&self.shares_per_trade, raw[4]),
        }
    }

    fn uniform(&self, rng: &mut StdRng) -> StrategyParameters {
        let up_sell_rate = grid_draw(&self.up_sell_rate, rng);
        let down_buy_rate = grid_draw(&self.down_buy_rate, rng);
        let up_callback_rate = grid_draw(&self.capped(self.up_callback_rate, up_sell_rate), rng);
        let down_rebound_rate =
            grid_draw(&self.capped(self.down_rebound_rate, down_buy_rate), rng);
        let shares_per_trade = match share_grid(&self.shares_per_trade) {
            Some((lo, n)) => lo + rng.random_range(0..=n) * self.shares_per_trade.step as u64,
            None => self.shares_per_trade.step.max(1.0) as u64,
        };
        StrategyParameters {
            up_sell_rate,
            up_callback_rate,
            down_buy_rate,
            down_rebound_rate,
            shares_per_trade,
        }
    }
}

pub fn clamp(v: f64, lo: f64, hi: f64) -> f64 {
    v.max(lo).min(hi)
}

pub fn round_to(v: f64, digits: i32) -> f64 {
    let f = 10_f64.powi(digits);
    (v * f).round() / f
}

pub fn quantize_f64(v: f64, low: f64, high: f64, step: f64, precision: u32) -> f64 {
    let c = clamp(v, low, high);
    let n = ((c - low) / step).round();
    let q = low + n * step;
    round_to(clamp(q, low, high), precision as i32)
}

fn grid_steps(r: &ParamRange) -> u64 {
    ((r.max - r.min) / r.step + 1e-9).floor().max(0.0) as u64
}

fn grid_draw(r: &ParamRange, rng: &mut StdRng) -> f64 {
    let k = rng.random_range(0..=grid_steps(r));
    clamp(round_to(r.min + k as f64 * r.step, RATE_PRECISION), r.min, r.max)
}

fn snap_rate(r: &ParamRange, v: f64) -> f64 {
    let top = r.min + grid_steps(r) as f64 * r.step;
    let q = quantize_f64(v, r.min, top, r.step, RATE_PRECISION as u32);
    clamp(q, r.min, r.max)
}

/// Lowest share multiple inside the range and the number of further steps.
fn share_grid(r: &ParamRange) -> Option<(u64, u64)> {
    let step = r.step.max(1.0);
    let lo = ((r.min / step).ceil() * step).max(step);
    let hi = (r.max / step).floor() * step;
    if hi < lo {
        return None;
    }
    Some((lo as u64, ((hi - lo) / step).round() as u64))
}

fn snap_shares(r: &ParamRange, v: f64) -> u64 {
    let step = r.step.max(1.0) as u64;
    match share_grid(r) {
        Some((lo, n)) => {
            let k = ((v - lo as f64) / step as f64).round().clamp(0.0, n as f64) as u64;
            lo + k * step
        }
        None => step,
    }
}

fn to_vector(p: &StrategyParameters) -> [f64; DIMS] {
    [
        p.up_sell_rate,
        p.up_callback_rate,
        p.down_buy_rate,
        p.down_rebound_rate,
        p.shares_per_trade as f64,
    ]
}

/// Signed normal draw via Box-Muller.
fn gauss(rng: &mut StdRng, sigma: f64) -> f64 {
    let u1 = rng.random::<f64>().clamp(1e-12, 1.0);
    let u2 = rng.random::<f64>();
    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    z * sigma
}

/// Draws candidates and optionally learns from scored trials.
pub trait ParameterSampler {
    fn name(&self) -> &'static str;

    fn sample(&mut self, ranges: &ParameterRanges) -> StrategyParameters;

    /// Feeds back a completed trial. Lower scores are better.
    fn observe(&mut self, _params: &StrategyParameters, _score: f64) {}
}

pub struct RandomSampler {
    rng: StdRng,
}

impl RandomSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl ParameterSampler for RandomSampler {
    fn name(&self) -> &'static str {
        "random"
    }

    fn sample(&mut self, ranges: &ParameterRanges) -> StrategyParameters {
        ranges.uniform(&mut self.rng)
    }
}

/// Tree-structured Parzen estimator.
///
/// After `n_startup` random draws, completed trials are split into the best
/// `gamma` fraction and the rest. Candidates are drawn around good trials and
/// the one maximising `l(x) / g(x)` is proposed.
pub struct TpeSampler {
    rng: StdRng,
    n_startup: usize,
    gamma: f64,
    n_candidates: usize,
    history: Vec<([f64; DIMS], f64)>,
}

impl TpeSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            n_startup: 10,
            gamma: 0.25,
            n_candidates: 24,
            history: Vec::new(),
        }
    }

    pub fn with_startup(mut self, n_startup: usize) -> Self {
        self.n_startup = n_startup;
        self
    }

    fn bandwidths(ranges: &ParameterRanges, n: usize) -> [f64; DIMS] {
        let named = ranges.named();
        let mut out = [0.0; DIMS];
        for (i, (_, r)) in named.iter().enumerate() {
            out[i] = (r.width() / (1.0 + n as f64).sqrt()).max(r.step);
        }
        out
    }

    fn log_density(x: &[f64; DIMS], points: &[[f64; DIMS]], bw: &[f64; DIMS], ranges: &ParameterRanges) -> f64 {
        let named = ranges.named();
        let prior_w = 1.0 / (points.len() as f64 + 1.0);
        let mut total = 0.0;
        for d in 0..DIMS {
            let width = named[d].1.width();
            let mut dens = prior_w / width;
            for p in points {
                let z = (x[d] - p[d]) / bw[d];
                dens += (1.0 - prior_w) / points.len().max(1) as f64 * (-0.5 * z * z).exp()
                    / (bw[d] * (2.0 * std::f64::consts::PI).sqrt());
            }
            total += dens.max(1e-300).ln();
        }
        total
    }
}

impl ParameterSampler for TpeSampler {
    fn name(&self) -> &'static str {
        "tpe"
    }

    fn sample(&mut self, ranges: &ParameterRanges) -> StrategyParameters {
        if self.history.len() < self.n_startup.max(1) {
            return ranges.uniform(&mut self.rng);
        }

        let mut sorted = self.history.clone();
        sorted.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        let n_good = ((self.gamma * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
        let good: Vec<[f64; DIMS]> = sorted[..n_good].iter().map(|(x, _)| *x).collect();
        let bad: Vec<[f64; DIMS]> = sorted[n_good..].iter().map(|(x, _)| *x).collect();
        let bw_good = Self::bandwidths(ranges, good.len());
        let bw_bad = Self::bandwidths(ranges, bad.len());

        let mut best: Option<(StrategyParameters, f64)> = None;
        for _ in 0..self.n_candidates.max(1) {
            let anchor = good[self.rng.random_range(0..good.len())];
            let mut raw = [0.0; DIMS];
            for d in 0..DIMS {
                raw[d] = anchor[d] + gauss(&mut self.rng, bw_good[d]);
            }
            let cand = ranges.snap(raw);
            let x = to_vector(&cand);
            let l = Self::log_density(&x, &good, &bw_good, ranges);
            let g = if bad.is_empty() {
                0.0
            } else {
                Self::log_density(&x, &bad, &bw_bad, ranges)
            };
            let ei = l - g;
            if best.as_ref().map(|(_, s)| ei > *s).unwrap_or(true) {
                best = Some((cand, ei));
            }
        }
        match best {
            Some((p, _)) => p,
            None => ranges.uniform(&mut self.rng),
        }
    }

    fn observe(&mut self, params: &StrategyParameters, score: f64) {
        if score.is_finite() {
            self.history.push((to_vector(params), score));
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerKind {
    Random,
    #[default]
    Tpe,
}

impl SamplerKind {
    pub fn build(self, seed: u64) -> Box<dyn ParameterSampler> {
        match self {
            SamplerKind::Random => Box::new(RandomSampler::new(seed)),
            SamplerKind::Tpe => Box::new(TpeSampler::new(seed)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SamplerKind::Random => "random",
            SamplerKind::Tpe => "tpe",
        }
    }
}

impl FromStr for SamplerKind {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "random" => Ok(SamplerKind::Random),
            "tpe" => Ok(SamplerKind::Tpe),
            other => Err(GridError::invalid(format!(
                "sampler must be random or tpe (value: {other})"
            ))),
        }
    }
}

/// Draws until the cross-field rate invariant holds. After `attempts`
/// failures the last inconsistent draw is returned as the error.
pub fn sample_consistent(
    sampler: &mut dyn ParameterSampler,
    ranges: &ParameterRanges,
    attempts: usize,
) -> std::result::Result<StrategyParameters, StrategyParameters> {
    let mut last = sampler.sample(ranges);
    for _ in 1..attempts.max(1) {
        if last.has_consistent_rates() {
            return Ok(last);
        }
        last = sampler.sample(ranges);
    }
    if last.has_consistent_rates() { Ok(last) } else { Err(last) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges() -> ParameterRanges {
        ParameterRanges::default_for(100_000.0, 4.0)
    }

    #[test]
    fn default_share_range_follows_cash() {
        let r = ranges();
        assert_eq!(r.shares_per_trade.min, 1000.0);
        assert_eq!(r.shares_per_trade.max, 25_000.0);
        let small = ParameterRanges::default_for(500.0, 4.0);
        assert_eq!(small.shares_per_trade.max, 1000.0);
        assert!(small.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_ranges() {
        let mut r = ranges();
        r.up_sell_rate = ParamRange::new(0.03, 0.003, 0.0005);
        assert!(r.validate().is_err());

        let mut r = ranges();
        r.shares_per_trade = ParamRange::new(100.0, 900.0, 1000.0);
        assert!(r.validate().is_err());

        let mut r = ranges();
        r.down_buy_rate.step = 0.0;
        assert!(r.validate().is_err());
    }

    #[test]
    fn random_draws_stay_on_grid_and_in_bounds() {
        let r = ranges();
        let mut s = RandomSampler::new(7);
        for _ in 0..500 {
            let p = s.sample(&r);
            assert!(r.contains(&p));
            assert_eq!(p.shares_per_trade % 1000, 0);
            assert!(p.shares_per_trade >= 1000);
            assert!(p.up_callback_rate <= p.up_sell_rate * 0.3 + 1e-9 || p.up_callback_rate == 0.001);
            let k = (p.up_sell_rate - 0.003) / 0.0005;
            assert!((k - k.round()).abs() < 1e-6);
        }
    }

    #[test]
    fn capped_draws_keep_rates_consistent() {
        let r = ranges();
        let mut s = RandomSampler::new(11);
        let mut consistent = 0;
        for _ in 0..200 {
            if sample_consistent(&mut s, &r, 20).is_ok() {
                consistent += 1;
            }
        }
        assert_eq!(consistent, 200);
    }

    #[test]
    fn impossible_invariant_yields_none() {
        let mut r = ranges();
        r.up_sell_rate = ParamRange::new(0.005, 0.005, 0.0005);
        r.up_callback_rate = ParamRange::new(0.006, 0.01, 0.0005);
        r.max_callback_ratio = None;
        let mut s = RandomSampler::new(3);
        assert!(sample_consistent(&mut s, &r, 10).is_err());
    }

    #[test]
    fn tpe_respects_bounds_after_startup() {
        let r = ranges();
        let mut s = TpeSampler::new(5).with_startup(4);
        for i in 0..60 {
            let p = s.sample(&r);
            assert!(r.contains(&p), "trial {i} out of range: {p:?}");
            assert_eq!(p.shares_per_trade % 1000, 0);
            // Reward large sell rates so the sampler has a gradient to follow.
            s.observe(&p, -p.up_sell_rate * 100.0);
        }
    }

    #[test]
    fn tpe_leans_towards_good_region() {
        let r = ranges();
        let mut s = TpeSampler::new(9).with_startup(10);
        let mut late = Vec::new();
        for i in 0..80 {
            let p = s.sample(&r);
            s.observe(&p, -p.up_sell_rate);
            if i >= 50 {
                late.push(p.up_sell_rate);
            }
        }
        let mean = late.iter().sum::<f64>() / late.len() as f64;
        assert!(mean > 0.0165, "late mean {mean}");
    }

    #[test]
    fn refined_ranges_stay_inside_original() {
        let r = ranges();
        let best = StrategyParameters {
            up_sell_rate: 0.029,
            up_callback_rate: 0.002,
            down_buy_rate: 0.004,
            down_rebound_rate: 0.001,
            shares_per_trade: 25_000,
        };
        let n = r.refined_around(&best, 0.2);
        assert!((n.up_sell_rate.max - 0.03).abs() < 1e-12);
        // 0.029 * 0.8 = 0.0232 is raised to the next 0.0005 step above 0.003.
        assert!((n.up_sell_rate.min - 0.0235).abs() < 1e-12);
        assert!((n.down_rebound_rate.min - 0.001).abs() < 1e-12);
        assert_eq!(n.shares_per_trade.max, 25_000.0);
        assert!(n.validate().is_ok());

        let mut s = RandomSampler::new(1);
        for _ in 0..100 {
            let p = s.sample(&n);
            assert!(n.contains(&p));
            assert!(r.contains(&p));
            for v in [p.up_sell_rate, p.up_callback_rate, p.down_buy_rate, p.down_rebound_rate] {
                let k = (v - 0.001) / 0.0005;
                assert!((k - k.round()).abs() < 1e-6, "{v} is off the 0.0005 grid");
            }
        }
    }

    #[test]
    fn narrowed_range_keeps_the_step_grid() {
        let r = ParamRange::new(0.003, 0.03, 0.0005);
        let n = r.narrowed(0.0101, 0.2);
        assert!((n.min - 0.0085).abs() < 1e-12);
        assert!((n.max - 0.01212).abs() < 1e-12);

        // A window too thin to hold a grid point collapses onto the nearest one.
        let thin = r.narrowed(0.01012, 0.0001);
        assert_eq!(thin.min, thin.max);
        assert!((thin.min - 0.01).abs() < 1e-12);
        assert!(thin.validate("up_sell_rate").is_ok());
    }

    #[test]
    fn quantize_snaps_to_step() {
        assert_eq!(quantize_f64(0.01234, 0.003, 0.03, 0.0005, 6), 0.0125);
        assert_eq!(quantize_f64(1.0, 0.003, 0.03, 0.0005, 6), 0.03);
        assert_eq!(round_to(1.23456, 2), 1.23);
    }
}
