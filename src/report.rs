//! Human-readable rendering of trials and single backtests.

use std::collections::{BTreeMap, HashSet};

use serde_json::{Value, json};

use crate::engine::BacktestOutcome;
use crate::model::{AccountSettings, FailedTradeCounters, StrategyParameters};
use crate::optimizer::{Trial, TrialStatus};
use crate::sampler::round_to;

/// `1234567` -> `1,234,567`.
pub fn group_thousands(n: u64) -> String {
    group_digits(&n.to_string())
}

fn group_digits(digits: &str) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Two decimals with thousands separators.
pub fn format_money(v: f64) -> String {
    let s = format!("{:.2}", v.abs());
    let (int, frac) = s.split_once('.').unwrap_or((s.as_str(), "00"));
    let sign = if v < 0.0 && s != "0.00" { "-" } else { "" };
    format!("{sign}{}.{frac}", group_digits(int))
}

/// A fractional rate shown as a percentage, e.g. `0.0125` -> `1.25%`.
pub fn format_rate(rate: f64) -> String {
    format!("{:.2}%", rate * 100.0)
}

/// Identity of a parameter set for de-duplication, rounded to 6 decimals.
pub fn fingerprint_params(p: &StrategyParameters) -> String {
    let mut b: BTreeMap<&str, Value> = BTreeMap::new();
    b.insert("up_sell_rate", json!(round_to(p.up_sell_rate, 6)));
    b.insert("up_callback_rate", json!(round_to(p.up_callback_rate, 6)));
    b.insert("down_buy_rate", json!(round_to(p.down_buy_rate, 6)));
    b.insert("down_rebound_rate", json!(round_to(p.down_rebound_rate, 6)));
    b.insert("shares_per_trade", json!(p.shares_per_trade));
    serde_json::to_string(&b).unwrap_or_else(|_| "{}".to_string())
}

#[derive(Clone, Copy, Debug)]
pub struct ResultReporter {
    pub top_n: usize,
    /// Leave out trials that did not make money.
    pub only_profitable: bool,
}

impl Default for ResultReporter {
    fn default() -> Self {
        Self {
            top_n: 5,
            only_profitable: false,
        }
    }
}

impl ResultReporter {
    pub fn format_parameters(&self, p: &StrategyParameters) -> Vec<String> {
        vec![
            format!("- Up sell rate: {}", format_rate(p.up_sell_rate)),
            format!("- Up callback rate: {}", format_rate(p.up_callback_rate)),
            format!("- Down buy rate: {}", format_rate(p.down_buy_rate)),
            format!("- Down rebound rate: {}", format_rate(p.down_rebound_rate)),
            format!("- Shares per trade: {}", group_thousands(p.shares_per_trade)),
        ]
    }

    fn format_failures(&self, failed: &FailedTradeCounters, indent: &str) -> Vec<String> {
        let reasons = failed.non_zero();
        if reasons.is_empty() {
            return Vec::new();
        }
        let mut lines = vec![format!("{indent}Failed trades:")];
        for (reason, n) in reasons {
            lines.push(format!("{indent}- {}: {n} times", reason.as_str()));
        }
        lines
    }

    pub fn format_trial(&self, trial: &Trial) -> Vec<String> {
        let mut lines = vec![format!("Trial {} (phase {})", trial.number, trial.phase)];
        lines.extend(self.format_parameters(&trial.params));

        match &trial.status {
            TrialStatus::Failed(f) => {
                lines.push(format!("Status: failed ({:?}): {}", f.kind, f.message));
                return lines;
            }
            TrialStatus::Skipped { reason } => {
                lines.push(format!("Status: skipped: {reason}"));
                return lines;
            }
            TrialStatus::Complete => {}
        }

        let profit = trial.profit_rate.unwrap_or(0.0);
        if !trial.is_segmented() {
            lines.push(format!("Profit rate: {profit:.2}%"));
            lines.push(format!("Trade count: {}", trial.trade_count));
            lines.extend(self.format_failures(&trial.failed, ""));
            if trial.ma_skips > 0 {
                lines.push(format!("Moving-average skips: {}", trial.ma_skips));
            }
            return lines;
        }

        lines.push("Segment results:".to_string());
        for (i, seg) in trial.segments.iter().enumerate() {
            lines.push(format!("Segment {}:", i + 1));
            lines.push(format!("- Period: {}", seg.segment));
            lines.push(format!("- Profit rate: {:.2}%", seg.profit_rate));
            lines.push(format!("- Trade count: {}", seg.trade_count));
            lines.extend(self.format_failures(&seg.failed, "  "));
        }

        lines.push("Summary:".to_string());
        lines.push(format!(
            "- Aggregation: {}",
            trial.aggregation.map(|a| a.as_str()).unwrap_or("mean")
        ));
        lines.push(format!("- Aggregate profit rate: {profit:.2}%"));
        lines.push(format!("- Total trades: {}", trial.trade_count));
        lines.extend(self.format_failures(&trial.failed, "  "));
        if trial.ma_skips > 0 {
            lines.push(format!("- Moving-average skips: {}", trial.ma_skips));
        }
        lines
    }

    /// Best distinct parameter sets first, at most `top_n` of them.
    pub fn select<'t>(&self, ranked: &'t [Trial]) -> Vec<&'t Trial> {
        let mut seen = HashSet::new();
        ranked
            .iter()
            .filter(|t| t.is_complete())
            .filter(|t| !self.only_profitable || t.profit_rate.unwrap_or(0.0) > 0.0)
            .filter(|t| seen.insert(fingerprint_params(&t.params)))
            .take(self.top_n)
            .collect()
    }

    pub fn format_ranking(&self, ranked: &[Trial]) -> Vec<String> {
        let picked = self.select(ranked);
        if picked.is_empty() {
            return vec!["No parameter combination to report".to_string()];
        }
        let mut lines = Vec::new();
        for (i, trial) in picked.iter().enumerate() {
            if i > 0 {
                lines.push(String::new());
            }
            lines.push(format!(
                "Parameter combination {}: profit {:.2}%",
                i + 1,
                trial.profit_rate.unwrap_or(0.0)
            ));
            lines.extend(self.format_trial(trial));
        }
        lines
    }

    /// Full account story of one ad-hoc backtest.
    pub fn format_backtest(
        &self,
        params: &StrategyParameters,
        account: &AccountSettings,
        outcome: &BacktestOutcome,
    ) -> Vec<String> {
        let base = account.base_price.unwrap_or(0.0);
        let initial_total = account.initial_cash + account.initial_positions as f64 * base;
        let final_total = outcome.final_cash + outcome.final_positions as f64 * outcome.last_price;

        let mut lines = vec!["Parameters:".to_string()];
        lines.extend(self.format_parameters(params));
        lines.push(format!("Base price: {base:.3}"));
        lines.push(format!("Initial cash: {}", format_money(account.initial_cash)));
        lines.push(format!(
            "Initial positions: {}",
            group_thousands(account.initial_positions)
        ));
        lines.push(format!("Initial total: {}", format_money(initial_total)));
        lines.push(format!("Final cash: {}", format_money(outcome.final_cash)));
        lines.push(format!(
            "Final positions: {}",
            group_thousands(outcome.final_positions)
        ));
        lines.push(format!("Last price: {:.3}", outcome.last_price));
        lines.push(format!("Final total: {}", format_money(final_total)));
        lines.push(format!("Profit: {}", format_money(final_total - initial_total)));
        lines.push(format!("Profit rate: {:.2}%", outcome.profit_rate));

        if let Some(ex) = outcome.extremes {
            lines.push(format!("Max positions: {}", group_thousands(ex.max_positions)));
            lines.push(format!("Min positions: {}", group_thousands(ex.min_positions)));
            lines.push(format!("Max cash: {}", format_money(ex.max_cash)));
            lines.push(format!("Min cash: {}", format_money(ex.min_cash)));
        }
        lines.extend(self.format_failures(&outcome.failed, ""));
        if outcome.ma_skips > 0 {
            lines.push(format!("Moving-average skips: {}", outcome.ma_skips));
        }

        lines.push(format!("Trades: {}", outcome.trades.len()));
        for t in &outcome.trades {
            lines.push(format!(
                "{} {} {} @ {:.3} amount {} (cash {}, positions {})",
                t.date,
                t.side,
                group_thousands(t.shares),
                t.price,
                format_money(t.amount),
                format_money(t.cash_after),
                group_thousands(t.positions_after)
            ));
        }
        lines
    }
}
