//! The grid backtest engine.
//!
//! Each trading day is replayed as four price points (open, high, low,
//! close). At every point the sell side is checked first, then the buy side,
//! against the grid anchors left behind by the previous fill.

use std::str::FromStr;

use chrono::{Local, NaiveDate};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::data::PriceSource;
use crate::error::{GridError, Result, parse_date};
use crate::model::{
    AccountSettings, FailedTradeCounters, FailureReason, PriceBar, SecurityKind, Side,
    StrategyParameters, Trade,
};

/// Which side of the trailing average a buy must be on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaDirection {
    /// Buy only at or above the average, sell only at or below it.
    #[default]
    BuyAbove,
    /// Buy only at or below the average, sell only at or above it.
    BuyBelow,
}

impl MaDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            MaDirection::BuyAbove => "buy_above",
            MaDirection::BuyBelow => "buy_below",
        }
    }
}

impl FromStr for MaDirection {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy_above" | "above" => Ok(MaDirection::BuyAbove),
            "buy_below" | "below" => Ok(MaDirection::BuyBelow),
            other => Err(GridError::invalid(format!(
                "ma_direction must be buy_above or buy_below (value: {other})"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaProtection {
    pub period: usize,
    pub direction: MaDirection,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Trade several lots when price jumps past more than one grid step.
    pub multiple_trade: bool,
    pub ma: Option<MaProtection>,
    /// Move the upper anchor on buys as well as the lower one.
    pub reanchor_up_on_buy: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            multiple_trade: true,
            ma: None,
            reanchor_up_on_buy: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub cash: f64,
    pub positions: u64,
    pub base_price: f64,
    pub price_range: (f64, f64),
    pub last_trigger_up: f64,
    pub last_trigger_down: f64,
}

impl AccountState {
    fn from_settings(account: &AccountSettings) -> Self {
        let base = account.base_price.unwrap_or(0.0);
        Self {
            cash: account.initial_cash,
            positions: account.initial_positions,
            base_price: base,
            price_range: account.price_range,
            last_trigger_up: base,
            last_trigger_down: base,
        }
    }
}

/// Highest and lowest holdings seen after a fill.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountExtremes {
    pub max_positions: u64,
    pub min_positions: u64,
    pub max_cash: f64,
    pub min_cash: f64,
}

impl AccountExtremes {
    fn observe(current: Option<Self>, cash: f64, positions: u64) -> Self {
        match current {
            None => Self {
                max_positions: positions,
                min_positions: positions,
                max_cash: cash,
                min_cash: cash,
            },
            Some(e) => Self {
                max_positions: e.max_positions.max(positions),
                min_positions: e.min_positions.min(positions),
                max_cash: e.max_cash.max(cash),
                min_cash: e.min_cash.min(cash),
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BacktestOutcome {
    pub profit_rate: f64,
    pub trades: Vec<Trade>,
    pub failed: FailedTradeCounters,
    pub ma_skips: u64,
    pub final_cash: f64,
    pub final_positions: u64,
    pub last_price: f64,
    pub extremes: Option<AccountExtremes>,
}

impl BacktestOutcome {
    pub fn trade_count(&self) -> usize {
        self.trades.len()
    }
}

/// One independent simulation: parameters, account and trade log.
#[derive(Clone, Debug)]
pub struct GridStrategy {
    params: StrategyParameters,
    account: AccountSettings,
    options: EngineOptions,
    state: AccountState,
    trades: Vec<Trade>,
    failed: FailedTradeCounters,
    ma_skips: u64,
    extremes: Option<AccountExtremes>,
    current_ma: Option<f64>,
    today: NaiveDate,
    final_profit_rate: f64,
}

impl GridStrategy {
    pub fn new(params: StrategyParameters, account: AccountSettings) -> Self {
        Self {
            params,
            account,
            options: EngineOptions::default(),
            state: AccountState::from_settings(&account),
            trades: Vec::new(),
            failed: FailedTradeCounters::default(),
            ma_skips: 0,
            extremes: None,
            current_ma: None,
            today: Local::now().date_naive(),
            final_profit_rate: 0.0,
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Trades dated after `today` are ignored. Without this the local date
    /// at construction is used; replays that must not depend on the clock
    /// pin it here.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn params(&self) -> &StrategyParameters {
        &self.params
    }

    pub fn account(&self) -> &AccountSettings {
        &self.account
    }

    pub fn state(&self) -> &AccountState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut AccountState {
        &mut self.state
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn failed_trades(&self) -> &FailedTradeCounters {
        &self.failed
    }

    pub fn ma_skips(&self) -> u64 {
        self.ma_skips
    }

    pub fn extremes(&self) -> Option<AccountExtremes> {
        self.extremes
    }

    pub fn final_profit_rate(&self) -> f64 {
        self.final_profit_rate
    }

    pub fn validate(&self) -> Result<()> {
        self.account.validate()?;
        self.params.validate()
    }

    pub fn buy(&mut self, price: f64, date: NaiveDate) -> bool {
        if date > self.today {
            return false;
        }
        if !self.ma_allows(price, Side::Buy) {
            self.ma_skips += 1;
            return false;
        }
        let (lo, hi) = self.state.price_range;
        if price < lo || price > hi {
            self.failed.record(FailureReason::BuyPriceOutOfRange);
            return false;
        }
        let shares = self.params.shares_per_trade;
        let cost = price * shares as f64;
        if cost > self.state.cash {
            self.failed.record(FailureReason::InsufficientCash);
            return false;
        }

        self.state.cash -= cost;
        self.state.positions += shares;
        self.record_fill(date, Side::Buy, price, cost);
        true
    }

    pub fn sell(&mut self, price: f64, date: NaiveDate) -> bool {
        if date > self.today {
            return false;
        }
        if !self.ma_allows(price, Side::Sell) {
            self.ma_skips += 1;
            return false;
        }
        let (lo, hi) = self.state.price_range;
        if price < lo || price > hi {
            self.failed.record(FailureReason::SellPriceOutOfRange);
            return false;
        }
        let shares = self.params.shares_per_trade;
        if self.state.positions < shares {
            self.failed.record(FailureReason::NoPosition);
            return false;
        }

        let income = price * shares as f64;
        self.state.cash += income;
        self.state.positions -= shares;
        self.record_fill(date, Side::Sell, price, income);
        true
    }

    pub fn buy_on(&mut self, price: f64, date: &str) -> Result<bool> {
        let date = parse_date(date)?;
        Ok(self.buy(price, date))
    }

    pub fn sell_on(&mut self, price: f64, date: &str) -> Result<bool> {
        let date = parse_date(date)?;
        Ok(self.sell(price, date))
    }

    fn record_fill(&mut self, date: NaiveDate, side: Side, price: f64, amount: f64) {
        let shares = self.params.shares_per_trade;
        debug!(
            "{date} {side} {shares} @ {price:.3} (positions {}, cash {:.2})",
            self.state.positions, self.state.cash
        );
        self.trades.push(Trade {
            date,
            side,
            price,
            shares,
            amount,
            cash_after: self.state.cash,
            positions_after: self.state.positions,
        });
        self.extremes = Some(AccountExtremes::observe(
            self.extremes,
            self.state.cash,
            self.state.positions,
        ));
    }

    fn ma_allows(&self, price: f64, side: Side) -> bool {
        let (Some(ma), Some(cfg)) = (self.current_ma, self.options.ma) else {
            return true;
        };
        match (cfg.direction, side) {
            (MaDirection::BuyAbove, Side::Buy) | (MaDirection::BuyBelow, Side::Sell) => price >= ma,
            (MaDirection::BuyAbove, Side::Sell) | (MaDirection::BuyBelow, Side::Buy) => price <= ma,
        }
    }

    /// Grid steps covered by a move of `distance` past `trigger`.
    fn lot_multiple(&self, distance: f64, trigger: f64, rate: f64) -> u64 {
        if !self.options.multiple_trade {
            return 1;
        }
        (distance / trigger / rate).floor().max(0.0) as u64 + 1
    }

    fn step(&mut self, price: f64, date: NaiveDate) {
        let p = self.params;
        let shares = p.shares_per_trade;

        if self.state.positions > 0 {
            let trigger = self.state.last_trigger_up * (1.0 + p.up_sell_rate);
            if price >= trigger {
                let exec = trigger * (1.0 - p.up_callback_rate);
                if exec <= price {
                    let lots = self
                        .lot_multiple(price - trigger, trigger, p.up_sell_rate)
                        .min(self.state.positions / shares);
                    if lots == 0 {
                        self.failed.record(FailureReason::NoPosition);
                    }
                    for _ in 0..lots {
                        if self.sell(exec, date) {
                            self.state.last_trigger_up = exec;
                            self.state.last_trigger_down = exec;
                        }
                    }
                } else {
                    self.failed.record(FailureReason::SellPriceOutOfRange);
                }
            }
        } else {
            self.failed.record(FailureReason::NoPosition);
        }

        let trigger = self.state.last_trigger_down * (1.0 - p.down_buy_rate);
        if price <= trigger {
            let exec = trigger * (1.0 + p.down_rebound_rate);
            let lot_cost = exec * shares as f64;
            let affordable = (self.state.cash / lot_cost).floor().max(0.0) as u64;
            let lots = self
                .lot_multiple(trigger - price, trigger, p.down_buy_rate)
                .min(affordable);
            let required = lot_cost * lots as f64;
            if lots > 0 && self.state.cash >= required && price <= exec {
                for _ in 0..lots {
                    if self.buy(exec, date) {
                        self.state.last_trigger_down = exec;
                        if self.options.reanchor_up_on_buy {
                            self.state.last_trigger_up = exec;
                        }
                    }
                }
            } else {
                self.failed.record(FailureReason::InsufficientCash);
            }
        }
    }

    /// Replays `bars` from the configured starting account.
    pub fn run(&mut self, bars: &[PriceBar]) -> Result<f64> {
        self.validate()?;
        let Some(last) = bars.last() else {
            return Err(GridError::DataSource("price series is empty".to_string()));
        };

        self.state = AccountState::from_settings(&self.account);
        self.trades.clear();
        self.failed = FailedTradeCounters::default();
        self.ma_skips = 0;
        self.extremes = None;

        let ma_period = self.options.ma.map(|m| m.period);
        for (i, bar) in bars.iter().enumerate() {
            self.current_ma = ma_period.and_then(|n| trailing_mean(bars, i, n));
            for price in bar.price_points() {
                self.step(price, bar.date);
            }
        }
        self.current_ma = None;

        Ok(self.calculate_profit(last.close))
    }

    pub fn backtest(
        &mut self,
        source: &dyn PriceSource,
        symbol: &str,
        kind: SecurityKind,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BacktestOutcome> {
        self.validate()?;
        if start > end {
            return Err(GridError::invalid(format!(
                "start date {start} is after end date {end}"
            )));
        }

        let bars = source.get_price_bars(symbol, start, end, kind)?;
        if bars.is_empty() {
            return Err(GridError::DataUnavailable {
                symbol: symbol.to_string(),
                start,
                end,
            });
        }
        let profit_rate = self.run(&bars)?;
        let last_price = bars[bars.len() - 1].close;
        debug!(
            "backtest {symbol} {start}..{end}: {} bars, {} trades, profit {profit_rate:.2}%",
            bars.len(),
            self.trades.len()
        );

        Ok(BacktestOutcome {
            profit_rate,
            trades: self.trades.clone(),
            failed: self.failed,
            ma_skips: self.ma_skips,
            final_cash: self.state.cash,
            final_positions: self.state.positions,
            last_price,
            extremes: self.extremes,
        })
    }

    /// Profit in percent of the starting account value, marked at `last_price`.
    pub fn calculate_profit(&mut self, last_price: f64) -> f64 {
        let initial_total = self.account.initial_cash
            + self.account.initial_positions as f64 * self.state.base_price;
        let final_total = self.state.cash + self.state.positions as f64 * last_price;
        self.final_profit_rate = if initial_total == 0.0 {
            0.0
        } else {
            (final_total - initial_total) / initial_total * 100.0
        };
        self.final_profit_rate
    }
}

/// Mean close of the `period` bars before `idx`.
fn trailing_mean(bars: &[PriceBar], idx: usize, period: usize) -> Option<f64> {
    if period == 0 || idx < period {
        return None;
    }
    let window = &bars[idx - period..idx];
    Some(window.iter().map(|b| b.close).sum::<f64>() / period as f64)
}
