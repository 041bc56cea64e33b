use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{GridError, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl PriceBar {
    /// Intraday evaluation order: open, high, low, close.
    pub fn price_points(&self) -> [f64; 4] {
        [self.open, self.high, self.low, self.close]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityKind {
    Etf,
    Stock,
}

impl SecurityKind {
    /// Six-character codes starting with 1 or 5 are exchange funds.
    pub fn from_symbol(symbol: &str) -> Self {
        let s = symbol.trim();
        if s.len() == 6 && (s.starts_with('1') || s.starts_with('5')) {
            SecurityKind::Etf
        } else {
            SecurityKind::Stock
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SecurityKind::Etf => "ETF",
            SecurityKind::Stock => "STOCK",
        }
    }
}

impl FromStr for SecurityKind {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ETF" => Ok(SecurityKind::Etf),
            "STOCK" => Ok(SecurityKind::Stock),
            other => Err(GridError::invalid(format!(
                "security kind must be ETF or STOCK (value: {other})"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => f.write_str("buy"),
            Side::Sell => f.write_str("sell"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub date: NaiveDate,
    pub side: Side,
    pub price: f64,
    pub shares: u64,
    pub amount: f64,
    pub cash_after: f64,
    pub positions_after: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NoPosition,
    SellPriceOutOfRange,
    InsufficientCash,
    BuyPriceOutOfRange,
}

impl FailureReason {
    pub const ALL: [FailureReason; 4] = [
        FailureReason::NoPosition,
        FailureReason::SellPriceOutOfRange,
        FailureReason::InsufficientCash,
        FailureReason::BuyPriceOutOfRange,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::NoPosition => "no_position",
            FailureReason::SellPriceOutOfRange => "sell_price_out_of_range",
            FailureReason::InsufficientCash => "insufficient_cash",
            FailureReason::BuyPriceOutOfRange => "buy_price_out_of_range",
        }
    }
}

/// Per-run rejection counts. Only ever incremented or merged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTradeCounters {
    pub no_position: u64,
    pub sell_price_out_of_range: u64,
    pub insufficient_cash: u64,
    pub buy_price_out_of_range: u64,
}

impl FailedTradeCounters {
    pub fn record(&mut self, reason: FailureReason) {
        *self.slot(reason) += 1;
    }

    pub fn get(&self, reason: FailureReason) -> u64 {
        match reason {
            FailureReason::NoPosition => self.no_position,
            FailureReason::SellPriceOutOfRange => self.sell_price_out_of_range,
            FailureReason::InsufficientCash => self.insufficient_cash,
            FailureReason::BuyPriceOutOfRange => self.buy_price_out_of_range,
        }
    }

    pub fn merge(&mut self, other: &FailedTradeCounters) {
        for reason in FailureReason::ALL {
            *self.slot(reason) += other.get(reason);
        }
    }

    pub fn total(&self) -> u64 {
        FailureReason::ALL.iter().map(|r| self.get(*r)).sum()
    }

    /// Reasons with a non-zero count, in canonical order.
    pub fn non_zero(&self) -> Vec<(FailureReason, u64)> {
        FailureReason::ALL
            .iter()
            .map(|r| (*r, self.get(*r)))
            .filter(|(_, n)| *n > 0)
            .collect()
    }

    fn slot(&mut self, reason: FailureReason) -> &mut u64 {
        match reason {
            FailureReason::NoPosition => &mut self.no_position,
            FailureReason::SellPriceOutOfRange => &mut self.sell_price_out_of_range,
            FailureReason::InsufficientCash => &mut self.insufficient_cash,
            FailureReason::BuyPriceOutOfRange => &mut self.buy_price_out_of_range,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StrategyParameters {
    pub up_sell_rate: f64,
    pub up_callback_rate: f64,
    pub down_buy_rate: f64,
    pub down_rebound_rate: f64,
    pub shares_per_trade: u64,
}

impl StrategyParameters {
    pub fn validate(&self) -> Result<()> {
        let rates = [
            ("up_sell_rate", self.up_sell_rate),
            ("up_callback_rate", self.up_callback_rate),
            ("down_buy_rate", self.down_buy_rate),
            ("down_rebound_rate", self.down_rebound_rate),
        ];
        for (name, v) in rates {
            if !v.is_finite() || v <= 0.0 {
                return Err(GridError::invalid(format!("{name} must be positive (value: {v})")));
            }
        }
        if self.shares_per_trade == 0 {
            return Err(GridError::invalid("shares_per_trade must be positive"));
        }
        if !self.has_consistent_rates() {
            return Err(GridError::invalid(format!(
                "callback/rebound must be smaller than the triggering move \
                 (up {} vs {}, down {} vs {})",
                self.up_callback_rate, self.up_sell_rate, self.down_rebound_rate, self.down_buy_rate
            )));
        }
        Ok(())
    }

    pub fn has_consistent_rates(&self) -> bool {
        self.up_callback_rate < self.up_sell_rate && self.down_rebound_rate < self.down_buy_rate
    }
}

/// Starting account and grid band for one backtest.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountSettings {
    pub initial_cash: f64,
    pub initial_positions: u64,
    pub base_price: Option<f64>,
    pub price_range: (f64, f64),
}

impl AccountSettings {
    pub fn validate(&self) -> Result<()> {
        if !self.initial_cash.is_finite() || self.initial_cash < 0.0 {
            return Err(GridError::invalid(format!(
                "initial cash must be >= 0 (value: {})",
                self.initial_cash
            )));
        }
        let (lo, hi) = self.price_range;
        if !(lo.is_finite() && hi.is_finite()) || lo >= hi {
            return Err(GridError::invalid(format!("price range is invalid: ({lo}, {hi})")));
        }
        match self.base_price {
            Some(p) if p.is_finite() && p > 0.0 => Ok(()),
            Some(p) => Err(GridError::invalid(format!("base price must be positive (value: {p})"))),
            None => Err(GridError::invalid("base price is not set")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Segment {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> StrategyParameters {
        StrategyParameters {
            up_sell_rate: 0.01,
            up_callback_rate: 0.003,
            down_buy_rate: 0.01,
            down_rebound_rate: 0.003,
            shares_per_trade: 1000,
        }
    }

    #[test]
    fn security_kind_resolves_from_symbol() {
        assert_eq!(SecurityKind::from_symbol("159300"), SecurityKind::Etf);
        assert_eq!(SecurityKind::from_symbol("560610"), SecurityKind::Etf);
        assert_eq!(SecurityKind::from_symbol("600519"), SecurityKind::Stock);
        assert_eq!(SecurityKind::from_symbol("15930"), SecurityKind::Stock);
        assert_eq!("etf".parse::<SecurityKind>().unwrap(), SecurityKind::Etf);
        assert!("bond".parse::<SecurityKind>().is_err());
    }

    #[test]
    fn counters_merge_and_list_non_zero() {
        let mut a = FailedTradeCounters::default();
        a.record(FailureReason::InsufficientCash);
        a.record(FailureReason::InsufficientCash);
        let mut b = FailedTradeCounters::default();
        b.record(FailureReason::NoPosition);
        a.merge(&b);
        assert_eq!(a.total(), 3);
        assert_eq!(
            a.non_zero(),
            vec![(FailureReason::NoPosition, 1), (FailureReason::InsufficientCash, 2)]
        );
    }

    #[test]
    fn parameters_reject_callback_not_below_trigger() {
        assert!(params().validate().is_ok());
        let mut p = params();
        p.up_callback_rate = 0.01;
        assert!(p.validate().is_err());
        let mut p = params();
        p.down_rebound_rate = 0.02;
        assert!(!p.has_consistent_rates());
        let mut p = params();
        p.shares_per_trade = 0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn account_settings_validation() {
        let ok = AccountSettings {
            initial_cash: 0.0,
            initial_positions: 0,
            base_price: Some(4.0),
            price_range: (3.9, 4.3),
        };
        assert!(ok.validate().is_ok());
        assert!(AccountSettings { initial_cash: -1.0, ..ok }.validate().is_err());
        assert!(AccountSettings { price_range: (4.3, 3.9), ..ok }.validate().is_err());
        assert!(AccountSettings { price_range: (4.0, 4.0), ..ok }.validate().is_err());
        assert!(AccountSettings { base_price: None, ..ok }.validate().is_err());
    }
}
