//! Flat key/value run configuration, typically loaded from a JSON file.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::engine::{EngineOptions, MaDirection, MaProtection};
use crate::error::{GridError, Result, parse_date};
use crate::model::{AccountSettings, SecurityKind, StrategyParameters};
use crate::optimizer::{Aggregation, FixedConfig, Segmentation};
use crate::sampler::{DEFAULT_MAX_CALLBACK_RATIO, ParamRange, ParameterRanges, SamplerKind};

/// Explicit search ranges; unset fields take the defaults.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeOverrides {
    pub up_sell_rate: Option<ParamRange>,
    pub up_callback_rate: Option<ParamRange>,
    pub down_buy_rate: Option<ParamRange>,
    pub down_rebound_rate: Option<ParamRange>,
    pub shares_per_trade: Option<ParamRange>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    pub symbol: String,
    pub kind: SecurityKind,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub initial_cash: f64,
    pub initial_positions: u64,
    pub base_price: Option<f64>,
    /// When unset, callers derive it from the observed series.
    pub price_range: Option<(f64, f64)>,
    pub options: EngineOptions,
    pub segmentation: Segmentation,
    pub n_trials: usize,
    pub sampler: SamplerKind,
    pub seed: u64,
    pub two_phase: bool,
    pub top_n: usize,
    pub max_callback_ratio: Option<f64>,
    pub ranges: RangeOverrides,
    /// Strategy used by a single backtest.
    pub strategy: StrategyParameters,
    /// Cut-off for trade dates; the local date when unset.
    #[serde(default)]
    pub as_of: Option<NaiveDate>,
}

impl RunSettings {
    pub fn from_params(params: &Map<String, Value>) -> Result<Self> {
        let symbol = get_string(params, "symbol", "159300");
        let kind = match params.get("security_kind").and_then(Value::as_str) {
            Some(raw) => raw.parse()?,
            None => SecurityKind::from_symbol(&symbol),
        };

        let start = parse_date(&get_string(params, "start_date", "2024-10-10"))?;
        let end = parse_date(&get_string(params, "end_date", "2024-12-20"))?;

        let as_of = match params.get("as_of_date").and_then(Value::as_str) {
            Some(raw) => Some(parse_date(raw)?),
            None => None,
        };

        let price_range = match (
            get_opt_f64(params, "price_range_min"),
            get_opt_f64(params, "price_range_max"),
        ) {
            (Some(lo), Some(hi)) => Some((lo, hi)),
            (None, None) => None,
            _ => {
                return Err(GridError::invalid(
                    "price_range_min and price_range_max must be given together",
                ));
            }
        };

        let ma = if get_bool(params, "ma_protection", false) {
            let period = get_i64(params, "ma_period", 55);
            if period <= 0 {
                return Err(GridError::invalid(format!(
                    "ma_period must be positive (value: {period})"
                )));
            }
            Some(MaProtection {
                period: period as usize,
                direction: get_string(params, "ma_direction", MaDirection::default().as_str())
                    .parse()?,
            })
        } else {
            None
        };

        // `profit_calc_method` is accepted as an older spelling of `aggregation`.
        let aggregation = match params.get("aggregation").or_else(|| params.get("profit_calc_method")) {
            Some(Value::String(s)) => s.parse()?,
            _ => Aggregation::default(),
        };
        let frequency_hint = match params.get("frequency_hint") {
            Some(_) => get_i64(params, "frequency_hint", 2),
            None => get_i64(params, "min_buy_times", 2),
        };

        let max_callback_ratio = match params.get("max_callback_ratio") {
            Some(Value::Null) => None,
            Some(_) => Some(get_f64(params, "max_callback_ratio", DEFAULT_MAX_CALLBACK_RATIO)),
            None => Some(DEFAULT_MAX_CALLBACK_RATIO),
        };

        let ranges = match params.get("ranges") {
            Some(Value::Object(m)) => RangeOverrides {
                up_sell_rate: get_range(m, "up_sell_rate")?,
                up_callback_rate: get_range(m, "up_callback_rate")?,
                down_buy_rate: get_range(m, "down_buy_rate")?,
                down_rebound_rate: get_range(m, "down_rebound_rate")?,
                shares_per_trade: get_range(m, "shares_per_trade")?,
            },
            Some(Value::Null) | None => RangeOverrides::default(),
            Some(_) => return Err(GridError::invalid("ranges must be an object")),
        };

        let settings = Self {
            kind,
            start,
            end,
            initial_cash: get_f64(params, "initial_cash", 100_000.0),
            initial_positions: get_u64(params, "initial_positions", 0)?,
            base_price: get_opt_f64(params, "base_price"),
            price_range,
            options: EngineOptions {
                multiple_trade: get_bool(params, "multiple_trade", true),
                ma,
                reanchor_up_on_buy: get_bool(params, "reanchor_up_on_buy", false),
            },
            segmentation: Segmentation {
                enabled: get_bool(params, "enable_segments", false),
                frequency_hint,
                aggregation,
                connect: get_bool(params, "connect_segments", false),
            },
            n_trials: get_u64(params, "n_trials", 100)? as usize,
            sampler: get_string(params, "sampler", SamplerKind::default().as_str()).parse()?,
            seed: get_u64(params, "seed", 42)?,
            two_phase: get_bool(params, "two_phase", false),
            top_n: get_u64(params, "top_n", 5)? as usize,
            max_callback_ratio,
            ranges,
            strategy: StrategyParameters {
                up_sell_rate: get_f64(params, "up_sell_rate", 0.01),
                up_callback_rate: get_f64(params, "up_callback_rate", 0.003),
                down_buy_rate: get_f64(params, "down_buy_rate", 0.01),
                down_rebound_rate: get_f64(params, "down_rebound_rate", 0.003),
                shares_per_trade: get_u64(params, "shares_per_trade", 1000)?,
            },
            as_of,
            symbol,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(GridError::invalid("symbol must not be empty"));
        }
        if self.start > self.end {
            return Err(GridError::invalid(format!(
                "start_date {} is after end_date {}",
                self.start, self.end
            )));
        }
        if !self.initial_cash.is_finite() || self.initial_cash < 0.0 {
            return Err(GridError::invalid(format!(
                "initial_cash must be >= 0 (value: {})",
                self.initial_cash
            )));
        }
        if let Some((lo, hi)) = self.price_range {
            if !(lo.is_finite() && hi.is_finite()) || lo >= hi {
                return Err(GridError::invalid(format!(
                    "price_range_min must be below price_range_max ({lo} vs {hi})"
                )));
            }
        }
        if let Some(p) = self.base_price {
            if !p.is_finite() || p <= 0.0 {
                return Err(GridError::invalid(format!("base_price must be positive (value: {p})")));
            }
        }
        if self.n_trials == 0 {
            return Err(GridError::invalid("n_trials must be at least 1"));
        }
        if self.top_n == 0 {
            return Err(GridError::invalid("top_n must be at least 1"));
        }
        Ok(())
    }

    /// Account for a given grid band. The base price falls back to the band's floor.
    pub fn account(&self, price_range: (f64, f64)) -> AccountSettings {
        AccountSettings {
            initial_cash: self.initial_cash,
            initial_positions: self.initial_positions,
            base_price: self.base_price.or(Some(price_range.0)),
            price_range,
        }
    }

    pub fn fixed_config(&self, price_range: (f64, f64)) -> FixedConfig {
        FixedConfig {
            symbol: self.symbol.clone(),
            kind: self.kind,
            start: self.start,
            end: self.end,
            account: self.account(price_range),
            options: self.options,
            segmentation: self.segmentation,
            as_of: self.as_of,
        }
    }

    pub fn parameter_ranges(&self, base_price: f64) -> ParameterRanges {
        let defaults = ParameterRanges::default_for(self.initial_cash, base_price);
        ParameterRanges {
            up_sell_rate: self.ranges.up_sell_rate.unwrap_or(defaults.up_sell_rate),
            up_callback_rate: self.ranges.up_callback_rate.unwrap_or(defaults.up_callback_rate),
            down_buy_rate: self.ranges.down_buy_rate.unwrap_or(defaults.down_buy_rate),
            down_rebound_rate: self.ranges.down_rebound_rate.unwrap_or(defaults.down_rebound_rate),
            shares_per_trade: self.ranges.shares_per_trade.unwrap_or(defaults.shares_per_trade),
            max_callback_ratio: self.max_callback_ratio,
        }
    }
}

fn get_range(map: &Map<String, Value>, key: &str) -> Result<Option<ParamRange>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(r)) => {
            let (Some(min), Some(max)) = (get_opt_f64(r, "min"), get_opt_f64(r, "max")) else {
                return Err(GridError::invalid(format!("ranges.{key} needs min and max")));
            };
            let step = get_f64(r, "step", if key == "shares_per_trade" { 1000.0 } else { 0.0005 });
            let range = ParamRange::new(min, max, step);
            range.validate(key)?;
            Ok(Some(range))
        }
        Some(_) => Err(GridError::invalid(format!("ranges.{key} must be an object"))),
    }
}

fn get_opt_f64(map: &Map<String, Value>, key: &str) -> Option<f64> {
    map.get(key).and_then(|v| {
        if let Some(f) = v.as_f64() {
            Some(f)
        } else {
            v.as_str().and_then(|s| s.trim().parse::<f64>().ok())
        }
    })
}

fn get_f64(map: &Map<String, Value>, key: &str, default: f64) -> f64 {
    get_opt_f64(map, key).unwrap_or(default)
}

fn get_i64(map: &Map<String, Value>, key: &str, default: i64) -> i64 {
    map.get(key)
        .and_then(|v| {
            if let Some(i) = v.as_i64() {
                Some(i)
            } else {
                v.as_f64().map(|x| x.round() as i64)
            }
        })
        .unwrap_or(default)
}

fn get_u64(map: &Map<String, Value>, key: &str, default: u64) -> Result<u64> {
    let v = get_i64(map, key, default as i64);
    u64::try_from(v).map_err(|_| GridError::invalid(format!("{key} must not be negative (value: {v})")))
}

fn get_bool(map: &Map<String, Value>, key: &str, default: bool) -> bool {
    map.get(key)
        .and_then(|v| {
            if let Some(b) = v.as_bool() {
                Some(b)
            } else {
                v.as_i64().map(|i| i != 0)
            }
        })
        .unwrap_or(default)
}

fn get_string(map: &Map<String, Value>, key: &str, default: &str) -> String {
    map.get(key)
        .and_then(|v| v.as_str().map(ToString::to_string))
        .unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn defaults_fill_an_empty_record() {
        let s = RunSettings::from_params(&Map::new()).unwrap();
        assert_eq!(s.symbol, "159300");
        assert_eq!(s.kind, SecurityKind::Etf);
        assert_eq!(s.n_trials, 100);
        assert_eq!(s.segmentation.aggregation, Aggregation::Mean);
        assert_eq!(s.segmentation.frequency_hint, 2);
        assert!(s.price_range.is_none());
        assert!(s.options.ma.is_none());
        assert!(s.options.multiple_trade);
        assert_eq!(s.max_callback_ratio, Some(DEFAULT_MAX_CALLBACK_RATIO));
        assert!(s.as_of.is_none());
    }

    #[test]
    fn reads_typed_values_and_nested_ranges() {
        let s = RunSettings::from_params(&map(json!({
            "symbol": "600519",
            "start_date": "2024-01-02",
            "end_date": "2024-06-28",
            "initial_cash": 50000,
            "initial_positions": 2000,
            "price_range_min": "3.9",
            "price_range_max": 4.3,
            "ma_protection": 1,
            "ma_period": 20,
            "ma_direction": "buy_below",
            "enable_segments": true,
            "profit_calc_method": "median",
            "connect_segments": true,
            "sampler": "random",
            "n_trials": 40,
            "two_phase": true,
            "as_of_date": "2024-06-28",
            "ranges": {
                "up_sell_rate": {"min": 0.005, "max": 0.02, "step": 0.001},
                "shares_per_trade": {"min": 1000, "max": 5000}
            }
        })))
        .unwrap();
        assert_eq!(s.kind, SecurityKind::Stock);
        assert_eq!(s.initial_positions, 2000);
        assert_eq!(s.price_range, Some((3.9, 4.3)));
        assert_eq!(
            s.options.ma,
            Some(MaProtection {
                period: 20,
                direction: MaDirection::BuyBelow
            })
        );
        assert_eq!(s.segmentation.aggregation, Aggregation::Median);
        assert!(s.segmentation.connect);
        assert_eq!(s.sampler, SamplerKind::Random);

        let r = s.parameter_ranges(4.0);
        assert_eq!(r.up_sell_rate, ParamRange::new(0.005, 0.02, 0.001));
        assert_eq!(r.shares_per_trade, ParamRange::new(1000.0, 5000.0, 1000.0));
        assert_eq!(r.down_buy_rate, ParamRange::new(0.003, 0.03, 0.0005));

        assert_eq!(s.fixed_config((3.9, 4.3)).as_of, NaiveDate::from_ymd_opt(2024, 6, 28));

        let acct = s.account((3.9, 4.3));
        assert_eq!(acct.base_price, Some(3.9));
        assert!(acct.validate().is_ok());
    }

    #[test]
    fn rejects_invalid_records() {
        let bad = [
            json!({"start_date": "2024-06-01", "end_date": "2024-01-01"}),
            json!({"initial_cash": -1}),
            json!({"price_range_min": 4.3, "price_range_max": 3.9}),
            json!({"price_range_min": 4.3}),
            json!({"aggregation": "mode"}),
            json!({"sampler": "grid"}),
            json!({"n_trials": 0}),
            json!({"initial_positions": -1000}),
            json!({"ranges": {"up_sell_rate": {"min": 0.02, "max": 0.01}}}),
            json!({"ma_protection": true, "ma_period": 0}),
        ];
        for v in bad {
            assert!(RunSettings::from_params(&map(v.clone())).is_err(), "accepted {v}");
        }
        let err = RunSettings::from_params(&map(json!({"start_date": "10/10/2024"}))).unwrap_err();
        assert!(matches!(err, GridError::InvalidDate(_)));
    }
}
