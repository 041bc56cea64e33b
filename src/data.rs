//! Price and calendar collaborators consumed by the backtest core.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use log::{debug, warn};

use crate::error::{GridError, Result};
use crate::model::{PriceBar, SecurityKind};

/// Daily bars for a symbol, ascending by date. An empty result is an error.
pub trait PriceSource {
    fn get_price_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        kind: SecurityKind,
    ) -> Result<Vec<PriceBar>>;
}

pub trait TradingCalendar {
    fn get_trading_days(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>>;
}

fn window(bars: &[PriceBar], symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<PriceBar>> {
    let out: Vec<PriceBar> = bars
        .iter()
        .filter(|b| b.date >= start && b.date <= end)
        .cloned()
        .collect();
    if out.is_empty() {
        return Err(GridError::DataUnavailable {
            symbol: symbol.to_string(),
            start,
            end,
        });
    }
    Ok(out)
}

/// Bars held in memory; the symbol and kind are not consulted.
#[derive(Clone, Debug, Default)]
pub struct InMemoryPriceSource {
    bars: Vec<PriceBar>,
}

impl InMemoryPriceSource {
    pub fn new(mut bars: Vec<PriceBar>) -> Self {
        bars.sort_by_key(|b| b.date);
        Self { bars }
    }

    pub fn bars(&self) -> &[PriceBar] {
        &self.bars
    }
}

impl PriceSource for InMemoryPriceSource {
    fn get_price_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        _kind: SecurityKind,
    ) -> Result<Vec<PriceBar>> {
        window(&self.bars, symbol, start, end)
    }
}

/// A daily-bar CSV export: `date,open,high,low,close` with a header row.
#[derive(Clone, Debug)]
pub struct CsvPriceSource {
    path: PathBuf,
    bars: Vec<PriceBar>,
}

impl CsvPriceSource {
    pub fn from_path(path: &Path) -> Result<Self> {
        let bars = load_bars_from_csv(path)?;
        if bars.is_empty() {
            return Err(GridError::DataSource(format!(
                "no usable rows in {}",
                path.display()
            )));
        }
        debug!("loaded {} bars from {}", bars.len(), path.display());
        Ok(Self {
            path: path.to_path_buf(),
            bars,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bars(&self) -> &[PriceBar] {
        &self.bars
    }
}

impl PriceSource for CsvPriceSource {
    fn get_price_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        _kind: SecurityKind,
    ) -> Result<Vec<PriceBar>> {
        window(&self.bars, symbol, start, end)
    }
}

fn parse_bar_date(raw: &str) -> Option<NaiveDate> {
    let t = raw.trim();
    NaiveDate::parse_from_str(t, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(t, "%Y%m%d"))
        .ok()
}

pub fn load_bars_from_csv(path: &Path) -> Result<Vec<PriceBar>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| GridError::DataSource(format!("failed to open csv {}: {e}", path.display())))?;

    let mut bars = Vec::new();
    let mut skipped = 0_usize;
    for rec in rdr.records() {
        let Ok(r) = rec else {
            skipped += 1;
            continue;
        };
        let date = r.get(0).and_then(parse_bar_date);
        let o = r.get(1).and_then(|x| x.trim().parse::<f64>().ok());
        let h = r.get(2).and_then(|x| x.trim().parse::<f64>().ok());
        let l = r.get(3).and_then(|x| x.trim().parse::<f64>().ok());
        let c = r.get(4).and_then(|x| x.trim().parse::<f64>().ok());
        if let (Some(date), Some(open), Some(high), Some(low), Some(close)) = (date, o, h, l, c) {
            bars.push(PriceBar {
                date,
                open,
                high,
                low,
                close,
            });
        } else {
            skipped += 1;
        }
    }
    if skipped > 0 {
        warn!("skipped {skipped} malformed rows in {}", path.display());
    }
    bars.sort_by_key(|b| b.date);
    Ok(bars)
}

type CacheKey = (String, SecurityKind, NaiveDate, NaiveDate);

/// Memoizes successful fetches for the lifetime of one optimisation run.
pub struct CachedPriceSource<'a> {
    inner: &'a dyn PriceSource,
    cache: RefCell<HashMap<CacheKey, Vec<PriceBar>>>,
}

impl<'a> CachedPriceSource<'a> {
    pub fn new(inner: &'a dyn PriceSource) -> Self {
        Self {
            inner,
            cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn cached_requests(&self) -> usize {
        self.cache.borrow().len()
    }
}

impl PriceSource for CachedPriceSource<'_> {
    fn get_price_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        kind: SecurityKind,
    ) -> Result<Vec<PriceBar>> {
        let key = (symbol.to_string(), kind, start, end);
        if let Some(hit) = self.cache.borrow().get(&key) {
            return Ok(hit.clone());
        }
        let bars = self.inner.get_price_bars(symbol, start, end, kind)?;
        self.cache.borrow_mut().insert(key, bars.clone());
        Ok(bars)
    }
}

/// Trading days are the dates the price series actually has.
pub struct SeriesCalendar<'a> {
    source: &'a dyn PriceSource,
    symbol: String,
    kind: SecurityKind,
}

impl<'a> SeriesCalendar<'a> {
    pub fn new(source: &'a dyn PriceSource, symbol: &str, kind: SecurityKind) -> Self {
        Self {
            source,
            symbol: symbol.to_string(),
            kind,
        }
    }
}

impl TradingCalendar for SeriesCalendar<'_> {
    fn get_trading_days(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>> {
        let bars = self
            .source
            .get_price_bars(&self.symbol, start, end, self.kind)
            .map_err(|e| GridError::Calendar(e.to_string()))?;
        let mut days: Vec<NaiveDate> = bars.into_iter().map(|b| b.date).collect();
        days.dedup();
        Ok(days)
    }
}

/// Monday through Friday between `start` and `end` inclusive.
pub fn business_days(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    let mut d = start;
    while d <= end {
        if !matches!(d.weekday(), Weekday::Sat | Weekday::Sun) {
            out.push(d);
        }
        d += Duration::days(1);
    }
    out
}

/// Lowest low and highest high of a series.
pub fn observed_price_range(bars: &[PriceBar]) -> Option<(f64, f64)> {
    if bars.is_empty() {
        return None;
    }
    let lo = bars.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
    let hi = bars.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
    Some((lo, hi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::fs;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn bar(date: NaiveDate, close: f64) -> PriceBar {
        PriceBar {
            date,
            open: close,
            high: close + 0.05,
            low: close - 0.05,
            close,
        }
    }

    struct CountingSource {
        inner: InMemoryPriceSource,
        calls: Cell<usize>,
    }

    impl PriceSource for CountingSource {
        fn get_price_bars(
            &self,
            symbol: &str,
            start: NaiveDate,
            end: NaiveDate,
            kind: SecurityKind,
        ) -> Result<Vec<PriceBar>> {
            self.calls.set(self.calls.get() + 1);
            self.inner.get_price_bars(symbol, start, end, kind)
        }
    }

    #[test]
    fn in_memory_source_filters_and_reports_empty() {
        let src = InMemoryPriceSource::new(vec![bar(d(2024, 1, 3), 4.1), bar(d(2024, 1, 2), 4.0)]);
        let got = src
            .get_price_bars("159300", d(2024, 1, 1), d(2024, 1, 31), SecurityKind::Etf)
            .unwrap();
        assert_eq!(got.len(), 2);
        assert!(got[0].date < got[1].date);

        let err = src
            .get_price_bars("159300", d(2024, 2, 1), d(2024, 2, 28), SecurityKind::Etf)
            .unwrap_err();
        assert!(matches!(err, GridError::DataUnavailable { .. }));
    }

    #[test]
    fn cache_hits_inner_once_and_skips_failures() {
        let src = CountingSource {
            inner: InMemoryPriceSource::new(vec![bar(d(2024, 1, 2), 4.0)]),
            calls: Cell::new(0),
        };
        let cached = CachedPriceSource::new(&src);
        for _ in 0..3 {
            cached
                .get_price_bars("x", d(2024, 1, 1), d(2024, 1, 5), SecurityKind::Etf)
                .unwrap();
        }
        assert_eq!(src.calls.get(), 1);

        for _ in 0..2 {
            assert!(
                cached
                    .get_price_bars("x", d(2025, 1, 1), d(2025, 1, 5), SecurityKind::Etf)
                    .is_err()
            );
        }
        assert_eq!(src.calls.get(), 3);
        assert_eq!(cached.cached_requests(), 1);
    }

    #[test]
    fn business_days_skip_weekends() {
        // 2024-01-05 is a Friday.
        let days = business_days(d(2024, 1, 5), d(2024, 1, 9));
        assert_eq!(days, vec![d(2024, 1, 5), d(2024, 1, 8), d(2024, 1, 9)]);
        assert!(business_days(d(2024, 1, 6), d(2024, 1, 7)).is_empty());
    }

    #[test]
    fn series_calendar_reports_calendar_error() {
        let src = InMemoryPriceSource::new(vec![bar(d(2024, 1, 2), 4.0), bar(d(2024, 1, 4), 4.0)]);
        let cal = SeriesCalendar::new(&src, "159300", SecurityKind::Etf);
        assert_eq!(
            cal.get_trading_days(d(2024, 1, 1), d(2024, 1, 31)).unwrap(),
            vec![d(2024, 1, 2), d(2024, 1, 4)]
        );
        let err = cal.get_trading_days(d(2023, 1, 1), d(2023, 1, 31)).unwrap_err();
        assert!(matches!(err, GridError::Calendar(_)));
    }

    #[test]
    fn csv_loader_sorts_and_skips_bad_rows() {
        let dir = std::env::temp_dir().join(format!("grid_csv_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bars.csv");
        fs::write(
            &path,
            "date,open,high,low,close\n\
             2024-01-03,4.1,4.2,4.0,4.15\n\
             not-a-date,1,1,1,1\n\
             20240102,4.0,4.1,3.9,4.05\n",
        )
        .unwrap();

        let src = CsvPriceSource::from_path(&path).unwrap();
        assert_eq!(src.bars().len(), 2);
        assert_eq!(src.bars()[0].date, d(2024, 1, 2));
        assert_eq!(observed_price_range(src.bars()), Some((3.9, 4.2)));
        fs::remove_dir_all(&dir).ok();
    }
}
