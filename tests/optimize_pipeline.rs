use std::fs;
use std::path::PathBuf;
use std::sync::Once;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde_json::{Value, json};

use grid_optimizer::data::{business_days, observed_price_range};
use grid_optimizer::{
    CsvPriceSource, GridStrategy, InMemoryPriceSource, OptimizationDriver, PriceBar, PriceSource,
    ResultReporter, RunSettings, SamplerKind, SecurityKind, Side, TrialStatus,
};

fn ensure_test_env() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

/// Oscillating closes around 4.0 on every weekday of the first half of 2024.
fn wave_bars() -> Vec<PriceBar> {
    let mut prev = 4.0;
    business_days(d(2024, 1, 1), d(2024, 6, 28))
        .into_iter()
        .enumerate()
        .map(|(i, date)| {
            let close = 4.0 + 0.12 * (i as f64 * 0.3).sin() + 0.04 * (i as f64 * 1.7).cos();
            let bar = PriceBar {
                date,
                open: prev,
                high: prev.max(close) + 0.015,
                low: prev.min(close) - 0.015,
                close,
            };
            prev = close;
            bar
        })
        .collect()
}

fn write_csv(name: &str, bars: &[PriceBar]) -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("grid_pipeline_{}_{name}", std::process::id()));
    fs::create_dir_all(&dir)?;
    let path = dir.join("bars.csv");
    let mut body = String::from("date,open,high,low,close\n");
    for b in bars {
        body.push_str(&format!("{},{},{},{},{}\n", b.date, b.open, b.high, b.low, b.close));
    }
    fs::write(&path, body).context("failed to write test csv")?;
    Ok(path)
}

#[test]
fn optimize_segmented_run_from_config_and_csv() -> Result<()> {
    ensure_test_env();
    let path = write_csv("segmented", &wave_bars())?;
    let source = CsvPriceSource::from_path(&path)?;

    let params = json!({
        "symbol": "159300",
        "start_date": "2024-01-01",
        "end_date": "2024-06-28",
        "initial_cash": 100000,
        "initial_positions": 5000,
        "base_price": 4.0,
        "enable_segments": true,
        "frequency_hint": 2,
        "aggregation": "median",
        "connect_segments": true,
        "sampler": "tpe",
        "seed": 5,
        "n_trials": 16,
        "two_phase": true
    });
    let settings = RunSettings::from_params(params.as_object().unwrap())?;
    assert_eq!(settings.kind, SecurityKind::Etf);

    let bars = source.get_price_bars(&settings.symbol, settings.start, settings.end, settings.kind)?;
    let range = observed_price_range(&bars).unwrap();
    let fixed = settings.fixed_config(range);
    let ranges = settings.parameter_ranges(4.0);

    let result = OptimizationDriver::new(&source)
        .with_sampler(settings.sampler)
        .with_seed(settings.seed)
        .with_two_phase(settings.two_phase)
        .optimize(&ranges, settings.n_trials, &fixed)?;

    assert!(!result.cancelled);
    assert_eq!(result.history.len(), 16 + 8);
    let best = result.best_trial.clone().unwrap();
    assert_eq!(best.number, result.ranked_trials[0].number);
    assert!(best.segments.len() > 1);
    for t in &result.history {
        assert!(!matches!(t.status, TrialStatus::Failed(_)));
        assert!(ranges.contains(&t.params));
        for pair in t.segments.windows(2) {
            assert!(pair[0].segment.end < pair[1].segment.start);
            assert_eq!(pair[1].start_positions, pair[0].final_positions);
        }
    }

    let reporter = ResultReporter {
        top_n: 3,
        only_profitable: false,
    };
    let lines = reporter.format_ranking(&result.ranked_trials);
    assert!(lines[0].starts_with("Parameter combination 1: profit "));
    assert!(lines.iter().any(|l| l == "- Aggregation: median"));
    assert!(lines.iter().any(|l| l == "Segment 1:"));

    let exported: Value = serde_json::to_value(&result)?;
    assert!(exported["best_trial"]["params"]["shares_per_trade"].is_u64());
    assert_eq!(exported["history"].as_array().map(Vec::len), Some(24));

    fs::remove_dir_all(path.parent().unwrap()).ok();
    Ok(())
}

#[test]
fn random_search_is_reproducible_and_bounded() -> Result<()> {
    ensure_test_env();
    let source = InMemoryPriceSource::new(wave_bars());
    let settings = RunSettings::from_params(
        json!({
            "start_date": "2024-02-01",
            "end_date": "2024-05-31",
            "price_range_min": 3.7,
            "price_range_max": 4.3,
            "sampler": "random",
            "n_trials": 25,
            "ranges": {
                "up_sell_rate": {"min": 0.004, "max": 0.02, "step": 0.0005},
                "shares_per_trade": {"min": 1000, "max": 8000, "step": 1000}
            }
        })
        .as_object()
        .unwrap(),
    )?;
    let fixed = settings.fixed_config(settings.price_range.unwrap());
    assert_eq!(fixed.account.base_price, Some(3.7));
    let ranges = settings.parameter_ranges(3.7);

    let run = || {
        OptimizationDriver::new(&source)
            .with_sampler(SamplerKind::Random)
            .with_seed(2024)
            .optimize(&ranges, settings.n_trials, &fixed)
    };
    let a = run()?;
    let b = run()?;
    let scores = |r: &grid_optimizer::OptimizationResult| -> Vec<Option<f64>> {
        r.history.iter().map(|t| t.score).collect()
    };
    assert_eq!(scores(&a), scores(&b));

    for t in a.history.iter().filter(|t| t.status == TrialStatus::Complete) {
        let p = t.params;
        assert!(p.up_sell_rate >= 0.004 - 1e-12 && p.up_sell_rate <= 0.02 + 1e-12);
        assert!(p.shares_per_trade >= 1000 && p.shares_per_trade <= 8000);
        assert_eq!(p.shares_per_trade % 1000, 0);
        assert!(p.up_callback_rate < p.up_sell_rate);
        assert!(p.down_rebound_rate < p.down_buy_rate);
    }
    for pair in a.ranked_trials.windows(2) {
        assert!(pair[0].score <= pair[1].score);
    }
    Ok(())
}

#[test]
fn single_backtest_details_match_the_trade_log() -> Result<()> {
    ensure_test_env();
    let source = InMemoryPriceSource::new(wave_bars());
    let settings = RunSettings::from_params(
        json!({
            "start_date": "2024-01-01",
            "end_date": "2024-03-29",
            "initial_positions": 5000,
            "base_price": 4.0,
            "price_range_min": 3.5,
            "price_range_max": 4.5,
            "up_sell_rate": 0.01,
            "up_callback_rate": 0.003,
            "down_buy_rate": 0.01,
            "down_rebound_rate": 0.003,
            "shares_per_trade": 1000
        })
        .as_object()
        .unwrap(),
    )?;
    let account = settings.account(settings.price_range.unwrap());
    let mut strategy = GridStrategy::new(settings.strategy, account).with_options(settings.options);
    let outcome = strategy.backtest(&source, &settings.symbol, settings.kind, settings.start, settings.end)?;

    assert!(!outcome.trades.is_empty());
    let shares = |side: Side| -> u64 {
        outcome.trades.iter().filter(|t| t.side == side).map(|t| t.shares).sum()
    };
    assert_eq!(outcome.final_positions, 5000 + shares(Side::Buy) - shares(Side::Sell));
    assert_eq!(outcome.final_positions, outcome.trades.last().unwrap().positions_after);

    let lines = ResultReporter::default().format_backtest(&settings.strategy, &account, &outcome);
    assert!(lines.contains(&format!("Trades: {}", outcome.trades.len())));
    assert!(lines.iter().any(|l| l.starts_with("Max positions: ")));
    assert!(lines.contains(&format!("Profit rate: {:.2}%", outcome.profit_rate)));
    Ok(())
}

#[test]
fn missing_history_is_reported_per_trial() -> Result<()> {
    ensure_test_env();
    let source = InMemoryPriceSource::new(wave_bars());
    let settings = RunSettings::from_params(
        json!({
            "start_date": "2025-01-01",
            "end_date": "2025-03-31",
            "price_range_min": 3.5,
            "price_range_max": 4.5,
            "enable_segments": true,
            "n_trials": 4
        })
        .as_object()
        .unwrap(),
    )?;
    let fixed = settings.fixed_config(settings.price_range.unwrap());
    let result = OptimizationDriver::new(&source).optimize(
        &settings.parameter_ranges(3.5),
        settings.n_trials,
        &fixed,
    )?;
    assert_eq!(result.history.len(), 4);
    assert!(result.best_trial.is_none());
    assert!(
        result
            .history
            .iter()
            .all(|t| matches!(t.status, TrialStatus::Failed(_)))
    );
    let lines = ResultReporter::default().format_ranking(&result.ranked_trials);
    assert_eq!(lines, vec!["No parameter combination to report".to_string()]);
    Ok(())
}
