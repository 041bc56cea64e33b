//! Grid trading backtester and strategy parameter optimizer.

pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod model;
pub mod optimizer;
pub mod report;
pub mod sampler;
pub mod segments;

pub use config::RunSettings;
pub use data::{CachedPriceSource, CsvPriceSource, InMemoryPriceSource, PriceSource, SeriesCalendar, TradingCalendar};
pub use engine::{BacktestOutcome, EngineOptions, GridStrategy, MaDirection, MaProtection};
pub use error::{ErrorKind, GridError, Result};
pub use model::{
    AccountSettings, FailedTradeCounters, FailureReason, PriceBar, SecurityKind, Segment, Side,
    StrategyParameters, Trade,
};
pub use optimizer::{
    Aggregation, CancelToken, FixedConfig, OptimizationDriver, OptimizationResult, Segmentation,
    Trial, TrialObserver, TrialStatus,
};
pub use report::ResultReporter;
pub use sampler::{ParamRange, ParameterRanges, SamplerKind};
pub use segments::build_segments;
