//! SPX setup outcome tracking and threshold optimization.
//!
//! Persists setup lifecycles, resolves them to final outcomes, replays them
//! against historical bars, and tunes the quality gates that decide which
//! setups are actionable through a walk-forward scan.

pub mod analytics;
pub mod backtest;
pub mod bars;
pub mod calendar;
pub mod circuit_breaker;
pub mod config;
pub mod engine;
pub mod error;
pub mod optimizer;
pub mod outcome;
pub mod storage;
pub mod types;

// Re-export main types for convenience
pub use analytics::WinRateAnalytics;
pub use backtest::{BacktestRequest, BacktestResult, ExecutionModel};
pub use config::{EngineBuilder, EngineConfig};
pub use engine::{ScanRequest, SetupEngine};
pub use error::ValidationError;
pub use optimizer::{OptimizationProfile, ScanMode, ScanOutcome, Scorecard};
pub use outcome::{ResolveReport, TransitionEvent, TransitionPhase};
pub use types::{DateRange, FinalOutcome, SetupInstance, SetupKey, SetupStatus};
