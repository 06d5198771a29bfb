//! Engine configuration.
//!
//! `EngineConfig::default()` carries production defaults; `from_env` layers
//! `SPX_*` environment overrides on top. Malformed overrides are ignored.

use anyhow::Result;
use std::sync::Arc;

use crate::backtest::ExecutionModel;
use crate::bars::BarProvider;
use crate::engine::SetupEngine;
use crate::storage::SetupStore;

/// Market data endpoint settings.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketDataConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub ticker: String,
    pub request_timeout_secs: u64,
    pub retry_attempts: usize,
    pub requests_per_second: u32,
    /// Sessions fetched concurrently.
    pub max_parallel_sessions: usize,
    /// Upper bound on one session's fetch, all resolutions included.
    pub session_timeout_secs: u64,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.polygon.io".to_string(),
            api_key: None,
            ticker: "I:SPX".to_string(),
            request_timeout_secs: 10,
            retry_attempts: 3,
            requests_per_second: 5,
            max_parallel_sessions: 4,
            session_timeout_secs: 45,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Timeout for each store call in seconds.
    pub store_timeout_secs: u64,
    pub market_data: MarketDataConfig,
    pub profile_cache_ttl_secs: u64,
    pub profile_cache_capacity: u64,
    /// Matcher look-ahead after the trigger.
    pub resolution_ttl_minutes: i64,
    pub execution_model: ExecutionModel,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: u64,
    pub level_touch_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://spx_setups.db?mode=rwc".to_string(),
            max_connections: 5,
            store_timeout_secs: 10,
            market_data: MarketDataConfig::default(),
            profile_cache_ttl_secs: 30,
            profile_cache_capacity: 16,
            resolution_ttl_minutes: 90,
            execution_model: ExecutionModel::default(),
            breaker_failure_threshold: 3,
            breaker_cooldown_secs: 60,
            level_touch_channel_capacity: 256,
        }
    }
}

fn parse_bool(value: Option<String>, fallback: bool) -> bool {
    match value.map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if v == "true" => true,
        Some(v) if v == "false" => false,
        _ => fallback,
    }
}

fn parse_float(value: Option<String>, fallback: f64, min: f64) -> f64 {
    value
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .map(|v| v.max(min))
        .unwrap_or(fallback)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl EngineConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = non_empty(lookup("SPX_DATABASE_URL")) {
            config.database_url = url;
        }
        config.market_data.api_key = non_empty(lookup("MASSIVE_API_KEY"));
        if let Some(url) = non_empty(lookup("MASSIVE_API_BASE_URL")) {
            config.market_data.base_url = url;
        }
        if let Some(minutes) = lookup("SPX_RESOLUTION_TTL_MINUTES")
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|v| *v > 0)
        {
            config.resolution_ttl_minutes = minutes;
        }

        let model = &mut config.execution_model;
        model.enabled = parse_bool(lookup("SPX_BACKTEST_EXECUTION_MODEL_ENABLED"), model.enabled);
        model.entry_slip_points =
            parse_float(lookup("SPX_BACKTEST_ENTRY_SLIP_POINTS"), model.entry_slip_points, 0.0);
        model.target_slip_points =
            parse_float(lookup("SPX_BACKTEST_TARGET_SLIP_POINTS"), model.target_slip_points, 0.0);
        model.stop_slip_points =
            parse_float(lookup("SPX_BACKTEST_STOP_SLIP_POINTS"), model.stop_slip_points, 0.0);
        model.commission_per_trade_r =
            parse_float(lookup("SPX_BACKTEST_COMMISSION_R"), model.commission_per_trade_r, 0.0);
        model.partial_at_t1_pct =
            parse_float(lookup("SPX_BACKTEST_PARTIAL_AT_T1_PCT"), model.partial_at_t1_pct, 0.0).min(1.0);
        model.move_stop_to_breakeven_after_t1 = parse_bool(
            lookup("SPX_BACKTEST_MOVE_STOP_TO_BREAKEVEN_AFTER_T1"),
            model.move_stop_to_breakeven_after_t1,
        );

        config
    }
}

/// Builder for a wired `SetupEngine`.
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn SetupStore>>,
    bar_provider: Option<Arc<dyn BarProvider>>,
}

impl EngineBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self::from_config(EngineConfig::default())
    }

    pub fn from_config(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            bar_provider: None,
        }
    }

    /// Set the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.config.database_url = url.into();
        self
    }

    /// Set the market data endpoint and key.
    pub fn with_market_data(mut self, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        self.config.market_data.base_url = base_url.into();
        self.config.market_data.api_key = api_key;
        self
    }

    /// Set session fan-out.
    pub fn with_max_parallel_sessions(mut self, max_sessions: usize) -> Self {
        self.config.market_data.max_parallel_sessions = max_sessions;
        self
    }

    /// Set profile cache TTL in seconds.
    pub fn with_profile_cache_ttl(mut self, ttl_seconds: u64) -> Self {
        self.config.profile_cache_ttl_secs = ttl_seconds;
        self
    }

    pub fn with_resolution_ttl_minutes(mut self, minutes: i64) -> Self {
        self.config.resolution_ttl_minutes = minutes;
        self
    }

    pub fn with_execution_model(mut self, model: ExecutionModel) -> Self {
        self.config.execution_model = model;
        self
    }

    /// Set circuit breaker configuration.
    pub fn with_circuit_breaker(mut self, failure_threshold: u32, cooldown_seconds: u64) -> Self {
        self.config.breaker_failure_threshold = failure_threshold;
        self.config.breaker_cooldown_secs = cooldown_seconds;
        self
    }

    /// Use an existing store instead of connecting to `database_url`.
    pub fn with_store(mut self, store: Arc<dyn SetupStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use an existing bar provider instead of the HTTP client.
    pub fn with_bar_provider(mut self, provider: Arc<dyn BarProvider>) -> Self {
        self.bar_provider = Some(provider);
        self
    }

    /// Build the engine configuration.
    pub fn build_config(self) -> EngineConfig {
        self.config
    }

    /// Connect the store (unless injected) and wire the engine.
    pub async fn build(self) -> Result<SetupEngine> {
        SetupEngine::connect(self.config, self.store, self.bar_provider).await
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
