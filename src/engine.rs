//! `SetupEngine` wires the store, market data, resolver, optimizer and
//! backtester behind the operations callers use.
//!
//! Only malformed input is returned as an error. Store and market data
//! failures degrade to empty results with notes, and the active profile is
//! kept whenever a scan cannot be persisted.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::analytics::{summarize, WinRateAnalytics};
use crate::backtest::{rows_by_key, BacktestRequest, BacktestResult, Backtester};
use crate::bars::{BarLoader, BarProvider, HttpBarProvider, ResolutionRequest};
use crate::calendar::{default_scan_range, parse_date, parse_range};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::EngineConfig;
use crate::error::ValidationError;
use crate::optimizer::{
    baseline_scorecard, run_walk_forward, OptimizationProfile, OptimizerState, ProfileAccessor, ScanMode,
    ScanOutcome, ScanRow, ScanWindows, Scorecard,
};
use crate::outcome::{LevelTouchRecorder, OutcomeResolver, ResolveReport, TransitionEvent};
use crate::storage::{with_timeout, SetupStore, SqliteStore};
use crate::types::{DateRange, OutcomeRow, SetupInstance};

const BREAKER_WINDOW: usize = 20;

/// Parameters for [`SetupEngine::run_optimizer_scan`]. Missing dates fall
/// back to the profile's default history window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanRequest {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub mode: ScanMode,
}

impl ScanRequest {
    pub fn parse(from: Option<&str>, to: Option<&str>, mode: Option<&str>) -> Result<Self, ValidationError> {
        Ok(Self {
            from: from.map(parse_date).transpose()?,
            to: to.map(parse_date).transpose()?,
            mode: mode.map(str::parse::<ScanMode>).transpose()?.unwrap_or_default(),
        })
    }

    fn range(&self, profile: &OptimizationProfile) -> Result<DateRange, ValidationError> {
        let fallback = default_scan_range(Utc::now(), profile.history_days());
        DateRange::new(self.from.unwrap_or(fallback.from), self.to.unwrap_or(fallback.to))
    }
}

pub struct SetupEngine {
    config: EngineConfig,
    store: Arc<dyn SetupStore>,
    touches: Arc<LevelTouchRecorder>,
    resolver: Arc<OutcomeResolver>,
    profiles: ProfileAccessor,
    backtester: Backtester,
}

impl SetupEngine {
    /// Wires the engine. Connects to `config.database_url` and the HTTP
    /// aggregates endpoint unless a store or provider is injected.
    pub async fn connect(
        config: EngineConfig,
        store: Option<Arc<dyn SetupStore>>,
        bar_provider: Option<Arc<dyn BarProvider>>,
    ) -> Result<Self> {
        let store: Arc<dyn SetupStore> = match store {
            Some(store) => store,
            None => SqliteStore::connect(&config.database_url, config.max_connections)
                .await
                .context("Failed to connect setup store")?,
        };

        let bar_provider: Arc<dyn BarProvider> = match bar_provider {
            Some(provider) => provider,
            None => {
                let http_client = Client::builder()
                    .timeout(Duration::from_secs(config.market_data.request_timeout_secs))
                    .build()
                    .context("Failed to build HTTP client")?;
                Arc::new(HttpBarProvider::new(http_client, config.market_data.clone()))
            }
        };

        let store_timeout = Duration::from_secs(config.store_timeout_secs);
        let breaker = || {
            CircuitBreaker::new(
                config.breaker_failure_threshold,
                config.breaker_cooldown_secs,
                BREAKER_WINDOW,
            )
        };

        let touches = Arc::new(LevelTouchRecorder::spawn(
            store.clone(),
            config.level_touch_channel_capacity,
            breaker(),
        ));
        let resolver = Arc::new(OutcomeResolver::new(store.clone(), Some(touches.clone()), store_timeout));
        let profiles = ProfileAccessor::new(
            store.clone(),
            Duration::from_secs(config.profile_cache_ttl_secs),
            config.profile_cache_capacity,
            store_timeout,
        );
        let loader = BarLoader::new(bar_provider, &config.market_data, Arc::new(Mutex::new(breaker())));
        let backtester = Backtester::new(
            store.clone(),
            loader,
            resolver.clone(),
            store_timeout,
            ChronoDuration::minutes(config.resolution_ttl_minutes),
            config.execution_model,
        );

        info!(database = %config.database_url, "Setup engine ready");
        Ok(Self {
            config,
            store,
            touches,
            resolver,
            profiles,
            backtester,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.config.store_timeout_secs)
    }

    /// Stored setups in `range`; empty with a warning when the store fails.
    async fn load_setups(&self, range: DateRange) -> Option<Vec<SetupInstance>> {
        match with_timeout(self.store_timeout(), "listing setups", self.store.list_setups(range)).await {
            Ok(setups) => Some(setups),
            Err(e) => {
                warn!(range = %range, error = %e, "Failed to list setups");
                None
            }
        }
    }

    /// Persists live snapshots and terminal outcomes.
    pub async fn resolve_outcomes(&self, setups: &[SetupInstance]) -> ResolveReport {
        self.resolver.resolve_outcomes(setups, Some(Utc::now())).await
    }

    /// Applies lifecycle transitions in arrival order.
    pub async fn apply_transitions(&self, events: &[TransitionEvent]) -> ResolveReport {
        self.resolver.apply_transitions(events).await
    }

    /// Win-rate analytics over stored outcomes. Ambiguous rows are excluded.
    #[instrument(skip(self))]
    pub async fn get_win_rate_analytics(&self, from: &str, to: &str) -> Result<WinRateAnalytics> {
        let range = parse_range(from, to)?;
        let rows: Vec<OutcomeRow> = self
            .load_setups(range)
            .await
            .unwrap_or_default()
            .iter()
            .map(OutcomeRow::from)
            .filter(|row| !row.ambiguous)
            .collect();
        Ok(summarize(&rows, range))
    }

    pub async fn get_active_profile(&self) -> OptimizationProfile {
        self.profiles.active_profile().await
    }

    /// Last persisted scorecard, or a baseline one computed from stored
    /// outcomes when no scan has run yet.
    #[instrument(skip(self))]
    pub async fn get_scorecard(&self) -> Scorecard {
        match self.profiles.load_state().await {
            Ok(Some(OptimizerState {
                scorecard: Some(scorecard),
                ..
            })) => return scorecard,
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to load optimizer state"),
        }

        let profile = self.profiles.active_profile().await;
        let now = Utc::now();
        let range = default_scan_range(now, profile.history_days());
        let rows: Vec<ScanRow> = self
            .load_setups(range)
            .await
            .unwrap_or_default()
            .iter()
            .map(|setup| ScanRow::from_setup(setup, None))
            .collect();
        baseline_scorecard(&rows, &profile, range, now)
    }

    /// Replays the scan window at second resolution, runs the walk-forward
    /// search and persists the result as the active state.
    #[instrument(skip(self), fields(mode = %request.mode))]
    pub async fn run_optimizer_scan(&self, request: ScanRequest) -> Result<ScanOutcome> {
        let profile = self.profiles.active_profile().await;
        let scan = request.range(&profile)?;
        let windows = ScanWindows::new(scan, &profile.walk_forward);
        let load_range = windows.load_range();

        let mut replay_request = BacktestRequest::new(load_range);
        replay_request.resolution = ResolutionRequest::Second;
        replay_request.include_paused_setups = true;
        replay_request.include_rows = true;
        let replay = self.backtester.run(&replay_request, &profile).await;
        let replayed = replay
            .rows
            .as_deref()
            .map(|rows| {
                let sequenced: Vec<OutcomeRow> = rows.iter().filter(|row| !row.ambiguous).cloned().collect();
                rows_by_key(&sequenced)
            })
            .unwrap_or_default();

        let mut notes = Vec::new();
        let setups = match self.load_setups(load_range).await {
            Some(setups) => setups,
            None => {
                notes.push("Failed to load stored setups; scan ran without historical rows.".to_string());
                Vec::new()
            }
        };
        let rows: Vec<ScanRow> = setups
            .iter()
            .map(|setup| ScanRow::from_setup(setup, replayed.get(&setup.key())))
            .collect();

        let now = Utc::now();
        let mut outcome = run_walk_forward(&rows, &profile, windows, request.mode, now);
        if !replayed.is_empty() {
            notes.push(format!(
                "Replayed {} setups against historical bars before scoring.",
                replayed.len()
            ));
        }
        notes.extend(replay.notes.iter().map(|note| format!("Backtest: {note}")));

        if let Err(e) = self.profiles.publish(&OptimizerState::from_scan(&outcome, now)).await {
            warn!(error = %e, "Failed to persist optimizer state; active profile unchanged");
            notes.push("Failed to persist optimizer state; the previous profile remains active.".to_string());
        }
        outcome.scorecard.notes.extend(notes);
        Ok(outcome)
    }

    /// Replays stored setups against historical bars. An inverted range is
    /// rejected before anything is loaded.
    pub async fn run_backtest(&self, request: &BacktestRequest) -> Result<BacktestResult> {
        request.range.validated()?;
        let profile = self.profiles.active_profile().await;
        Ok(self.backtester.run(request, &profile).await)
    }

    /// Drains pending level touches.
    pub async fn close(self) {
        let Self {
            touches,
            resolver,
            backtester,
            ..
        } = self;
        drop(backtester);
        drop(resolver);
        match Arc::try_unwrap(touches) {
            Ok(touches) => touches.close().await,
            Err(_) => warn!("Level touch recorder still shared at shutdown"),
        }
    }
}
