//! Per-session bar loading with resolution fallback.
//!
//! Sessions are fetched concurrently under a semaphore. Each session tries
//! the preferred resolutions in order and settles on the first non-empty
//! response; a session with no bars at any resolution, a failed fetch or a
//! timeout is reported as missing and never guessed.

use chrono::NaiveDate;
use nonempty::NonEmpty;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use super::{BarProvider, Resolution, ResolutionRequest, ResolutionUsed};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::MarketDataConfig;
use crate::types::PriceBar;

/// Bars loaded for a batch of sessions.
#[derive(Debug, Clone)]
pub struct SessionBars {
    pub bars: BTreeMap<NaiveDate, (Resolution, Vec<PriceBar>)>,
    pub missing_sessions: Vec<NaiveDate>,
    /// Sessions served by a coarser resolution than the first preference.
    pub fallback_sessions: Vec<NaiveDate>,
    pub resolution_used: ResolutionUsed,
}

impl SessionBars {
    pub fn get(&self, session: NaiveDate) -> Option<(Resolution, &[PriceBar])> {
        self.bars
            .get(&session)
            .map(|(resolution, bars)| (*resolution, bars.as_slice()))
    }
}

pub struct BarLoader {
    provider: Arc<dyn BarProvider>,
    ticker: String,
    max_parallel: usize,
    session_timeout: Duration,
    breaker: Arc<Mutex<CircuitBreaker>>,
}

impl BarLoader {
    pub fn new(
        provider: Arc<dyn BarProvider>,
        config: &MarketDataConfig,
        breaker: Arc<Mutex<CircuitBreaker>>,
    ) -> Self {
        Self {
            provider,
            ticker: config.ticker.clone(),
            max_parallel: config.max_parallel_sessions.max(1),
            session_timeout: Duration::from_secs(config.session_timeout_secs),
            breaker,
        }
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Loads every distinct session in `sessions`.
    #[instrument(skip(self, sessions), fields(requested = %request.as_str()))]
    pub async fn load_sessions(&self, sessions: &[NaiveDate], request: ResolutionRequest) -> SessionBars {
        let unique: BTreeSet<NaiveDate> = sessions.iter().copied().collect();
        let preference = request.preference();
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut tasks = JoinSet::new();

        for session in unique.iter().copied() {
            let semaphore = semaphore.clone();
            let provider = self.provider.clone();
            let breaker = self.breaker.clone();
            let ticker = self.ticker.clone();
            let preference = preference.clone();
            let timeout = self.session_timeout;

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (session, None);
                };
                let fetch = load_session(provider, breaker, &ticker, session, &preference);
                match tokio::time::timeout(timeout, fetch).await {
                    Ok(loaded) => (session, loaded),
                    Err(_) => {
                        warn!(session = %session, "Timed out loading bars");
                        (session, None)
                    }
                }
            });
        }

        let mut loaded = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((session, Some(entry))) => {
                    loaded.insert(session, entry);
                }
                Ok((_, None)) => {}
                Err(e) => warn!(error = %e, "Bar loading task failed"),
            }
        }

        let preferred = preference.head;
        let missing_sessions: Vec<NaiveDate> =
            unique.iter().copied().filter(|d| !loaded.contains_key(d)).collect();
        let fallback_sessions: Vec<NaiveDate> = loaded
            .iter()
            .filter(|(_, (resolution, _))| *resolution != preferred)
            .map(|(date, _)| *date)
            .collect();
        let resolution_used = if loaded.values().any(|(r, _)| *r == Resolution::Second) {
            ResolutionUsed::Second
        } else if loaded.values().any(|(r, _)| *r == Resolution::Minute) {
            ResolutionUsed::Minute
        } else {
            ResolutionUsed::None
        };

        info!(
            "Loaded bars for {}/{} sessions ({} fallback, {} missing)",
            loaded.len(),
            unique.len(),
            fallback_sessions.len(),
            missing_sessions.len()
        );

        SessionBars {
            bars: loaded,
            missing_sessions,
            fallback_sessions,
            resolution_used,
        }
    }
}

async fn load_session(
    provider: Arc<dyn BarProvider>,
    breaker: Arc<Mutex<CircuitBreaker>>,
    ticker: &str,
    session: NaiveDate,
    preference: &NonEmpty<Resolution>,
) -> Option<(Resolution, Vec<PriceBar>)> {
    for resolution in preference.iter().copied() {
        if !breaker.lock().await.is_available(resolution.channel()) {
            debug!(session = %session, resolution = %resolution, "Skipping unavailable bar channel");
            continue;
        }

        match provider.get_aggregates(ticker, 1, resolution, session, session).await {
            Ok(mut bars) => {
                breaker.lock().await.record_success(resolution.channel());
                bars.retain(PriceBar::is_finite);
                if !bars.is_empty() {
                    bars.sort_by_key(|bar| bar.t);
                    return Some((resolution, bars));
                }
                debug!(session = %session, resolution = %resolution, "No bars returned");
            }
            Err(e) => {
                breaker.lock().await.record_failure(resolution.channel());
                warn!(session = %session, resolution = %resolution, error = %e, "Failed to load bars");
            }
        }
    }
    None
}
