//! Cached read path for the active optimizer state.

use anyhow::Result;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::profile::OptimizationProfile;
use super::OptimizerState;
use crate::storage::{with_timeout, SetupStore};

const ACTIVE_KEY: &str = "active";

/// Reads the active profile through a short-TTL cache. Writes go straight
/// to the store and then refresh the cache.
pub struct ProfileAccessor {
    store: Arc<dyn SetupStore>,
    cache: Cache<String, OptimizationProfile>,
    store_timeout: Duration,
}

impl ProfileAccessor {
    pub fn new(store: Arc<dyn SetupStore>, ttl: Duration, capacity: u64, store_timeout: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity.max(1))
            .time_to_live(ttl)
            .build();

        Self {
            store,
            cache,
            store_timeout,
        }
    }

    /// Active profile, normalized. Falls back to the default profile when no
    /// state is stored or the store cannot be read.
    #[instrument(skip(self))]
    pub async fn active_profile(&self) -> OptimizationProfile {
        if let Some(profile) = self.cache.get(ACTIVE_KEY).await {
            debug!("Profile cache hit");
            return profile;
        }

        match self.load_state().await {
            Ok(state) => {
                let profile = state
                    .map(|state| state.profile)
                    .unwrap_or_default()
                    .normalized();
                self.cache.insert(ACTIVE_KEY.to_string(), profile.clone()).await;
                profile
            }
            Err(e) => {
                warn!(error = %e, "Failed to load optimizer state, using default profile");
                OptimizationProfile::default().normalized()
            }
        }
    }

    /// Persisted state, bypassing the cache.
    pub async fn load_state(&self) -> Result<Option<OptimizerState>> {
        with_timeout(self.store_timeout, "loading optimizer state", self.store.load_optimizer_state()).await
    }

    /// Persists `state` and writes its profile through to the cache.
    #[instrument(skip(self, state), fields(source = ?state.profile.source))]
    pub async fn publish(&self, state: &OptimizerState) -> Result<()> {
        with_timeout(
            self.store_timeout,
            "saving optimizer state",
            self.store.save_optimizer_state(state),
        )
        .await?;
        self.cache
            .insert(ACTIVE_KEY.to_string(), state.profile.clone().normalized())
            .await;
        Ok(())
    }

    pub async fn invalidate(&self) {
        self.cache.invalidate(ACTIVE_KEY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::ProfileSource;
    use crate::storage::SqliteStore;
    use chrono::Utc;

    fn create_test_state(min_confluence: f64) -> OptimizerState {
        let mut profile = OptimizationProfile::default();
        profile.source = ProfileSource::Scan;
        profile.quality_gate.min_confluence_score = min_confluence;
        OptimizerState {
            profile,
            scorecard: None,
            scan_range: None,
            training_range: None,
            validation_range: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_default_profile_when_nothing_stored() {
        let store = SqliteStore::in_memory().await.unwrap();
        let accessor = ProfileAccessor::new(store, Duration::from_secs(30), 4, Duration::from_secs(5));

        let profile = accessor.active_profile().await;
        assert_eq!(profile.source, ProfileSource::Default);
        assert_eq!(profile.walk_forward.training_days, 20);
    }

    #[tokio::test]
    async fn test_publish_writes_through_cache() {
        let store = SqliteStore::in_memory().await.unwrap();
        let accessor = ProfileAccessor::new(store.clone(), Duration::from_secs(30), 4, Duration::from_secs(5));

        // warm the cache with the default
        assert_eq!(accessor.active_profile().await.quality_gate.min_confluence_score, 3.0);

        accessor.publish(&create_test_state(5.0)).await.unwrap();
        assert_eq!(accessor.active_profile().await.quality_gate.min_confluence_score, 5.0);

        // a write that bypasses the accessor stays hidden until invalidated
        store.save_optimizer_state(&create_test_state(4.0)).await.unwrap();
        assert_eq!(accessor.active_profile().await.quality_gate.min_confluence_score, 5.0);
        accessor.invalidate().await;
        assert_eq!(accessor.active_profile().await.quality_gate.min_confluence_score, 4.0);
    }
}
