//! Walk-forward optimizer, regime/drift gates and the active profile.

pub mod accessor;
pub mod candidate;
pub mod gates;
pub mod metrics;
pub mod profile;
pub mod scorecard;
pub mod walk_forward;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::DateRange;

pub use accessor::ProfileAccessor;
pub use candidate::{candidate_grid, GateContext, ScanRow, ThresholdCandidate};
pub use gates::{DriftAlert, GateAction, TriggerRateQuarantine};
pub use metrics::{compute_metrics, OptimizationMetrics, PerformanceBucket};
pub use profile::{OptimizationProfile, ProfileSource};
pub use scorecard::{baseline_scorecard, ImprovementDeltas, Scorecard, SetupActions};
pub use walk_forward::{run_walk_forward, ScanMode, ScanOutcome, ScanWindows};

/// The single persisted optimizer row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizerState {
    pub profile: OptimizationProfile,
    pub scorecard: Option<Scorecard>,
    pub scan_range: Option<DateRange>,
    pub training_range: Option<DateRange>,
    pub validation_range: Option<DateRange>,
    pub updated_at: DateTime<Utc>,
}

impl OptimizerState {
    /// State row for a finished scan.
    pub fn from_scan(outcome: &ScanOutcome, updated_at: DateTime<Utc>) -> Self {
        Self {
            profile: outcome.profile.clone(),
            scorecard: Some(outcome.scorecard.clone()),
            scan_range: Some(outcome.scorecard.scan_range),
            training_range: Some(outcome.scorecard.training_range),
            validation_range: Some(outcome.scorecard.validation_range),
            updated_at,
        }
    }
}
