//! Scorecard and human-readable setup recommendations.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use super::candidate::{GateContext, ScanRow, ThresholdCandidate};
use super::gates::{DriftAlert, TriggerRateQuarantine};
use super::metrics::{compute_metrics, evaluate_buckets, OptimizationMetrics, PerformanceBucket};
use super::profile::OptimizationProfile;
use crate::analytics::round_to;
use crate::calendar::window_start;
use crate::types::DateRange;

/// Setup types below this T1 rate are never suggested for enabling.
pub const ADD_SETUP_MIN_T1_PCT: f64 = 58.0;
/// Minimum T1 lower confidence bound for an add suggestion.
pub const ADD_SETUP_MIN_T1_LOWER_BOUND_PCT: f64 = 52.0;
/// Trading days without a triggered trade before a strong type counts as idle.
pub const ADD_SETUP_IDLE_DAYS: u32 = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupActions {
    pub add: Vec<String>,
    pub update: Vec<String>,
    pub remove: Vec<String>,
}

impl SetupActions {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.update.is_empty() && self.remove.is_empty()
    }
}

/// Optimized minus baseline over the validation window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImprovementDeltas {
    pub t1_win_rate_delta: f64,
    pub t2_win_rate_delta: f64,
    pub failure_rate_delta: f64,
    pub objective_delta: f64,
    pub objective_conservative_delta: f64,
    pub expectancy_r_delta: f64,
}

impl ImprovementDeltas {
    pub fn between(baseline: &OptimizationMetrics, optimized: &OptimizationMetrics) -> Self {
        Self {
            t1_win_rate_delta: round_to(optimized.t1_win_rate_pct - baseline.t1_win_rate_pct, 2),
            t2_win_rate_delta: round_to(optimized.t2_win_rate_pct - baseline.t2_win_rate_pct, 2),
            failure_rate_delta: round_to(optimized.failure_rate_pct - baseline.failure_rate_pct, 2),
            objective_delta: round_to(optimized.objective_score - baseline.objective_score, 2),
            objective_conservative_delta: round_to(
                optimized.objective_score_conservative - baseline.objective_score_conservative,
                2,
            ),
            expectancy_r_delta: round_to(optimized.expectancy_r - baseline.expectancy_r, 4),
        }
    }
}

/// Point-in-time report of one optimizer scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scorecard {
    pub generated_at: DateTime<Utc>,
    pub scan_range: DateRange,
    pub training_range: DateRange,
    pub validation_range: DateRange,
    pub baseline: OptimizationMetrics,
    pub optimized: OptimizationMetrics,
    pub improvement: ImprovementDeltas,
    #[serde(default)]
    pub drift_alerts: Vec<DriftAlert>,
    #[serde(default)]
    pub trigger_rate_quarantines: Vec<TriggerRateQuarantine>,
    #[serde(default)]
    pub setup_type_performance: Vec<PerformanceBucket>,
    #[serde(default)]
    pub setup_combo_performance: Vec<PerformanceBucket>,
    #[serde(default)]
    pub setup_actions: SetupActions,
    pub optimization_applied: bool,
    pub has_qualified_training_candidate: bool,
    pub required_validation_trades: u32,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// Inputs for [`build_setup_actions`].
pub struct ActionInputs<'a> {
    pub setup_type_performance: &'a [PerformanceBucket],
    pub setup_combo_performance: &'a [PerformanceBucket],
    pub paused_combos: &'a [String],
    pub drift_alerts: &'a [DriftAlert],
    pub quarantines: &'a [TriggerRateQuarantine],
    pub baseline: &'a ThresholdCandidate,
    pub active: &'a ThresholdCandidate,
    pub profile: &'a OptimizationProfile,
    pub rows: &'a [ScanRow],
    pub to: NaiveDate,
}

fn push_unique(list: &mut Vec<String>, seen: &mut BTreeSet<String>, message: String) {
    if seen.insert(message.clone()) {
        list.push(message);
    }
}

pub fn build_setup_actions(input: &ActionInputs<'_>) -> SetupActions {
    let mut actions = SetupActions::default();
    let mut seen = BTreeSet::new();
    let floor = input.profile.regime_gate.min_t1_win_rate_pct;

    let combos: HashMap<&str, &PerformanceBucket> = input
        .setup_combo_performance
        .iter()
        .map(|bucket| (bucket.key.as_str(), bucket))
        .collect();

    for combo in input.paused_combos {
        let message = match combos.get(combo.as_str()) {
            Some(bucket) => format!(
                "Pause {combo}: T1 {}% (95% CI {}-{}) remains below floor {floor}%.",
                bucket.t1_win_rate_pct, bucket.t1_confidence95.lower_pct, bucket.t1_confidence95.upper_pct
            ),
            None => format!("Pause {combo}: T1 win rate below {floor}% with sufficient sample."),
        };
        push_unique(&mut actions.remove, &mut seen, message);
    }

    for alert in input.drift_alerts {
        push_unique(
            &mut actions.remove,
            &mut seen,
            format!(
                "Pause {}: {}d T1 {}% (95% CI {}-{}) dropped {} pts vs {}d baseline {}% (95% CI {}-{}).",
                alert.setup_type,
                alert.short_window_days,
                alert.short_t1_win_rate_pct,
                alert.short_t1_lower95_pct,
                alert.short_t1_upper95_pct,
                alert.drop_pct,
                alert.long_window_days,
                alert.long_t1_win_rate_pct,
                alert.long_t1_lower95_pct,
                alert.long_t1_upper95_pct,
            ),
        );
    }

    for quarantine in input.quarantines {
        push_unique(
            &mut actions.remove,
            &mut seen,
            format!(
                "Pause {}: trigger rate {}% ({}/{}) over {}d is at or below quarantine floor {}%.",
                quarantine.setup_type,
                quarantine.trigger_rate_pct,
                quarantine.triggered,
                quarantine.opportunities,
                quarantine.window_days,
                quarantine.threshold_pct,
            ),
        );
    }

    let (base, active) = (input.baseline, input.active);
    let update = &mut actions.update;
    if active.min_confluence_score != base.min_confluence_score {
        update.push(format!("Quality gate: set confluence >= {}.", active.min_confluence_score));
    }
    if active.min_p_win_calibrated != base.min_p_win_calibrated {
        update.push(format!("Quality gate: set pWin >= {:.2}.", active.min_p_win_calibrated));
    }
    if active.min_ev_r != base.min_ev_r {
        update.push(format!("Quality gate: set EV(R) >= {:.2}.", active.min_ev_r));
    }
    if active.require_flow_confirmation != base.require_flow_confirmation {
        update.push(format!(
            "Flow gate: require flow confirmation = {}.",
            active.require_flow_confirmation
        ));
    }
    if active.require_flow_confirmation && active.min_alignment_pct != base.min_alignment_pct {
        update.push(format!("Flow gate: set alignment >= {}%.", active.min_alignment_pct));
    }
    if active.require_ema_alignment != base.require_ema_alignment {
        update.push(format!("Indicator gate: require EMA alignment = {}.", active.require_ema_alignment));
    }
    if active.require_volume_regime_alignment != base.require_volume_regime_alignment {
        update.push(format!(
            "Indicator gate: require volume-regime alignment = {}.",
            active.require_volume_regime_alignment
        ));
    }
    if active.enforce_timing_gate != base.enforce_timing_gate {
        update.push(format!(
            "Timing gate: enforce late-session discipline = {}.",
            active.enforce_timing_gate
        ));
    }

    let idle_from = window_start(input.to, ADD_SETUP_IDLE_DAYS);
    for bucket in input.setup_type_performance {
        if bucket.trade_count < input.profile.walk_forward.min_trades
            || bucket.t1_win_rate_pct < ADD_SETUP_MIN_T1_PCT
            || bucket.t1_confidence95.lower_pct < ADD_SETUP_MIN_T1_LOWER_BOUND_PCT
        {
            continue;
        }
        let recently_traded = input
            .rows
            .iter()
            .any(|row| row.triggered && row.setup_type == bucket.key && row.session_date >= idle_from);
        if recently_traded {
            continue;
        }
        push_unique(
            &mut actions.add,
            &mut seen,
            format!(
                "Add/enable {}: strong historical edge ({}% T1, 95% CI {}-{}) but no recent deployment.",
                bucket.key, bucket.t1_win_rate_pct, bucket.t1_confidence95.lower_pct, bucket.t1_confidence95.upper_pct
            ),
        );
    }

    actions
}

/// Scorecard for a profile that has never been through a scan: the active
/// thresholds are both baseline and optimized over the whole range.
pub fn baseline_scorecard(
    rows: &[ScanRow],
    profile: &OptimizationProfile,
    range: DateRange,
    now: DateTime<Utc>,
) -> Scorecard {
    let candidate = ThresholdCandidate::from_profile(profile);
    let context = GateContext::from_profile(profile);
    let weights = &profile.walk_forward.objective_weights;
    let partial = profile.trade_management.partial_at_t1_pct;

    let eligible: Vec<&ScanRow> = rows
        .iter()
        .filter(|row| range.contains(row.session_date) && candidate.admits(row, &context))
        .collect();
    let metrics = compute_metrics(eligible.iter().copied(), weights, partial);
    let setup_type_performance =
        evaluate_buckets(eligible.iter().copied(), |row| row.setup_type.clone(), weights, partial);
    let setup_combo_performance =
        evaluate_buckets(eligible.iter().copied(), |row| row.combo_key.clone(), weights, partial);

    Scorecard {
        generated_at: now,
        scan_range: range,
        training_range: range,
        validation_range: range,
        baseline: metrics.clone(),
        optimized: metrics,
        improvement: ImprovementDeltas::default(),
        drift_alerts: Vec::new(),
        trigger_rate_quarantines: Vec::new(),
        setup_type_performance,
        setup_combo_performance,
        setup_actions: SetupActions {
            update: vec!["Run an optimizer scan to generate a walk-forward scorecard.".to_string()],
            ..SetupActions::default()
        },
        optimization_applied: false,
        has_qualified_training_candidate: false,
        required_validation_trades: profile.walk_forward.min_trades,
        notes: vec!["No optimizer scan has been persisted yet; showing baseline metrics for the active profile.".to_string()],
    }
}
