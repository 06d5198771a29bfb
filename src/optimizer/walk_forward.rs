//! Walk-forward scan.
//!
//! Searches the candidate grid on the training window, re-scores the winner
//! and the current thresholds on the trailing validation window and only
//! promotes the winner when it holds up out of sample. Regime, drift and
//! quarantine pauses are then derived from the thresholds that end up
//! active. Everything here is pure over the loaded rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

use super::candidate::{candidate_grid, GateContext, ScanRow, ThresholdCandidate};
use super::gates::{resolve_drift_alerts, resolve_paused_combos, resolve_trigger_rate_quarantines};
use super::metrics::{compute_metrics, evaluate_buckets, OptimizationMetrics};
use super::profile::{OptimizationProfile, ProfileSource, WalkForwardConfig};
use super::scorecard::{build_setup_actions, ActionInputs, ImprovementDeltas, Scorecard};
use crate::calendar::{previous_trading_day, window_start};
use crate::error::ValidationError;
use crate::types::DateRange;

pub const WEEKLY_AUTO_MIN_VALIDATION_TRADES: u32 = 12;
pub const WEEKLY_AUTO_MIN_OBJECTIVE_DELTA: f64 = 0.5;
pub const WEEKLY_AUTO_MAX_T2_DROP_PCT: f64 = 2.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    #[default]
    Manual,
    WeeklyAuto,
}

impl ScanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanMode::Manual => "manual",
            ScanMode::WeeklyAuto => "weekly_auto",
        }
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(ScanMode::Manual),
            "weekly_auto" => Ok(ScanMode::WeeklyAuto),
            other => Err(ValidationError::UnknownValue {
                field: "mode",
                value: other.to_string(),
            }),
        }
    }
}

/// Training and validation windows, both ending at the scan's `to` date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanWindows {
    pub scan: DateRange,
    pub training: DateRange,
    pub validation: DateRange,
}

impl ScanWindows {
    pub fn new(scan: DateRange, walk_forward: &WalkForwardConfig) -> Self {
        let validation = DateRange {
            from: window_start(scan.to, walk_forward.validation_days),
            to: scan.to,
        };
        let training_to = previous_trading_day(validation.from);
        let training = DateRange {
            from: window_start(training_to, walk_forward.training_days),
            to: training_to,
        };
        Self {
            scan,
            training,
            validation,
        }
    }

    /// Session dates the scan needs rows for.
    pub fn load_range(&self) -> DateRange {
        DateRange {
            from: self.training.from,
            to: self.validation.to,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanOutcome {
    pub profile: OptimizationProfile,
    pub scorecard: Scorecard,
}

/// Whether the validation window supports replacing the baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct PromotionDecision {
    pub applied: bool,
    pub required_validation_trades: u32,
    /// Why the proposal was rejected, if it was.
    pub rejection: Option<String>,
}

pub fn evaluate_promotion(
    baseline: &OptimizationMetrics,
    optimized: &OptimizationMetrics,
    walk_forward: &WalkForwardConfig,
    mode: ScanMode,
    has_qualified_training_candidate: bool,
) -> PromotionDecision {
    let base_required = if baseline.trade_count >= walk_forward.min_trades {
        walk_forward.min_trades
    } else {
        walk_forward.validation_days.clamp(3, 8)
    };
    let required_validation_trades = match mode {
        ScanMode::WeeklyAuto => base_required.max(WEEKLY_AUTO_MIN_VALIDATION_TRADES),
        ScanMode::Manual => base_required,
    };
    let deltas = ImprovementDeltas::between(baseline, optimized);
    let baseline_empty = baseline.trade_count == 0;

    let rejection = if !has_qualified_training_candidate {
        Some(format!(
            "No training candidate reached {} trades; baseline retained.",
            walk_forward.min_trades
        ))
    } else if optimized.trade_count < required_validation_trades {
        Some(format!(
            "Validation trades {} below required {}; baseline retained.",
            optimized.trade_count, required_validation_trades
        ))
    } else if !(optimized.objective_score > baseline.objective_score
        || (baseline_empty && optimized.objective_score > 0.0))
    {
        Some(format!(
            "Validation objective {} did not beat baseline {}; baseline retained.",
            optimized.objective_score, baseline.objective_score
        ))
    } else if !baseline_empty && optimized.objective_score_conservative < baseline.objective_score_conservative {
        Some(format!(
            "Conservative validation objective {} fell below baseline {}; baseline retained.",
            optimized.objective_score_conservative, baseline.objective_score_conservative
        ))
    } else if mode == ScanMode::WeeklyAuto
        && (deltas.objective_delta < WEEKLY_AUTO_MIN_OBJECTIVE_DELTA
            || deltas.t1_win_rate_delta < 0.0
            || deltas.t2_win_rate_delta < -WEEKLY_AUTO_MAX_T2_DROP_PCT)
    {
        Some(format!(
            "Weekly auto guardrails failed (objective delta {}, T1 delta {}, T2 delta {}); baseline retained.",
            deltas.objective_delta, deltas.t1_win_rate_delta, deltas.t2_win_rate_delta
        ))
    } else {
        None
    };

    PromotionDecision {
        applied: rejection.is_none(),
        required_validation_trades,
        rejection,
    }
}

/// Best grid candidate on the training rows by headline objective. Ties keep
/// the incumbent. Returns the baseline and `false` when nothing reaches the
/// minimum trade count.
fn search_training(
    training: &[&ScanRow],
    baseline: ThresholdCandidate,
    profile: &OptimizationProfile,
    context: &GateContext<'_>,
) -> (ThresholdCandidate, bool) {
    let weights = &profile.walk_forward.objective_weights;
    let partial = profile.trade_management.partial_at_t1_pct;
    let min_trades = profile.walk_forward.min_trades;

    let score = |candidate: &ThresholdCandidate| {
        compute_metrics(
            training.iter().copied().filter(|row| candidate.admits(row, context)),
            weights,
            partial,
        )
    };

    let mut best = baseline;
    let mut best_metrics = score(&baseline);
    let mut qualified = best_metrics.trade_count >= min_trades;

    for candidate in candidate_grid() {
        let metrics = score(&candidate);
        if metrics.trade_count < min_trades {
            continue;
        }
        if qualified && metrics.objective_score <= best_metrics.objective_score {
            continue;
        }
        debug!(
            objective = metrics.objective_score,
            trades = metrics.trade_count,
            "New best training candidate"
        );
        best = candidate;
        best_metrics = metrics;
        qualified = true;
    }

    (best, qualified)
}

/// Runs one walk-forward scan over `rows`, which should cover
/// [`ScanWindows::load_range`]. `profile` is expected to be normalized.
pub fn run_walk_forward(
    rows: &[ScanRow],
    profile: &OptimizationProfile,
    windows: ScanWindows,
    mode: ScanMode,
    now: DateTime<Utc>,
) -> ScanOutcome {
    let weights = &profile.walk_forward.objective_weights;
    let partial = profile.trade_management.partial_at_t1_pct;
    let context = GateContext::from_profile(profile);

    let in_load_range: Vec<&ScanRow> = rows
        .iter()
        .filter(|row| windows.load_range().contains(row.session_date))
        .collect();
    let training: Vec<&ScanRow> = in_load_range
        .iter()
        .copied()
        .filter(|row| windows.training.contains(row.session_date))
        .collect();
    let validation: Vec<&ScanRow> = in_load_range
        .iter()
        .copied()
        .filter(|row| windows.validation.contains(row.session_date))
        .collect();

    let baseline = ThresholdCandidate::from_profile(profile);
    let (best, has_qualified_training_candidate) = search_training(&training, baseline, profile, &context);

    let validate = |candidate: &ThresholdCandidate| {
        compute_metrics(
            validation.iter().copied().filter(|row| candidate.admits(row, &context)),
            weights,
            partial,
        )
    };
    let baseline_metrics = validate(&baseline);
    let optimized_metrics = validate(&best);

    let decision = evaluate_promotion(
        &baseline_metrics,
        &optimized_metrics,
        &profile.walk_forward,
        mode,
        has_qualified_training_candidate,
    );
    let active = if decision.applied { best } else { baseline };

    let active_rows: Vec<&ScanRow> = in_load_range
        .iter()
        .copied()
        .filter(|row| active.admits(row, &context))
        .collect();
    let setup_type_performance =
        evaluate_buckets(active_rows.iter().copied(), |row| row.setup_type.clone(), weights, partial);
    let setup_combo_performance =
        evaluate_buckets(active_rows.iter().copied(), |row| row.combo_key.clone(), weights, partial);

    let newly_paused = resolve_paused_combos(&setup_combo_performance, &profile.regime_gate);
    let mut paused_combos: Vec<String> = newly_paused
        .iter()
        .chain(profile.regime_gate.paused_combos.iter())
        .cloned()
        .collect();
    paused_combos.sort();
    paused_combos.dedup();

    let gated = GateContext::from_profile(profile).with_paused_combos(newly_paused.iter().cloned());
    let drift_rows: Vec<&ScanRow> = in_load_range
        .iter()
        .copied()
        .filter(|row| active.admits(row, &gated))
        .collect();
    let opportunity_rows: Vec<&ScanRow> = in_load_range
        .iter()
        .copied()
        .filter(|row| active.admits_opportunity(row, &gated))
        .collect();
    let drift_alerts = resolve_drift_alerts(&drift_rows, profile, windows.validation.to);
    let trigger_rate_quarantines =
        resolve_trigger_rate_quarantines(&opportunity_rows, profile, windows.validation.to);

    let mut paused_setup_types: Vec<String> = profile
        .drift_control
        .paused_setup_types
        .iter()
        .cloned()
        .chain(drift_alerts.iter().map(|alert| alert.setup_type.clone()))
        .chain(trigger_rate_quarantines.iter().map(|q| q.setup_type.clone()))
        .collect();
    paused_setup_types.sort();
    paused_setup_types.dedup();

    let mut next = profile.clone();
    active.apply_to(&mut next);
    next.source = ProfileSource::Scan;
    next.generated_at = now;
    next.regime_gate.paused_combos = paused_combos.clone();
    next.drift_control.paused_setup_types = paused_setup_types.clone();

    let owned_rows: Vec<ScanRow> = in_load_range.iter().map(|row| (*row).clone()).collect();
    let setup_actions = build_setup_actions(&ActionInputs {
        setup_type_performance: &setup_type_performance,
        setup_combo_performance: &setup_combo_performance,
        paused_combos: &paused_combos,
        drift_alerts: &drift_alerts,
        quarantines: &trigger_rate_quarantines,
        baseline: &baseline,
        active: &active,
        profile,
        rows: &owned_rows,
        to: windows.validation.to,
    });

    let improvement = ImprovementDeltas::between(&baseline_metrics, &optimized_metrics);
    let mut notes = vec![match &decision.rejection {
        None => format!(
            "Walk-forward optimization applied to active profile (validation trades={}, minimum required={}).",
            optimized_metrics.trade_count, decision.required_validation_trades
        ),
        Some(reason) => reason.clone(),
    }];
    notes.push(match mode {
        ScanMode::WeeklyAuto => format!(
            "Weekly auto guardrails: objective delta >= {WEEKLY_AUTO_MIN_OBJECTIVE_DELTA}, T1 delta >= 0, T2 delta >= -{WEEKLY_AUTO_MAX_T2_DROP_PCT}, validation trades >= {}.",
            decision.required_validation_trades
        ),
        ScanMode::Manual => "Weekly auto guardrails not enforced for this scan mode.".to_string(),
    });
    notes.push(format!(
        "Validation objective: baseline {} (conservative {}) vs optimized {} (conservative {}).",
        baseline_metrics.objective_score,
        baseline_metrics.objective_score_conservative,
        optimized_metrics.objective_score,
        optimized_metrics.objective_score_conservative
    ));
    notes.push(format!(
        "Validation expectancy(R): baseline {} (lower bound {}) vs optimized {} (lower bound {}).",
        baseline_metrics.expectancy_r,
        baseline_metrics.expectancy_lower_bound_r,
        optimized_metrics.expectancy_r,
        optimized_metrics.expectancy_lower_bound_r
    ));
    notes.push(format!(
        "Drift control paused {} setup types and trigger-rate quarantine paused {}; total paused setup types={}.",
        drift_alerts.len(),
        trigger_rate_quarantines.len(),
        paused_setup_types.len()
    ));
    notes.push(format!(
        "Regime gate paused {} new setup/regime combos; total paused combos={}.",
        newly_paused.len(),
        paused_combos.len()
    ));

    info!(
        mode = %mode,
        applied = decision.applied,
        qualified = has_qualified_training_candidate,
        training_rows = training.len(),
        validation_rows = validation.len(),
        paused_combos = paused_combos.len(),
        paused_setup_types = paused_setup_types.len(),
        "Walk-forward scan finished"
    );

    let scorecard = Scorecard {
        generated_at: now,
        scan_range: windows.scan,
        training_range: windows.training,
        validation_range: windows.validation,
        baseline: baseline_metrics,
        optimized: optimized_metrics,
        improvement,
        drift_alerts,
        trigger_rate_quarantines,
        setup_type_performance,
        setup_combo_performance,
        setup_actions,
        optimization_applied: decision.applied,
        has_qualified_training_candidate,
        required_validation_trades: decision.required_validation_trades,
        notes,
    };

    ScanOutcome {
        profile: next,
        scorecard,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::candidate::tests::create_scan_row;
    use crate::types::FinalOutcome;
    use chrono::NaiveDate;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    fn scan_windows(profile: &OptimizationProfile) -> ScanWindows {
        ScanWindows::new(
            DateRange {
                from: date(2),
                to: date(31),
            },
            &profile.walk_forward,
        )
    }

    /// Rows on the given days, every third one a stop, with a pWin the
    /// default profile rejects.
    fn rows_below_baseline_pwin(prefix: &str, days: &[u32]) -> Vec<ScanRow> {
        days.iter()
            .enumerate()
            .map(|(i, d)| {
                let outcome = if i % 3 == 2 {
                    FinalOutcome::StopBeforeT1
                } else {
                    FinalOutcome::T1BeforeStop
                };
                let mut row = create_scan_row(&format!("{prefix}-{i}"), date(*d), Some(outcome));
                row.p_win_calibrated = Some(0.60);
                row
            })
            .collect()
    }

    #[test]
    fn test_scan_windows() {
        let windows = scan_windows(&OptimizationProfile::default());
        assert_eq!(windows.validation, DateRange { from: date(25), to: date(31) });
        assert_eq!(windows.training.to, date(24));
        assert_eq!(windows.training.from, NaiveDate::from_ymd_opt(2026, 2, 25).unwrap());
        assert_eq!(windows.load_range().from, windows.training.from);
    }

    #[test]
    fn test_scan_mode_parse() {
        assert_eq!("weekly_auto".parse::<ScanMode>().unwrap(), ScanMode::WeeklyAuto);
        assert_eq!("manual".parse::<ScanMode>().unwrap(), ScanMode::Manual);
        assert!("hourly".parse::<ScanMode>().is_err());
    }

    #[test]
    fn test_no_qualified_candidate_keeps_baseline() {
        let profile = OptimizationProfile::default();
        let rows = vec![
            create_scan_row("s-1", date(10), Some(FinalOutcome::T1BeforeStop)),
            create_scan_row("s-2", date(11), Some(FinalOutcome::T1BeforeStop)),
            create_scan_row("s-3", date(12), Some(FinalOutcome::StopBeforeT1)),
            create_scan_row("s-4", date(26), Some(FinalOutcome::T1BeforeStop)),
        ];

        let outcome = run_walk_forward(&rows, &profile, scan_windows(&profile), ScanMode::Manual, Utc::now());
        let scorecard = &outcome.scorecard;
        assert!(!scorecard.has_qualified_training_candidate);
        assert!(!scorecard.optimization_applied);
        assert_eq!(scorecard.baseline, scorecard.optimized);
        assert!(scorecard.notes[0].starts_with("No training candidate reached 12 trades"));
        assert_eq!(outcome.profile.source, ProfileSource::Scan);
        assert_eq!(outcome.profile.quality_gate, profile.quality_gate);
    }

    #[test]
    fn test_promotes_when_baseline_has_no_validation_trades() {
        let profile = OptimizationProfile::default();
        let mut rows = rows_below_baseline_pwin("train", &[2, 3, 4, 5, 6, 9, 10, 11, 12, 13, 16, 17, 18, 19, 20]);
        rows.extend(rows_below_baseline_pwin("valid", &[25, 26, 27, 30, 31, 31]));

        let outcome = run_walk_forward(&rows, &profile, scan_windows(&profile), ScanMode::Manual, Utc::now());
        let scorecard = &outcome.scorecard;
        assert!(scorecard.has_qualified_training_candidate);
        assert_eq!(scorecard.baseline.trade_count, 0);
        assert_eq!(scorecard.required_validation_trades, 5);
        assert_eq!(scorecard.optimized.trade_count, 6);
        assert!(scorecard.optimized.objective_score > 0.0);
        assert!(scorecard.optimization_applied);
        assert!(outcome.profile.quality_gate.min_p_win_calibrated <= 0.60);
        assert!(scorecard.setup_actions.update.iter().any(|a| a.starts_with("Quality gate: set pWin")));
        assert!(scorecard.drift_alerts.is_empty());
    }

    #[test]
    fn test_weekly_auto_raises_validation_floor() {
        let profile = OptimizationProfile::default();
        let mut rows = rows_below_baseline_pwin("train", &[2, 3, 4, 5, 6, 9, 10, 11, 12, 13, 16, 17, 18, 19, 20]);
        rows.extend(rows_below_baseline_pwin("valid", &[25, 26, 27, 30, 31, 31]));

        let outcome = run_walk_forward(&rows, &profile, scan_windows(&profile), ScanMode::WeeklyAuto, Utc::now());
        assert_eq!(outcome.scorecard.required_validation_trades, 12);
        assert!(!outcome.scorecard.optimization_applied);
        assert_eq!(outcome.profile.quality_gate.min_p_win_calibrated, 0.62);
        assert!(outcome.scorecard.notes[0].starts_with("Validation trades 6 below required 12"));
    }

    #[test]
    fn test_existing_pauses_survive_scan() {
        let mut profile = OptimizationProfile::default();
        profile.regime_gate.paused_combos = vec!["orb_breakout|trending".to_string()];
        profile.drift_control.paused_setup_types = vec!["flip_reclaim".to_string()];

        let outcome = run_walk_forward(&[], &profile, scan_windows(&profile), ScanMode::Manual, Utc::now());
        assert_eq!(outcome.profile.regime_gate.paused_combos, vec!["orb_breakout|trending"]);
        assert_eq!(outcome.profile.drift_control.paused_setup_types, vec!["flip_reclaim"]);
        assert!(outcome.scorecard.setup_actions.remove[0].starts_with("Pause orb_breakout|trending"));
    }

    #[test]
    fn test_promotion_conservative_check() {
        let walk = WalkForwardConfig::default();
        let baseline = OptimizationMetrics {
            trade_count: 14,
            objective_score: 20.0,
            objective_score_conservative: 5.0,
            ..OptimizationMetrics::default()
        };
        let optimized = OptimizationMetrics {
            trade_count: 13,
            objective_score: 25.0,
            objective_score_conservative: 4.0,
            ..OptimizationMetrics::default()
        };

        let decision = evaluate_promotion(&baseline, &optimized, &walk, ScanMode::Manual, true);
        assert_eq!(decision.required_validation_trades, 12);
        assert!(!decision.applied);
        assert!(decision.rejection.unwrap().starts_with("Conservative validation objective"));

        let optimized = OptimizationMetrics {
            objective_score_conservative: 6.0,
            ..optimized
        };
        assert!(evaluate_promotion(&baseline, &optimized, &walk, ScanMode::Manual, true).applied);
    }
}
