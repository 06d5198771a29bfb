//! Regime gate, drift control and trigger-rate quarantine.
//!
//! All three only ever add pauses. Lifting a pause is a manual profile edit.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::candidate::ScanRow;
use super::metrics::{compute_metrics, PerformanceBucket};
use super::profile::{OptimizationProfile, RegimeGate};
use crate::analytics::{rate_pct, round_to};
use crate::calendar::window_start;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateAction {
    Pause,
}

/// A setup type whose recent T1 rate fell away from its longer baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftAlert {
    pub setup_type: String,
    pub short_window_days: u32,
    pub long_window_days: u32,
    pub short_trade_count: u32,
    pub long_trade_count: u32,
    pub short_t1_win_rate_pct: f64,
    pub short_t1_lower95_pct: f64,
    pub short_t1_upper95_pct: f64,
    pub long_t1_win_rate_pct: f64,
    pub long_t1_lower95_pct: f64,
    pub long_t1_upper95_pct: f64,
    pub drop_pct: f64,
    /// Long lower bound minus short upper bound; positive when the intervals
    /// no longer overlap.
    pub confidence_drop_pct: f64,
    pub action: GateAction,
}

/// A setup type that rarely triggers once it passes the gates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRateQuarantine {
    pub setup_type: String,
    pub window_days: u32,
    pub opportunities: u32,
    pub triggered: u32,
    pub trigger_rate_pct: f64,
    pub threshold_pct: f64,
    pub action: GateAction,
}

/// Combos with enough trades whose T1 upper confidence bound is below the
/// floor. A low point estimate alone never pauses a combo.
pub fn resolve_paused_combos(combo_buckets: &[PerformanceBucket], gate: &RegimeGate) -> Vec<String> {
    let mut paused: Vec<String> = combo_buckets
        .iter()
        .filter(|bucket| {
            bucket.trade_count >= gate.min_trades_per_combo
                && bucket.t1_confidence95.upper_pct < gate.min_t1_win_rate_pct
        })
        .map(|bucket| bucket.key.clone())
        .collect();
    paused.sort();
    paused
}

/// Compares each setup type's short window against its long window, both
/// ending at `to`. `rows` should already be filtered by the active gates.
///
/// A type is paused only when its T1 rate dropped by at least
/// `max_drop_pct` and the long window's Wilson lower bound sits above the
/// short window's upper bound.
pub fn resolve_drift_alerts(
    rows: &[&ScanRow],
    profile: &OptimizationProfile,
    to: NaiveDate,
) -> Vec<DriftAlert> {
    let drift = &profile.drift_control;
    if !drift.enabled {
        return Vec::new();
    }

    let weights = &profile.walk_forward.objective_weights;
    let partial = profile.trade_management.partial_at_t1_pct;
    let short_from = window_start(to, drift.short_window_days);
    let long_from = window_start(to, drift.long_window_days);
    let min_short_trades = profile.walk_forward.validation_days.max(3);

    let mut by_type: BTreeMap<&str, Vec<&ScanRow>> = BTreeMap::new();
    for row in rows.iter().filter(|r| r.session_date <= to) {
        by_type.entry(row.setup_type.as_str()).or_default().push(*row);
    }

    let mut alerts = Vec::new();
    for (setup_type, type_rows) in by_type {
        let short = compute_metrics(
            type_rows.iter().copied().filter(|r| r.session_date >= short_from),
            weights,
            partial,
        );
        let long = compute_metrics(
            type_rows.iter().copied().filter(|r| r.session_date >= long_from),
            weights,
            partial,
        );
        if long.trade_count < drift.min_long_window_trades || short.trade_count < min_short_trades {
            continue;
        }

        let drop_pct = round_to(long.t1_win_rate_pct - short.t1_win_rate_pct, 2);
        let confidence_drop_pct = round_to(long.t1_confidence95.lower_pct - short.t1_confidence95.upper_pct, 2);
        if drop_pct < drift.max_drop_pct || confidence_drop_pct <= 0.0 {
            continue;
        }

        alerts.push(DriftAlert {
            setup_type: setup_type.to_string(),
            short_window_days: drift.short_window_days,
            long_window_days: drift.long_window_days,
            short_trade_count: short.trade_count,
            long_trade_count: long.trade_count,
            short_t1_win_rate_pct: short.t1_win_rate_pct,
            short_t1_lower95_pct: short.t1_confidence95.lower_pct,
            short_t1_upper95_pct: short.t1_confidence95.upper_pct,
            long_t1_win_rate_pct: long.t1_win_rate_pct,
            long_t1_lower95_pct: long.t1_confidence95.lower_pct,
            long_t1_upper95_pct: long.t1_confidence95.upper_pct,
            drop_pct,
            confidence_drop_pct,
            action: GateAction::Pause,
        });
    }
    alerts
}

/// Setup types whose trigger rate over the trailing window is at or below
/// the floor. `opportunities` are rows passing every gate except the
/// trigger check.
pub fn resolve_trigger_rate_quarantines(
    opportunities: &[&ScanRow],
    profile: &OptimizationProfile,
    to: NaiveDate,
) -> Vec<TriggerRateQuarantine> {
    let drift = &profile.drift_control;
    if !drift.enabled || !drift.auto_quarantine_enabled {
        return Vec::new();
    }

    let from = window_start(to, drift.trigger_rate_window_days);
    let mut counts: BTreeMap<&str, (u32, u32)> = BTreeMap::new();
    for row in opportunities.iter().filter(|r| r.session_date >= from && r.session_date <= to) {
        let entry = counts.entry(row.setup_type.as_str()).or_default();
        entry.0 += 1;
        if row.triggered {
            entry.1 += 1;
        }
    }

    let mut quarantines: Vec<TriggerRateQuarantine> = counts
        .into_iter()
        .filter(|(_, (opportunities, _))| *opportunities >= drift.min_quarantine_opportunities)
        .filter_map(|(setup_type, (opportunities, triggered))| {
            let trigger_rate_pct = rate_pct(triggered, opportunities);
            (trigger_rate_pct <= drift.min_trigger_rate_pct).then(|| TriggerRateQuarantine {
                setup_type: setup_type.to_string(),
                window_days: drift.trigger_rate_window_days,
                opportunities,
                triggered,
                trigger_rate_pct,
                threshold_pct: drift.min_trigger_rate_pct,
                action: GateAction::Pause,
            })
        })
        .collect();

    quarantines.sort_by(|a, b| {
        a.trigger_rate_pct
            .total_cmp(&b.trigger_rate_pct)
            .then_with(|| b.opportunities.cmp(&a.opportunities))
            .then_with(|| a.setup_type.cmp(&b.setup_type))
    });
    quarantines
}
