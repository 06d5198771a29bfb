//! Active optimization profile.
//!
//! Every section deserializes with defaults for missing fields, so profiles
//! written by older builds still load. `normalized()` clamps values into
//! their valid ranges after loading.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::TradeManagement;

/// Latest first-seen minute (since 09:30 ET) for types without an entry.
pub const FULL_SESSION_MINUTES: i64 = 390;
const MIN_TIMING_MINUTE: i64 = 30;

const DEFAULT_TIMING_LIMITS: [(&str, i64); 7] = [
    ("fade_at_wall", 300),
    ("breakout_vacuum", 360),
    ("mean_reversion", 330),
    ("trend_continuation", 390),
    ("orb_breakout", 180),
    ("trend_pullback", 360),
    ("flip_reclaim", 360),
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileSource {
    #[default]
    Default,
    Scan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QualityGate {
    pub min_confluence_score: f64,
    pub min_p_win_calibrated: f64,
    pub min_ev_r: f64,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            min_confluence_score: 3.0,
            min_p_win_calibrated: 0.62,
            min_ev_r: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowGate {
    pub require_flow_confirmation: bool,
    pub min_alignment_pct: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndicatorGate {
    pub require_ema_alignment: bool,
    pub require_volume_regime_alignment: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimingGate {
    pub enabled: bool,
    pub max_first_seen_minute_by_setup_type: BTreeMap<String, i64>,
}

impl Default for TimingGate {
    fn default() -> Self {
        Self {
            enabled: true,
            max_first_seen_minute_by_setup_type: DEFAULT_TIMING_LIMITS
                .iter()
                .map(|(setup_type, minute)| (setup_type.to_string(), *minute))
                .collect(),
        }
    }
}

impl TimingGate {
    /// Latest first-seen minute allowed for `setup_type`.
    pub fn max_first_seen_minute(&self, setup_type: &str) -> i64 {
        self.max_first_seen_minute_by_setup_type
            .get(setup_type)
            .copied()
            .unwrap_or(FULL_SESSION_MINUTES)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegimeGate {
    pub min_trades_per_combo: u32,
    pub min_t1_win_rate_pct: f64,
    /// `setupType|regime` keys excluded from trading.
    pub paused_combos: Vec<String>,
}

impl Default for RegimeGate {
    fn default() -> Self {
        Self {
            min_trades_per_combo: 12,
            min_t1_win_rate_pct: 48.0,
            paused_combos: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectiveWeights {
    pub t1: f64,
    pub t2: f64,
    pub failure_penalty: f64,
    pub expectancy_r: f64,
}

impl Default for ObjectiveWeights {
    fn default() -> Self {
        Self {
            t1: 0.6,
            t2: 0.4,
            failure_penalty: 0.45,
            expectancy_r: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WalkForwardConfig {
    pub training_days: u32,
    pub validation_days: u32,
    pub min_trades: u32,
    pub objective_weights: ObjectiveWeights,
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            training_days: 20,
            validation_days: 5,
            min_trades: 12,
            objective_weights: ObjectiveWeights::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriftControl {
    pub enabled: bool,
    pub short_window_days: u32,
    pub long_window_days: u32,
    pub max_drop_pct: f64,
    pub min_long_window_trades: u32,
    pub auto_quarantine_enabled: bool,
    pub trigger_rate_window_days: u32,
    pub min_quarantine_opportunities: u32,
    pub min_trigger_rate_pct: f64,
    pub paused_setup_types: Vec<String>,
}

impl Default for DriftControl {
    fn default() -> Self {
        Self {
            enabled: true,
            short_window_days: 5,
            long_window_days: 20,
            max_drop_pct: 12.0,
            min_long_window_trades: 20,
            auto_quarantine_enabled: true,
            trigger_rate_window_days: 20,
            min_quarantine_opportunities: 20,
            min_trigger_rate_pct: 3.0,
            paused_setup_types: Vec::new(),
        }
    }
}

/// Gating configuration consumed by the detection engine and the optimizer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptimizationProfile {
    pub source: ProfileSource,
    pub generated_at: DateTime<Utc>,
    pub quality_gate: QualityGate,
    pub flow_gate: FlowGate,
    pub indicator_gate: IndicatorGate,
    pub timing_gate: TimingGate,
    pub regime_gate: RegimeGate,
    pub trade_management: TradeManagement,
    pub walk_forward: WalkForwardConfig,
    pub drift_control: DriftControl,
}

fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

fn clean_keys(keys: &mut Vec<String>) {
    keys.retain(|k| !k.trim().is_empty());
    keys.sort();
    keys.dedup();
}

impl OptimizationProfile {
    /// Trading days covered by one walk-forward scan.
    pub fn history_days(&self) -> u32 {
        self.walk_forward.training_days + self.walk_forward.validation_days
    }

    pub fn is_setup_type_paused(&self, setup_type: &str) -> bool {
        self.drift_control.paused_setup_types.iter().any(|t| t == setup_type)
    }

    pub fn is_combo_paused(&self, combo_key: &str) -> bool {
        self.regime_gate.paused_combos.iter().any(|c| c == combo_key)
    }

    /// Clamps every field into its valid range.
    pub fn normalized(mut self) -> Self {
        let defaults = OptimizationProfile::default();

        let quality = &mut self.quality_gate;
        quality.min_confluence_score =
            finite_or(quality.min_confluence_score, defaults.quality_gate.min_confluence_score).max(0.0);
        quality.min_p_win_calibrated =
            finite_or(quality.min_p_win_calibrated, defaults.quality_gate.min_p_win_calibrated).clamp(0.0, 1.0);
        quality.min_ev_r = finite_or(quality.min_ev_r, defaults.quality_gate.min_ev_r);

        self.flow_gate.min_alignment_pct = finite_or(self.flow_gate.min_alignment_pct, 0.0).clamp(0.0, 100.0);

        for minute in self.timing_gate.max_first_seen_minute_by_setup_type.values_mut() {
            *minute = (*minute).clamp(MIN_TIMING_MINUTE, FULL_SESSION_MINUTES);
        }

        let regime = &mut self.regime_gate;
        regime.min_trades_per_combo = regime.min_trades_per_combo.max(1);
        regime.min_t1_win_rate_pct =
            finite_or(regime.min_t1_win_rate_pct, defaults.regime_gate.min_t1_win_rate_pct).clamp(0.0, 100.0);
        clean_keys(&mut regime.paused_combos);

        self.trade_management.partial_at_t1_pct = finite_or(
            self.trade_management.partial_at_t1_pct,
            defaults.trade_management.partial_at_t1_pct,
        )
        .clamp(0.1, 0.9);

        let walk = &mut self.walk_forward;
        walk.training_days = walk.training_days.max(5);
        walk.validation_days = walk.validation_days.max(3);
        walk.min_trades = walk.min_trades.max(5);
        let weights = &mut walk.objective_weights;
        let default_weights = defaults.walk_forward.objective_weights;
        weights.t1 = finite_or(weights.t1, default_weights.t1).max(0.0);
        weights.t2 = finite_or(weights.t2, default_weights.t2).max(0.0);
        weights.failure_penalty = finite_or(weights.failure_penalty, default_weights.failure_penalty).max(0.0);
        weights.expectancy_r = finite_or(weights.expectancy_r, default_weights.expectancy_r).max(0.0);

        let drift = &mut self.drift_control;
        drift.short_window_days = drift.short_window_days.max(3);
        drift.long_window_days = drift.long_window_days.max(10).max(drift.short_window_days + 1);
        drift.max_drop_pct = finite_or(drift.max_drop_pct, defaults.drift_control.max_drop_pct).clamp(0.0, 100.0);
        drift.min_long_window_trades = drift.min_long_window_trades.max(10);
        drift.trigger_rate_window_days = drift.trigger_rate_window_days.max(5);
        drift.min_quarantine_opportunities = drift.min_quarantine_opportunities.max(5);
        drift.min_trigger_rate_pct =
            finite_or(drift.min_trigger_rate_pct, defaults.drift_control.min_trigger_rate_pct).clamp(0.0, 100.0);
        clean_keys(&mut drift.paused_setup_types);

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profile() {
        let profile = OptimizationProfile::default();
        assert_eq!(profile.source, ProfileSource::Default);
        assert_eq!(profile.quality_gate.min_confluence_score, 3.0);
        assert_eq!(profile.quality_gate.min_p_win_calibrated, 0.62);
        assert!(!profile.flow_gate.require_flow_confirmation);
        assert!(profile.timing_gate.enabled);
        assert_eq!(profile.timing_gate.max_first_seen_minute("orb_breakout"), 180);
        assert_eq!(profile.timing_gate.max_first_seen_minute("new_type"), FULL_SESSION_MINUTES);
        assert_eq!(profile.regime_gate.min_trades_per_combo, 12);
        assert_eq!(profile.trade_management.partial_at_t1_pct, 0.65);
        assert_eq!(profile.walk_forward.objective_weights.failure_penalty, 0.45);
        assert_eq!(profile.history_days(), 25);
        assert!(profile.drift_control.paused_setup_types.is_empty());
    }

    #[test]
    fn test_partial_profile_deserializes_with_defaults() {
        let raw = serde_json::json!({
            "source": "scan",
            "qualityGate": { "minConfluenceScore": 4, "actionableStatuses": ["ready", "ready", "triggered"] },
            "regimeGate": { "pausedCombos": ["fade_at_wall|ranging"] },
            "futureSection": { "x": 1 }
        });

        let profile: OptimizationProfile = serde_json::from_value(raw).unwrap();
        assert_eq!(profile.source, ProfileSource::Scan);
        assert_eq!(profile.quality_gate.min_confluence_score, 4.0);
        assert_eq!(profile.quality_gate.min_ev_r, 0.2);
        assert!(profile.is_combo_paused("fade_at_wall|ranging"));
        assert_eq!(profile.walk_forward.training_days, 20);

        // detector-only keys are ignored and not written back
        let written = serde_json::to_value(&profile.quality_gate).unwrap();
        assert!(written.get("actionableStatuses").is_none());
    }

    #[test]
    fn test_normalization_clamps() {
        let mut profile = OptimizationProfile::default();
        profile.walk_forward.training_days = 1;
        profile.walk_forward.validation_days = 0;
        profile.walk_forward.min_trades = 2;
        profile.drift_control.short_window_days = 12;
        profile.drift_control.long_window_days = 4;
        profile.trade_management.partial_at_t1_pct = 1.5;
        profile.quality_gate.min_p_win_calibrated = f64::NAN;
        profile.timing_gate
            .max_first_seen_minute_by_setup_type
            .insert("orb_breakout".to_string(), 5);
        profile.drift_control.paused_setup_types =
            vec!["b".to_string(), "".to_string(), "a".to_string(), "b".to_string()];

        let profile = profile.normalized();
        assert_eq!(profile.walk_forward.training_days, 5);
        assert_eq!(profile.walk_forward.validation_days, 3);
        assert_eq!(profile.walk_forward.min_trades, 5);
        assert_eq!(profile.drift_control.long_window_days, 13);
        assert_eq!(profile.trade_management.partial_at_t1_pct, 0.9);
        assert_eq!(profile.quality_gate.min_p_win_calibrated, 0.62);
        assert_eq!(profile.timing_gate.max_first_seen_minute("orb_breakout"), 30);
        assert_eq!(profile.drift_control.paused_setup_types, vec!["a", "b"]);
    }
}
