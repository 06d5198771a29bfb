//! Threshold candidates, the search grid and the gating predicate.

use chrono::NaiveDate;
use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::profile::{OptimizationProfile, TimingGate};
use crate::analytics::round_to;
use crate::calendar::session_minute;
use crate::types::{bucket_key, FinalOutcome, GateStatus, OutcomeRow, SetupInstance, SetupKey};

pub const CONFLUENCE_GRID: [f64; 3] = [3.0, 4.0, 5.0];
pub const P_WIN_GRID: [f64; 3] = [0.58, 0.60, 0.62];
pub const EV_R_GRID: [f64; 3] = [0.20, 0.25, 0.30];
pub const ALIGNMENT_GRID: [f64; 3] = [50.0, 55.0, 60.0];

/// Floor on initial risk, in points, when converting targets to R.
pub const MIN_RISK_POINTS: f64 = 0.25;

/// One point in the gating-threshold search space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdCandidate {
    pub min_confluence_score: f64,
    pub min_p_win_calibrated: f64,
    pub min_ev_r: f64,
    pub require_flow_confirmation: bool,
    pub min_alignment_pct: f64,
    pub require_ema_alignment: bool,
    pub require_volume_regime_alignment: bool,
    pub enforce_timing_gate: bool,
}

impl ThresholdCandidate {
    /// Candidate matching the profile's current gates.
    pub fn from_profile(profile: &OptimizationProfile) -> Self {
        Self {
            min_confluence_score: profile.quality_gate.min_confluence_score,
            min_p_win_calibrated: profile.quality_gate.min_p_win_calibrated,
            min_ev_r: profile.quality_gate.min_ev_r,
            require_flow_confirmation: profile.flow_gate.require_flow_confirmation,
            min_alignment_pct: profile.flow_gate.min_alignment_pct,
            require_ema_alignment: profile.indicator_gate.require_ema_alignment,
            require_volume_regime_alignment: profile.indicator_gate.require_volume_regime_alignment,
            enforce_timing_gate: profile.timing_gate.enabled,
        }
    }

    /// Writes this candidate's thresholds into `profile`.
    pub fn apply_to(&self, profile: &mut OptimizationProfile) {
        profile.quality_gate.min_confluence_score = self.min_confluence_score;
        profile.quality_gate.min_p_win_calibrated = self.min_p_win_calibrated;
        profile.quality_gate.min_ev_r = self.min_ev_r;
        profile.flow_gate.require_flow_confirmation = self.require_flow_confirmation;
        profile.flow_gate.min_alignment_pct = self.min_alignment_pct;
        profile.indicator_gate.require_ema_alignment = self.require_ema_alignment;
        profile.indicator_gate.require_volume_regime_alignment = self.require_volume_regime_alignment;
        profile.timing_gate.enabled = self.enforce_timing_gate;
    }

    /// Row passes every gate of this candidate and was triggered.
    pub fn admits(&self, row: &ScanRow, context: &GateContext<'_>) -> bool {
        row.triggered && self.admits_opportunity(row, context)
    }

    /// Row passes every gate of this candidate, triggered or not.
    pub fn admits_opportunity(&self, row: &ScanRow, context: &GateContext<'_>) -> bool {
        if row.hidden_tier || row.gate_status == Some(GateStatus::Blocked) {
            return false;
        }
        if context.paused_setup_types.contains(&row.setup_type) || context.paused_combos.contains(&row.combo_key) {
            return false;
        }
        if self.enforce_timing_gate {
            if let Some(minute) = row.first_seen_minute {
                if minute > context.timing.max_first_seen_minute(&row.setup_type) {
                    return false;
                }
            }
        }

        if row.confluence_score.unwrap_or(-1.0) < self.min_confluence_score {
            return false;
        }
        if row.p_win_calibrated.unwrap_or(-1.0) < self.min_p_win_calibrated {
            return false;
        }
        if row.ev_r.unwrap_or(f64::NEG_INFINITY) < self.min_ev_r {
            return false;
        }

        if self.require_flow_confirmation
            && (!row.flow_confirmed || row.flow_alignment_pct.unwrap_or(-1.0) < self.min_alignment_pct)
        {
            return false;
        }
        if self.require_ema_alignment && !row.ema_aligned {
            return false;
        }
        if self.require_volume_regime_alignment && !row.volume_regime_aligned {
            return false;
        }

        true
    }
}

/// Every candidate of the search grid, generated once in a fixed order.
///
/// The alignment floor only varies when flow confirmation is required.
pub fn candidate_grid() -> NonEmpty<ThresholdCandidate> {
    let flow_options: Vec<(bool, f64)> = ALIGNMENT_GRID
        .iter()
        .map(|pct| (true, *pct))
        .chain(std::iter::once((false, 0.0)))
        .collect();

    let mut candidates = Vec::new();
    for min_confluence_score in CONFLUENCE_GRID {
        for min_p_win_calibrated in P_WIN_GRID {
            for min_ev_r in EV_R_GRID {
                for &(require_flow_confirmation, min_alignment_pct) in &flow_options {
                    for require_ema_alignment in [false, true] {
                        for require_volume_regime_alignment in [false, true] {
                            for enforce_timing_gate in [true, false] {
                                candidates.push(ThresholdCandidate {
                                    min_confluence_score,
                                    min_p_win_calibrated,
                                    min_ev_r,
                                    require_flow_confirmation,
                                    min_alignment_pct,
                                    require_ema_alignment,
                                    require_volume_regime_alignment,
                                    enforce_timing_gate,
                                });
                            }
                        }
                    }
                }
            }
        }
    }

    let head = candidates.remove(0);
    NonEmpty::from((head, candidates))
}

/// Exclusions shared by every candidate in one scan.
pub struct GateContext<'a> {
    pub paused_setup_types: HashSet<String>,
    pub paused_combos: HashSet<String>,
    pub timing: &'a TimingGate,
}

impl<'a> GateContext<'a> {
    pub fn from_profile(profile: &'a OptimizationProfile) -> Self {
        Self {
            paused_setup_types: profile.drift_control.paused_setup_types.iter().cloned().collect(),
            paused_combos: profile.regime_gate.paused_combos.iter().cloned().collect(),
            timing: &profile.timing_gate,
        }
    }

    pub fn with_paused_combos<I>(mut self, combos: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.paused_combos.extend(combos);
        self
    }
}

/// Flattened setup row the optimizer filters and scores.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRow {
    pub key: SetupKey,
    pub session_date: NaiveDate,
    pub setup_type: String,
    pub combo_key: String,
    pub hidden_tier: bool,
    pub gate_status: Option<GateStatus>,
    pub first_seen_minute: Option<i64>,
    pub triggered: bool,
    pub final_outcome: Option<FinalOutcome>,
    pub stop_hit: bool,
    pub p_win_calibrated: Option<f64>,
    pub ev_r: Option<f64>,
    pub target1_r: Option<f64>,
    pub target2_r: Option<f64>,
    pub move_stop_to_breakeven: bool,
    pub confluence_score: Option<f64>,
    pub flow_alignment_pct: Option<f64>,
    pub flow_confirmed: bool,
    pub ema_aligned: bool,
    pub volume_regime_aligned: bool,
}

impl ScanRow {
    /// Builds a row from a stored setup, letting a fresh backtest verdict
    /// replace the stored trigger, outcome, stop and fill fields.
    pub fn from_setup(setup: &SetupInstance, replay: Option<&OutcomeRow>) -> Self {
        let (triggered_at, final_outcome, stop_hit_at, entry_fill_price) = match replay {
            Some(row) => (row.triggered_at, row.final_outcome, row.stop_hit_at, row.entry_fill_price),
            None => (
                setup.triggered_at,
                setup.final_outcome,
                setup.stop_hit_at,
                setup.entry_fill_price,
            ),
        };

        let entry = entry_fill_price
            .filter(|p| p.is_finite())
            .unwrap_or_else(|| setup.entry_zone.mid());
        let (target1_r, target2_r) = if entry.is_finite() && setup.stop_price.is_finite() && setup.target1_price.is_finite() {
            let risk = (entry - setup.stop_price).abs().max(MIN_RISK_POINTS);
            let t1 = (setup.target1_price - entry).abs() / risk;
            let t2 = setup
                .target2_price
                .filter(|p| p.is_finite())
                .map(|p| (p - entry).abs() / risk)
                .unwrap_or(t1);
            (Some(round_to(t1, 4)), Some(round_to(t2, 4)))
        } else {
            (None, None)
        };

        let metadata = &setup.metadata;
        Self {
            key: setup.key(),
            session_date: setup.session_date,
            setup_type: bucket_key(Some(&setup.setup_type)),
            combo_key: setup.combo_key(),
            hidden_tier: setup.is_hidden_tier(),
            gate_status: setup.gate_status(),
            first_seen_minute: setup.first_seen_at.map(session_minute),
            triggered: triggered_at.is_some(),
            final_outcome,
            stop_hit: stop_hit_at.is_some(),
            p_win_calibrated: setup.p_win_calibrated.filter(|v| v.is_finite()),
            ev_r: setup.ev_r.filter(|v| v.is_finite()),
            target1_r,
            target2_r,
            move_stop_to_breakeven: metadata
                .trade_management
                .map(|t| t.move_stop_to_breakeven)
                .unwrap_or(true),
            confluence_score: setup.confluence_score(),
            flow_alignment_pct: metadata.flow_alignment(),
            flow_confirmed: metadata.is_flow_confirmed(),
            ema_aligned: metadata.is_ema_aligned(),
            volume_regime_aligned: metadata.is_volume_regime_aligned(),
        }
    }
}
