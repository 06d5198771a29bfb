//! Pure resolution rules shared by live snapshots, transition events and
//! backtest rows.

use chrono::{DateTime, Utc};

use super::TransitionPhase;
use crate::types::{FinalOutcome, SetupInstance, SetupStatus};

/// Outcome chosen for a setup together with its reason string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeResolution {
    pub outcome: FinalOutcome,
    pub reason: String,
}

impl OutcomeResolution {
    fn new(outcome: FinalOutcome, reason: &str) -> Self {
        Self {
            outcome,
            reason: reason.to_string(),
        }
    }
}

/// Outcome-relevant view of a stored row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackedState {
    pub triggered: bool,
    pub t1_hit: bool,
    pub t2_hit: bool,
    pub stop_hit: bool,
    pub resolved: bool,
}

impl From<&SetupInstance> for TrackedState {
    fn from(row: &SetupInstance) -> Self {
        Self {
            triggered: row.triggered_at.is_some(),
            t1_hit: row.t1_hit_at.is_some(),
            t2_hit: row.t2_hit_at.is_some(),
            stop_hit: row.stop_hit_at.is_some(),
            resolved: row.final_outcome.is_some(),
        }
    }
}

pub const STOP_BREACH_REASON: &str = "stop_breach_confirmed";

/// Resolves a live snapshot against the stored row.
///
/// Returns `None` when the row is untriggered, already resolved or still
/// live.
pub fn resolve_from_setup(
    status: SetupStatus,
    invalidation_reason: Option<&str>,
    state: &TrackedState,
) -> Option<OutcomeResolution> {
    if !state.triggered || state.resolved {
        return None;
    }

    let stop_hit = state.stop_hit
        || (status == SetupStatus::Invalidated && invalidation_reason == Some(STOP_BREACH_REASON));

    if state.t2_hit {
        return Some(OutcomeResolution::new(FinalOutcome::T2BeforeStop, "target2_hit"));
    }
    if stop_hit && !state.t1_hit {
        return Some(OutcomeResolution::new(FinalOutcome::StopBeforeT1, STOP_BREACH_REASON));
    }

    match status {
        SetupStatus::Invalidated if state.t1_hit => {
            Some(OutcomeResolution::new(FinalOutcome::T1BeforeStop, "stop_after_target1"))
        }
        SetupStatus::Invalidated => Some(OutcomeResolution::new(
            FinalOutcome::InvalidatedOther,
            invalidation_reason.filter(|r| !r.is_empty()).unwrap_or("invalidated"),
        )),
        SetupStatus::Expired if state.t1_hit => {
            Some(OutcomeResolution::new(FinalOutcome::T1BeforeStop, "target1_then_expired"))
        }
        SetupStatus::Expired => Some(OutcomeResolution::new(
            FinalOutcome::ExpiredUnresolved,
            "expired_without_target_hit",
        )),
        _ => None,
    }
}

/// Resolves a transition event against the stored row, after the event's
/// own hit timestamp has been merged into `state`.
pub fn resolve_from_transition(
    phase: TransitionPhase,
    reason: Option<&str>,
    state: &TrackedState,
) -> Option<OutcomeResolution> {
    if state.resolved {
        return None;
    }

    match phase {
        TransitionPhase::Target2Hit => {
            Some(OutcomeResolution::new(FinalOutcome::T2BeforeStop, "target2_hit"))
        }
        TransitionPhase::Invalidated if state.t1_hit => {
            Some(OutcomeResolution::new(FinalOutcome::T1BeforeStop, "stop_after_target1"))
        }
        TransitionPhase::Invalidated if reason == Some("stop") => {
            Some(OutcomeResolution::new(FinalOutcome::StopBeforeT1, STOP_BREACH_REASON))
        }
        TransitionPhase::Invalidated if state.triggered => Some(OutcomeResolution::new(
            FinalOutcome::InvalidatedOther,
            reason.filter(|r| !r.is_empty()).unwrap_or("invalidated"),
        )),
        TransitionPhase::Expired if state.t1_hit => {
            Some(OutcomeResolution::new(FinalOutcome::T1BeforeStop, "target1_then_expired"))
        }
        TransitionPhase::Expired if state.triggered => Some(OutcomeResolution::new(
            FinalOutcome::ExpiredUnresolved,
            "expired_without_target_hit",
        )),
        _ => None,
    }
}

/// Reason recorded for a backtest-derived outcome.
pub fn final_reason_for(outcome: FinalOutcome) -> &'static str {
    match outcome {
        FinalOutcome::T2BeforeStop => "target2_hit",
        FinalOutcome::T1BeforeStop => "target1_then_stop_or_expiry",
        FinalOutcome::StopBeforeT1 => STOP_BREACH_REASON,
        FinalOutcome::InvalidatedOther => "invalidated_other",
        FinalOutcome::ExpiredUnresolved => "expired_without_target_hit",
    }
}

/// First of the T2, stop, T1 and trigger timestamps.
pub fn resolved_at_for(
    t2_hit_at: Option<DateTime<Utc>>,
    stop_hit_at: Option<DateTime<Utc>>,
    t1_hit_at: Option<DateTime<Utc>>,
    triggered_at: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    t2_hit_at.or(stop_hit_at).or(t1_hit_at).or(triggered_at)
}
