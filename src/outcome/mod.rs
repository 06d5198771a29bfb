//! Outcome resolution: pure rules, the resolver service and the level-touch
//! side channel.

pub mod level_touch;
pub mod resolver;
pub mod rules;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::ValidationError;
use crate::types::SetupInstance;

pub use level_touch::{LevelTouch, LevelTouchRecorder, TouchClassification};
pub use resolver::{OutcomeResolver, ResolveReport};
pub use rules::{final_reason_for, resolve_from_setup, resolve_from_transition, resolved_at_for, OutcomeResolution, TrackedState};

/// Lifecycle phase named by a transition event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionPhase {
    Forming,
    Ready,
    Triggered,
    Target1Hit,
    Target2Hit,
    Invalidated,
    Expired,
}

impl TransitionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionPhase::Forming => "forming",
            TransitionPhase::Ready => "ready",
            TransitionPhase::Triggered => "triggered",
            TransitionPhase::Target1Hit => "target1_hit",
            TransitionPhase::Target2Hit => "target2_hit",
            TransitionPhase::Invalidated => "invalidated",
            TransitionPhase::Expired => "expired",
        }
    }
}

impl FromStr for TransitionPhase {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "forming" => Ok(TransitionPhase::Forming),
            "ready" => Ok(TransitionPhase::Ready),
            "triggered" => Ok(TransitionPhase::Triggered),
            "target1_hit" => Ok(TransitionPhase::Target1Hit),
            "target2_hit" => Ok(TransitionPhase::Target2Hit),
            "invalidated" => Ok(TransitionPhase::Invalidated),
            "expired" => Ok(TransitionPhase::Expired),
            other => Err(ValidationError::UnknownValue {
                field: "phase",
                value: other.to_string(),
            }),
        }
    }
}

/// Live lifecycle event streamed by the detection engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionEvent {
    pub event_id: String,
    /// Snapshot of the setup after the transition.
    pub setup: SetupInstance,
    pub from_phase: Option<TransitionPhase>,
    pub to_phase: TransitionPhase,
    pub reason: Option<String>,
    pub price: Option<f64>,
    pub timestamp: DateTime<Utc>,
}
