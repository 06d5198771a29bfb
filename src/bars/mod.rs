//! Price bars: fetching, per-session loading and the price-path matcher.

pub mod loader;
pub mod matcher;
pub mod provider;

use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

pub use loader::{BarLoader, SessionBars};
pub use matcher::{match_levels, LevelPlan, MatchOptions, MatchVerdict};
pub use provider::{BarProvider, HttpBarProvider};

/// Bar granularity served by the aggregates endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Second,
    Minute,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Second => "second",
            Resolution::Minute => "minute",
        }
    }

    /// Circuit-breaker channel for this resolution.
    pub fn channel(&self) -> &'static str {
        match self {
            Resolution::Second => "second_bars",
            Resolution::Minute => "minute_bars",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolution asked for by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionRequest {
    #[default]
    Second,
    Minute,
    Auto,
}

impl ResolutionRequest {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionRequest::Second => "second",
            ResolutionRequest::Minute => "minute",
            ResolutionRequest::Auto => "auto",
        }
    }

    /// Resolutions to try per session, most precise first.
    pub fn preference(&self) -> NonEmpty<Resolution> {
        match self {
            ResolutionRequest::Minute => NonEmpty::new(Resolution::Minute),
            ResolutionRequest::Second | ResolutionRequest::Auto => {
                NonEmpty::from((Resolution::Second, vec![Resolution::Minute]))
            }
        }
    }
}

impl FromStr for ResolutionRequest {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "second" => Ok(ResolutionRequest::Second),
            "minute" => Ok(ResolutionRequest::Minute),
            "auto" => Ok(ResolutionRequest::Auto),
            other => Err(ValidationError::UnknownValue {
                field: "resolution",
                value: other.to_string(),
            }),
        }
    }
}

/// Resolution actually used across a batch of sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionUsed {
    Second,
    Minute,
    None,
}
