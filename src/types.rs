//! Core types shared by the outcome, analytics and optimizer pipelines.
//!
//! A `SetupInstance` is produced by the external detection engine and only
//! ever gains outcome fields here. `OutcomeRow` is the narrow projection the
//! analytics and backtest code work on.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

/// Trade direction of a setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Bullish,
    Bearish,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Bullish => "bullish",
            Direction::Bearish => "bearish",
        }
    }
}

impl FromStr for Direction {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bullish" => Ok(Direction::Bullish),
            "bearish" => Ok(Direction::Bearish),
            other => Err(ValidationError::UnknownValue {
                field: "direction",
                value: other.to_string(),
            }),
        }
    }
}

/// Terminal classification of a triggered setup.
///
/// These are mutually exclusive; no severity ordering is implied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalOutcome {
    T2BeforeStop,
    T1BeforeStop,
    StopBeforeT1,
    InvalidatedOther,
    ExpiredUnresolved,
}

impl FinalOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalOutcome::T2BeforeStop => "t2_before_stop",
            FinalOutcome::T1BeforeStop => "t1_before_stop",
            FinalOutcome::StopBeforeT1 => "stop_before_t1",
            FinalOutcome::InvalidatedOther => "invalidated_other",
            FinalOutcome::ExpiredUnresolved => "expired_unresolved",
        }
    }

    /// T2 outcomes count as T1 wins as well.
    pub fn is_t1_win(&self) -> bool {
        matches!(self, FinalOutcome::T2BeforeStop | FinalOutcome::T1BeforeStop)
    }

    pub fn is_t2_win(&self) -> bool {
        matches!(self, FinalOutcome::T2BeforeStop)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, FinalOutcome::StopBeforeT1)
    }
}

impl fmt::Display for FinalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FinalOutcome {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "t2_before_stop" => Ok(FinalOutcome::T2BeforeStop),
            "t1_before_stop" => Ok(FinalOutcome::T1BeforeStop),
            "stop_before_t1" => Ok(FinalOutcome::StopBeforeT1),
            "invalidated_other" => Ok(FinalOutcome::InvalidatedOther),
            "expired_unresolved" => Ok(FinalOutcome::ExpiredUnresolved),
            other => Err(ValidationError::UnknownValue {
                field: "final_outcome",
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle status reported by the detection engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupStatus {
    Forming,
    Ready,
    Triggered,
    Invalidated,
    Expired,
}

impl Default for SetupStatus {
    fn default() -> Self {
        SetupStatus::Forming
    }
}

impl SetupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SetupStatus::Forming => "forming",
            SetupStatus::Ready => "ready",
            SetupStatus::Triggered => "triggered",
            SetupStatus::Invalidated => "invalidated",
            SetupStatus::Expired => "expired",
        }
    }
}

impl FromStr for SetupStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "forming" => Ok(SetupStatus::Forming),
            "ready" => Ok(SetupStatus::Ready),
            "triggered" => Ok(SetupStatus::Triggered),
            "invalidated" => Ok(SetupStatus::Invalidated),
            "expired" => Ok(SetupStatus::Expired),
            other => Err(ValidationError::UnknownValue {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// Whether a setup was allowed to trade live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Eligible,
    Blocked,
    ShadowBlocked,
}

/// Trade-management policy attached to a setup or a profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TradeManagement {
    pub partial_at_t1_pct: f64,
    pub move_stop_to_breakeven: bool,
}

impl Default for TradeManagement {
    fn default() -> Self {
        Self {
            partial_at_t1_pct: 0.65,
            move_stop_to_breakeven: true,
        }
    }
}

/// Optional context recorded alongside a setup row.
///
/// Unknown keys survive a storage round trip through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confluence_score: Option<f64>,
    #[serde(default)]
    pub confluence_sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_alignment_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alignment_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_confirmed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ema_aligned: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_regime_aligned: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_status: Option<GateStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_management: Option<TradeManagement>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SetupMetadata {
    /// Flow alignment, falling back to the generic alignment score.
    pub fn flow_alignment(&self) -> Option<f64> {
        self.flow_alignment_pct
            .filter(|v| v.is_finite())
            .or(self.alignment_score.filter(|v| v.is_finite()))
    }

    pub fn is_flow_confirmed(&self) -> bool {
        self.flow_confirmed == Some(true)
    }

    pub fn is_ema_aligned(&self) -> bool {
        self.ema_aligned == Some(true) || self.has_source("ema_alignment")
    }

    pub fn is_volume_regime_aligned(&self) -> bool {
        self.volume_regime_aligned == Some(true) || self.has_source("volume_regime_alignment")
    }

    fn has_source(&self, source: &str) -> bool {
        self.confluence_sources.iter().any(|s| s == source)
    }
}

/// Entry zone bounds; `low` and `high` may arrive swapped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntryZone {
    pub low: f64,
    pub high: f64,
}

impl EntryZone {
    pub fn bounds(&self) -> (f64, f64) {
        (self.low.min(self.high), self.low.max(self.high))
    }

    pub fn mid(&self) -> f64 {
        (self.low + self.high) / 2.0
    }
}

/// A candidate trade signal produced by the detection engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupInstance {
    pub engine_setup_id: String,
    pub session_date: NaiveDate,
    pub setup_type: String,
    pub direction: Direction,
    pub regime: Option<String>,
    pub tier: Option<String>,
    pub entry_zone: EntryZone,
    pub stop_price: f64,
    pub target1_price: f64,
    pub target2_price: Option<f64>,
    pub p_win_calibrated: Option<f64>,
    pub ev_r: Option<f64>,
    #[serde(default)]
    pub status: SetupStatus,
    pub invalidation_reason: Option<String>,
    pub first_seen_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub status_updated_at: Option<DateTime<Utc>>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub t1_hit_at: Option<DateTime<Utc>>,
    pub t2_hit_at: Option<DateTime<Utc>>,
    pub stop_hit_at: Option<DateTime<Utc>>,
    pub final_outcome: Option<FinalOutcome>,
    pub final_reason: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub realized_r: Option<f64>,
    pub entry_fill_price: Option<f64>,
    #[serde(default)]
    pub metadata: SetupMetadata,
}

impl SetupInstance {
    pub fn key(&self) -> SetupKey {
        SetupKey::new(&self.engine_setup_id, self.session_date)
    }

    pub fn confluence_score(&self) -> Option<f64> {
        self.metadata.confluence_score.filter(|v| v.is_finite())
    }

    pub fn gate_status(&self) -> Option<GateStatus> {
        self.metadata.gate_status
    }

    pub fn is_hidden_tier(&self) -> bool {
        self.tier.as_deref() == Some("hidden")
    }

    /// `setupType|regime`, with a missing regime bucketed as `unknown`.
    pub fn combo_key(&self) -> String {
        combo_key(&self.setup_type, self.regime.as_deref())
    }

    /// Price levels are usable for replay.
    pub fn has_finite_levels(&self) -> bool {
        self.entry_zone.low.is_finite()
            && self.entry_zone.high.is_finite()
            && self.stop_price.is_finite()
            && self.target1_price.is_finite()
    }
}

/// Normalizes an optional dimension value into a bucket key.
pub fn bucket_key(value: Option<&str>) -> String {
    match value {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ => "unknown".to_string(),
    }
}

pub fn combo_key(setup_type: &str, regime: Option<&str>) -> String {
    format!("{}|{}", bucket_key(Some(setup_type)), bucket_key(regime))
}

/// Identity of a persisted setup row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SetupKey {
    pub engine_setup_id: String,
    pub session_date: NaiveDate,
}

impl SetupKey {
    pub fn new(engine_setup_id: &str, session_date: NaiveDate) -> Self {
        Self {
            engine_setup_id: engine_setup_id.to_string(),
            session_date,
        }
    }
}

impl fmt::Display for SetupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.engine_setup_id, self.session_date)
    }
}

/// Outcome projection of a setup row used by analytics and the backtest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRow {
    pub engine_setup_id: String,
    pub session_date: NaiveDate,
    pub setup_type: String,
    pub direction: Direction,
    pub regime: Option<String>,
    pub tier: Option<String>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub final_outcome: Option<FinalOutcome>,
    pub t1_hit_at: Option<DateTime<Utc>>,
    pub t2_hit_at: Option<DateTime<Utc>>,
    pub stop_hit_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realized_r: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_fill_price: Option<f64>,
    /// A bar could not order stop versus target for this row.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ambiguous: bool,
}

impl OutcomeRow {
    pub fn key(&self) -> SetupKey {
        SetupKey::new(&self.engine_setup_id, self.session_date)
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered_at.is_some()
    }

    /// Counted in the resolved denominator.
    pub fn is_resolved(&self) -> bool {
        self.triggered_at.is_some() && self.final_outcome.is_some()
    }
}

impl From<&SetupInstance> for OutcomeRow {
    fn from(setup: &SetupInstance) -> Self {
        Self {
            engine_setup_id: setup.engine_setup_id.clone(),
            session_date: setup.session_date,
            setup_type: setup.setup_type.clone(),
            direction: setup.direction,
            regime: setup.regime.clone(),
            tier: setup.tier.clone(),
            triggered_at: setup.triggered_at,
            final_outcome: setup.final_outcome,
            t1_hit_at: setup.t1_hit_at,
            t2_hit_at: setup.t2_hit_at,
            stop_hit_at: setup.stop_hit_at,
            realized_r: setup.realized_r,
            entry_fill_price: setup.entry_fill_price,
            ambiguous: false,
        }
    }
}

/// OHLCV bar as returned by the aggregates endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    /// Bar open time, epoch milliseconds.
    pub t: i64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    #[serde(default)]
    pub v: f64,
}

impl PriceBar {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(self.t)
    }

    pub fn is_finite(&self) -> bool {
        self.o.is_finite() && self.h.is_finite() && self.l.is_finite() && self.c.is_finite()
    }
}

/// Inclusive session-date range in the exchange calendar. Deserializing an
/// inverted range fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawDateRange")]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

#[derive(Deserialize)]
struct RawDateRange {
    from: NaiveDate,
    to: NaiveDate,
}

impl TryFrom<RawDateRange> for DateRange {
    type Error = ValidationError;

    fn try_from(raw: RawDateRange) -> Result<Self, Self::Error> {
        DateRange::new(raw.from, raw.to)
    }
}

impl DateRange {
    /// Rejects inverted ranges.
    pub fn new(from: NaiveDate, to: NaiveDate) -> Result<Self, ValidationError> {
        if from > to {
            return Err(ValidationError::InvertedRange { from, to });
        }
        Ok(Self { from, to })
    }

    /// Re-checks a range whose fields were set directly.
    pub fn validated(self) -> Result<Self, ValidationError> {
        Self::new(self.from, self.to)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.from && date <= self.to
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.from, self.to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_round_trips_unknown_keys() {
        let raw = serde_json::json!({
            "confluenceScore": 4,
            "confluenceSources": ["ema_alignment"],
            "alignmentScore": 57.5,
            "gexContext": { "netGex": -1.2 },
            "rank": 3
        });

        let metadata: SetupMetadata = serde_json::from_value(raw).unwrap();
        assert_eq!(metadata.confluence_score, Some(4.0));
        assert!(metadata.is_ema_aligned());
        assert!(!metadata.is_volume_regime_aligned());
        assert_eq!(metadata.flow_alignment(), Some(57.5));
        assert_eq!(metadata.extra.len(), 2);

        let back = serde_json::to_value(&metadata).unwrap();
        assert_eq!(back["gexContext"]["netGex"], serde_json::json!(-1.2));
        assert_eq!(back["rank"], serde_json::json!(3));
    }

    #[test]
    fn test_combo_key_uses_unknown_regime() {
        assert_eq!(combo_key("fade_at_wall", None), "fade_at_wall|unknown");
        assert_eq!(combo_key("fade_at_wall", Some(" ")), "fade_at_wall|unknown");
        assert_eq!(combo_key("fade_at_wall", Some("ranging")), "fade_at_wall|ranging");
    }

    #[test]
    fn test_outcome_parsing() {
        for outcome in [
            FinalOutcome::T2BeforeStop,
            FinalOutcome::T1BeforeStop,
            FinalOutcome::StopBeforeT1,
            FinalOutcome::InvalidatedOther,
            FinalOutcome::ExpiredUnresolved,
        ] {
            assert_eq!(outcome.as_str().parse::<FinalOutcome>().unwrap(), outcome);
        }
        assert!("won".parse::<FinalOutcome>().is_err());
        assert!(FinalOutcome::T2BeforeStop.is_t1_win());
        assert!(!FinalOutcome::StopBeforeT1.is_t1_win());
    }

    #[test]
    fn test_date_range_rejects_inverted() {
        let from = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let to = NaiveDate::from_ymd_opt(2026, 3, 9).unwrap();
        assert!(DateRange::new(from, to).is_err());
        assert!(DateRange::new(to, from).is_ok());
    }

    #[test]
    fn test_inverted_date_range_is_rejected() {
        let ok: DateRange = serde_json::from_str(r#"{"from":"2026-03-10","to":"2026-03-20"}"#).unwrap();
        assert_eq!(ok.to, NaiveDate::from_ymd_opt(2026, 3, 20).unwrap());

        assert!(serde_json::from_str::<DateRange>(r#"{"from":"2026-03-20","to":"2026-03-10"}"#).is_err());

        let inverted = DateRange {
            from: NaiveDate::from_ymd_opt(2026, 3, 20).unwrap(),
            to: NaiveDate::from_ymd_opt(2026, 3, 10).unwrap(),
        };
        assert!(matches!(inverted.validated(), Err(ValidationError::InvertedRange { .. })));
    }
}
