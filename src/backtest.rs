//! Historical backtest of stored setups against replayed price bars.
//!
//! Setups are loaded from the store, filtered by the caller's inclusion
//! flags and the active profile's pauses, replayed through the price-path
//! matcher with execution slippage and commission applied, and summarized
//! into win-rate analytics plus realized-R profitability.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::analytics::{rate_pct, round_to, summarize, WinRateAnalytics};
use crate::bars::{
    match_levels, BarLoader, LevelPlan, MatchOptions, MatchVerdict, ResolutionRequest, ResolutionUsed,
};
use crate::error::ValidationError;
use crate::optimizer::OptimizationProfile;
use crate::outcome::{OutcomeResolver, ResolveReport};
use crate::storage::{with_timeout, SetupStore};
use crate::types::{
    bucket_key, DateRange, Direction, FinalOutcome, GateStatus, OutcomeRow, PriceBar, SetupInstance, SetupKey,
};

/// Floor on initial risk, in points.
pub const MIN_RISK_POINTS: f64 = 0.25;

/// Slippage and commission applied to replayed fills.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionModel {
    pub enabled: bool,
    pub entry_slip_points: f64,
    pub target_slip_points: f64,
    pub stop_slip_points: f64,
    pub commission_per_trade_r: f64,
    pub partial_at_t1_pct: f64,
    pub move_stop_to_breakeven_after_t1: bool,
}

impl Default for ExecutionModel {
    fn default() -> Self {
        Self {
            enabled: true,
            entry_slip_points: 0.2,
            target_slip_points: 0.25,
            stop_slip_points: 0.15,
            commission_per_trade_r: 0.04,
            partial_at_t1_pct: 0.5,
            move_stop_to_breakeven_after_t1: true,
        }
    }
}

fn non_negative(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value.max(0.0)
    } else {
        fallback
    }
}

impl ExecutionModel {
    /// Floors slippage and commission at zero and clamps the partial.
    pub fn normalized(self) -> Self {
        let defaults = Self::default();
        Self {
            enabled: self.enabled,
            entry_slip_points: non_negative(self.entry_slip_points, defaults.entry_slip_points),
            target_slip_points: non_negative(self.target_slip_points, defaults.target_slip_points),
            stop_slip_points: non_negative(self.stop_slip_points, defaults.stop_slip_points),
            commission_per_trade_r: non_negative(self.commission_per_trade_r, defaults.commission_per_trade_r),
            partial_at_t1_pct: non_negative(self.partial_at_t1_pct, defaults.partial_at_t1_pct).min(1.0),
            move_stop_to_breakeven_after_t1: self.move_stop_to_breakeven_after_t1,
        }
    }

    /// Model with the setup's own trade management applied.
    pub fn for_setup(&self, setup: &SetupInstance) -> Self {
        match setup.metadata.trade_management {
            Some(management) => Self {
                partial_at_t1_pct: non_negative(management.partial_at_t1_pct, self.partial_at_t1_pct).min(1.0),
                move_stop_to_breakeven_after_t1: management.move_stop_to_breakeven,
                ..*self
            },
            None => *self,
        }
    }

    fn commission_r(&self) -> f64 {
        if self.enabled {
            self.commission_per_trade_r
        } else {
            0.0
        }
    }

    fn partial(&self) -> f64 {
        if self.enabled {
            self.partial_at_t1_pct
        } else {
            0.5
        }
    }
}

/// Levels the matcher tests once slippage is applied: targets move away
/// from the entry, the stop moves toward it.
pub fn effective_plan(setup: &SetupInstance, model: &ExecutionModel) -> LevelPlan {
    let mut plan = LevelPlan::from_setup(setup, model.move_stop_to_breakeven_after_t1);
    if !model.enabled {
        return plan;
    }
    let sign = match setup.direction {
        Direction::Bullish => 1.0,
        Direction::Bearish => -1.0,
    };
    plan.target1 += sign * model.target_slip_points;
    plan.target2 = plan.target2.map(|t| t + sign * model.target_slip_points);
    plan.stop += sign * model.stop_slip_points;
    plan.entry_slip = model.entry_slip_points;
    plan
}

/// Realized R of a replayed setup, rounded to 4 places. `None` until the
/// verdict carries an outcome.
pub fn realized_r(setup: &SetupInstance, verdict: &MatchVerdict, model: &ExecutionModel) -> Option<f64> {
    let outcome = verdict.outcome?;
    let entry = verdict.entry_fill_price.unwrap_or_else(|| setup.entry_zone.mid());
    let risk = (entry - setup.stop_price).abs().max(MIN_RISK_POINTS);
    let t1_r = (setup.target1_price - entry).abs() / risk;
    let t2_r = setup
        .target2_price
        .filter(|p| p.is_finite())
        .map(|p| (p - entry).abs() / risk)
        .unwrap_or(t1_r);
    let commission = model.commission_r();
    let partial = model.partial();

    let mark_to_last = || {
        let mark = verdict.last_price.unwrap_or(entry);
        let moved = match setup.direction {
            Direction::Bullish => mark - entry,
            Direction::Bearish => entry - mark,
        };
        moved / risk
    };

    let value = match outcome {
        FinalOutcome::T2BeforeStop => partial * t1_r + (1.0 - partial) * t2_r - commission,
        FinalOutcome::T1BeforeStop => {
            let runner = if verdict.stop_hit_at.is_some() {
                if model.move_stop_to_breakeven_after_t1 {
                    0.0
                } else {
                    -1.0
                }
            } else {
                mark_to_last()
            };
            partial * t1_r + (1.0 - partial) * runner - commission
        }
        FinalOutcome::StopBeforeT1 => -1.0 - commission,
        FinalOutcome::ExpiredUnresolved => mark_to_last() - commission,
        FinalOutcome::InvalidatedOther => -commission,
    };
    Some(round_to(value, 4))
}

/// One replayed setup.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluatedSetup {
    pub row: OutcomeRow,
    pub ambiguous_bar_count: u32,
    pub missing_target2: bool,
}

/// Replays one setup over its session's bars. The trigger is always
/// re-detected from the bars.
pub fn evaluate_setup(
    setup: &SetupInstance,
    bars: &[PriceBar],
    model: &ExecutionModel,
    ttl: ChronoDuration,
) -> EvaluatedSetup {
    let model = model.for_setup(setup);
    let plan = effective_plan(setup, &model);
    let options = MatchOptions {
        not_before: setup.first_seen_at,
        ttl,
    };
    let verdict = match_levels(&plan, bars, &options);
    let triggered = verdict.is_triggered();

    let mut row = OutcomeRow::from(setup);
    row.triggered_at = verdict.triggered_at;
    row.final_outcome = if triggered { verdict.outcome } else { None };
    row.t1_hit_at = verdict.t1_hit_at;
    row.t2_hit_at = verdict.t2_hit_at;
    row.stop_hit_at = verdict.stop_hit_at;
    row.realized_r = if triggered { realized_r(setup, &verdict, &model) } else { None };
    row.entry_fill_price = if triggered {
        Some(round_to(verdict.entry_fill_price.unwrap_or_else(|| setup.entry_zone.mid()), 2))
    } else {
        None
    };
    row.ambiguous = verdict.ambiguous;

    EvaluatedSetup {
        row,
        ambiguous_bar_count: u32::from(verdict.ambiguous),
        missing_target2: setup.target2_price.filter(|p| p.is_finite()).is_none(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupTypeProfitability {
    pub key: String,
    pub trade_count: u32,
    pub average_realized_r: f64,
    pub cumulative_realized_r: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfitabilityMetrics {
    pub triggered_count: u32,
    pub resolved_count: u32,
    pub with_realized_r_count: u32,
    pub average_realized_r: f64,
    pub median_realized_r: f64,
    pub cumulative_realized_r: f64,
    pub expectancy_r: f64,
    pub positive_realized_rate_pct: f64,
    pub by_setup_type: Vec<SetupTypeProfitability>,
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}

pub fn build_profitability(rows: &[OutcomeRow]) -> ProfitabilityMetrics {
    let triggered: Vec<&OutcomeRow> = rows.iter().filter(|r| r.is_triggered()).collect();
    if triggered.is_empty() {
        return ProfitabilityMetrics::default();
    }

    let realized: Vec<(&OutcomeRow, f64)> = triggered
        .iter()
        .filter_map(|row| row.realized_r.filter(|r| r.is_finite()).map(|r| (*row, r)))
        .collect();
    let values: Vec<f64> = realized.iter().map(|(_, r)| *r).collect();
    let cumulative: f64 = values.iter().sum();
    let average = if values.is_empty() {
        0.0
    } else {
        cumulative / values.len() as f64
    };
    let positive = values.iter().filter(|r| **r > 0.0).count() as u32;

    let mut by_type: HashMap<String, (u32, f64)> = HashMap::new();
    for (row, r) in &realized {
        let entry = by_type.entry(bucket_key(Some(&row.setup_type))).or_default();
        entry.0 += 1;
        entry.1 += r;
    }
    let mut by_setup_type: Vec<SetupTypeProfitability> = by_type
        .into_iter()
        .map(|(key, (count, total))| SetupTypeProfitability {
            key,
            trade_count: count,
            average_realized_r: round_to(total / count as f64, 4),
            cumulative_realized_r: round_to(total, 4),
        })
        .collect();
    by_setup_type.sort_by(|a, b| b.trade_count.cmp(&a.trade_count).then_with(|| a.key.cmp(&b.key)));

    ProfitabilityMetrics {
        triggered_count: triggered.len() as u32,
        resolved_count: triggered.iter().filter(|r| r.final_outcome.is_some()).count() as u32,
        with_realized_r_count: values.len() as u32,
        average_realized_r: round_to(average, 4),
        median_realized_r: round_to(median(&values), 4),
        cumulative_realized_r: round_to(cumulative, 4),
        expectancy_r: round_to(average, 4),
        positive_realized_rate_pct: rate_pct(positive, values.len() as u32),
        by_setup_type,
    }
}

/// Where setups are loaded from. Stored setup instances are the only
/// source, so `auto` is accepted as an alias for it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BacktestSource {
    #[default]
    #[serde(alias = "auto", alias = "spx_setup_instances")]
    SetupInstances,
}

impl FromStr for BacktestSource {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "setup_instances" | "spx_setup_instances" | "auto" => Ok(BacktestSource::SetupInstances),
            other => Err(ValidationError::UnknownValue {
                field: "source",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceUsed {
    SetupInstances,
    None,
}

impl fmt::Display for SourceUsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceUsed::SetupInstances => f.write_str("setup_instances"),
            SourceUsed::None => f.write_str("none"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BacktestRequest {
    pub range: DateRange,
    pub source: BacktestSource,
    pub resolution: ResolutionRequest,
    pub include_blocked_setups: bool,
    pub include_hidden_tiers: bool,
    pub include_paused_setups: bool,
    /// Replaces the configured execution model when set.
    pub execution_model: Option<ExecutionModel>,
    pub include_rows: bool,
    pub persist_results: bool,
}

impl BacktestRequest {
    pub fn new(range: DateRange) -> Self {
        Self {
            range,
            source: BacktestSource::default(),
            resolution: ResolutionRequest::default(),
            include_blocked_setups: false,
            include_hidden_tiers: false,
            include_paused_setups: false,
            execution_model: None,
            include_rows: false,
            persist_results: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestResult {
    pub date_range: DateRange,
    pub source_used: SourceUsed,
    pub setup_count: u32,
    pub evaluated_setup_count: u32,
    pub skipped_setup_count: u32,
    pub ambiguous_bar_count: u32,
    pub missing_target2_count: u32,
    pub missing_bars_sessions: Vec<NaiveDate>,
    pub requested_resolution: ResolutionRequest,
    pub resolution_used: ResolutionUsed,
    pub resolution_fallback_sessions: Vec<NaiveDate>,
    pub execution_model: ExecutionModel,
    pub profitability: ProfitabilityMetrics,
    pub notes: Vec<String>,
    pub analytics: WinRateAnalytics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<OutcomeRow>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persisted: Option<ResolveReport>,
}

impl BacktestResult {
    fn empty(request: &BacktestRequest, model: ExecutionModel, notes: Vec<String>) -> Self {
        Self {
            date_range: request.range,
            source_used: SourceUsed::None,
            setup_count: 0,
            evaluated_setup_count: 0,
            skipped_setup_count: 0,
            ambiguous_bar_count: 0,
            missing_target2_count: 0,
            missing_bars_sessions: Vec::new(),
            requested_resolution: request.resolution,
            resolution_used: ResolutionUsed::None,
            resolution_fallback_sessions: Vec::new(),
            execution_model: model,
            profitability: ProfitabilityMetrics::default(),
            notes,
            analytics: summarize(&[], request.range),
            rows: request.include_rows.then(Vec::new),
            persisted: None,
        }
    }
}

/// Loads, filters and replays setups.
pub struct Backtester {
    store: Arc<dyn SetupStore>,
    loader: BarLoader,
    resolver: Arc<OutcomeResolver>,
    store_timeout: Duration,
    ttl: ChronoDuration,
    default_model: ExecutionModel,
}

impl Backtester {
    pub fn new(
        store: Arc<dyn SetupStore>,
        loader: BarLoader,
        resolver: Arc<OutcomeResolver>,
        store_timeout: Duration,
        ttl: ChronoDuration,
        default_model: ExecutionModel,
    ) -> Self {
        Self {
            store,
            loader,
            resolver,
            store_timeout,
            ttl,
            default_model,
        }
    }

    /// Setups in range that pass the request's inclusion filters.
    async fn load_setups(
        &self,
        request: &BacktestRequest,
        profile: &OptimizationProfile,
        notes: &mut Vec<String>,
    ) -> Result<(Vec<SetupInstance>, u32)> {
        let loaded = with_timeout(
            self.store_timeout,
            "loading setups for backtest",
            self.store.list_setups(request.range),
        )
        .await?;

        let mut skipped = 0u32;
        let mut paused = 0u32;
        let mut setups = Vec::with_capacity(loaded.len());
        for setup in loaded {
            if !request.include_blocked_setups && setup.gate_status() == Some(GateStatus::Blocked) {
                continue;
            }
            if !request.include_hidden_tiers && setup.is_hidden_tier() {
                continue;
            }
            if !request.include_paused_setups
                && (profile.is_setup_type_paused(&setup.setup_type) || profile.is_combo_paused(&setup.combo_key()))
            {
                paused += 1;
                continue;
            }
            if !setup.has_finite_levels() {
                skipped += 1;
                continue;
            }
            setups.push(setup);
        }

        if paused > 0 {
            notes.push(format!("Excluded {paused} setups paused by the active optimization profile."));
        }
        if skipped > 0 {
            notes.push(format!("Skipped {skipped} setups with non-finite entry, stop or target levels."));
        }
        Ok((setups, skipped))
    }

    #[instrument(skip(self, request, profile), fields(range = %request.range, resolution = %request.resolution.as_str()))]
    pub async fn run(&self, request: &BacktestRequest, profile: &OptimizationProfile) -> BacktestResult {
        let model = request.execution_model.unwrap_or(self.default_model).normalized();
        let mut notes = Vec::new();

        let (setups, mut skipped) = match self.load_setups(request, profile, &mut notes).await {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(error = %e, "Failed to load setups for backtest");
                notes.push(format!("Failed to load setups: {e}"));
                return BacktestResult::empty(request, model, notes);
            }
        };

        if setups.is_empty() {
            notes.push("No backtestable setups found for the requested date range.".to_string());
            let mut result = BacktestResult::empty(request, model, notes);
            result.source_used = SourceUsed::SetupInstances;
            result.skipped_setup_count = skipped;
            return result;
        }

        let sessions: Vec<NaiveDate> = setups.iter().map(|s| s.session_date).collect();
        let loaded = self.loader.load_sessions(&sessions, request.resolution).await;

        let mut evaluated = Vec::with_capacity(setups.len());
        for setup in &setups {
            let Some((_, bars)) = loaded.get(setup.session_date) else {
                skipped += 1;
                continue;
            };
            evaluated.push(evaluate_setup(setup, bars, &model, self.ttl));
        }

        let rows: Vec<OutcomeRow> = evaluated.iter().map(|e| e.row.clone()).collect();
        let sequenced: Vec<OutcomeRow> = rows.iter().filter(|r| !r.ambiguous).cloned().collect();
        let ambiguous_bar_count: u32 = evaluated.iter().map(|e| e.ambiguous_bar_count).sum();
        let missing_target2_count = evaluated.iter().filter(|e| e.missing_target2).count() as u32;

        if missing_target2_count > 0 {
            notes.push(format!("Target2 missing for {missing_target2_count} setups."));
        }
        if ambiguous_bar_count > 0 {
            notes.push(format!(
                "{ambiguous_bar_count} setups had a bar covering both stop and target; excluded from analytics."
            ));
        }
        if !loaded.missing_sessions.is_empty() {
            notes.push(format!(
                "No historical bars were returned for {} session dates.",
                loaded.missing_sessions.len()
            ));
        }
        if !loaded.fallback_sessions.is_empty() {
            notes.push(format!(
                "Second bars unavailable for {} sessions; used minute bars fallback.",
                loaded.fallback_sessions.len()
            ));
        }

        let persisted = if request.persist_results {
            Some(self.resolver.persist_backtest_rows(&rows, Some(Utc::now())).await)
        } else {
            None
        };

        info!(
            setups = setups.len(),
            evaluated = evaluated.len(),
            ambiguous = ambiguous_bar_count,
            missing_sessions = loaded.missing_sessions.len(),
            "Backtest finished"
        );

        BacktestResult {
            date_range: request.range,
            source_used: SourceUsed::SetupInstances,
            setup_count: setups.len() as u32,
            evaluated_setup_count: evaluated.len() as u32,
            skipped_setup_count: skipped,
            ambiguous_bar_count,
            missing_target2_count,
            missing_bars_sessions: loaded.missing_sessions.clone(),
            requested_resolution: request.resolution,
            resolution_used: loaded.resolution_used,
            resolution_fallback_sessions: loaded.fallback_sessions.clone(),
            execution_model: model,
            profitability: build_profitability(&sequenced),
            analytics: summarize(&sequenced, request.range),
            notes,
            rows: request.include_rows.then_some(rows),
            persisted,
        }
    }
}

/// Replayed rows keyed by setup, for callers that overlay them on stored rows.
pub fn rows_by_key(rows: &[OutcomeRow]) -> HashMap<SetupKey, OutcomeRow> {
    rows.iter().map(|row| (row.key(), row.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntryZone, SetupMetadata, SetupStatus, TradeManagement};
    use chrono::{DateTime, TimeZone};

    const BASE_MS: i64 = 1_773_149_400_000; // 2026-03-10 13:30:00 UTC

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(BASE_MS + minute * 60_000).unwrap()
    }

    fn bar(minute: i64, o: f64, h: f64, l: f64, c: f64) -> PriceBar {
        PriceBar { t: BASE_MS + minute * 60_000, o, h, l, c, v: 100.0 }
    }

    fn create_test_setup(id: &str) -> SetupInstance {
        SetupInstance {
            engine_setup_id: id.to_string(),
            session_date: NaiveDate::from_ymd_opt(2026, 3, 10).unwrap(),
            setup_type: "fade_at_wall".to_string(),
            direction: Direction::Bullish,
            regime: Some("ranging".to_string()),
            tier: Some("primary".to_string()),
            entry_zone: EntryZone { low: 5000.0, high: 5002.0 },
            stop_price: 4995.0,
            target1_price: 5010.0,
            target2_price: Some(5020.0),
            p_win_calibrated: Some(0.64),
            ev_r: Some(0.3),
            status: SetupStatus::Ready,
            invalidation_reason: None,
            first_seen_at: Some(at(0)),
            last_seen_at: None,
            status_updated_at: None,
            triggered_at: None,
            t1_hit_at: None,
            t2_hit_at: None,
            stop_hit_at: None,
            final_outcome: None,
            final_reason: None,
            resolved_at: None,
            realized_r: None,
            entry_fill_price: None,
            metadata: SetupMetadata::default(),
        }
    }

    fn opening_bars() -> Vec<PriceBar> {
        vec![
            bar(0, 5005.0, 5006.0, 5003.0, 5004.0),
            bar(1, 5004.0, 5004.5, 5001.0, 5003.0),
        ]
    }

    #[test]
    fn test_execution_model_normalization() {
        let model = ExecutionModel {
            entry_slip_points: -1.0,
            commission_per_trade_r: f64::NAN,
            partial_at_t1_pct: 1.4,
            ..ExecutionModel::default()
        }
        .normalized();

        assert_eq!(model.entry_slip_points, 0.0);
        assert_eq!(model.commission_per_trade_r, 0.04);
        assert_eq!(model.partial_at_t1_pct, 1.0);
    }

    #[test]
    fn test_setup_trade_management_overrides_model() {
        let mut setup = create_test_setup("s-1");
        setup.metadata.trade_management = Some(TradeManagement {
            partial_at_t1_pct: 0.65,
            move_stop_to_breakeven: false,
        });

        let model = ExecutionModel::default().for_setup(&setup);
        assert_eq!(model.partial_at_t1_pct, 0.65);
        assert!(!model.move_stop_to_breakeven_after_t1);
        assert_eq!(model.entry_slip_points, 0.2);
    }

    #[test]
    fn test_effective_plan_slippage() {
        let model = ExecutionModel::default();
        let plan = effective_plan(&create_test_setup("s-1"), &model);
        assert_eq!(plan.target1, 5010.25);
        assert_eq!(plan.target2, Some(5020.25));
        assert!((plan.stop - 4995.15).abs() < 1e-9);

        let mut bearish = create_test_setup("s-2");
        bearish.direction = Direction::Bearish;
        bearish.stop_price = 5007.0;
        bearish.target1_price = 4990.0;
        bearish.target2_price = None;
        let plan = effective_plan(&bearish, &model);
        assert_eq!(plan.target1, 4989.75);
        assert_eq!(plan.target2, None);
        assert!((plan.stop - 5006.85).abs() < 1e-9);

        let disabled = ExecutionModel { enabled: false, ..model };
        assert_eq!(effective_plan(&bearish, &disabled).stop, 5007.0);
    }

    #[test]
    fn test_replay_to_target2_with_slippage() {
        let setup = create_test_setup("s-1");
        let mut bars = opening_bars();
        bars.push(bar(2, 5003.0, 5011.0, 5002.0, 5010.0));
        bars.push(bar(3, 5010.0, 5021.0, 5009.0, 5019.0));

        let evaluated = evaluate_setup(
            &setup,
            &bars,
            &ExecutionModel::default(),
            ChronoDuration::minutes(90),
        );

        let row = &evaluated.row;
        assert_eq!(row.triggered_at, Some(at(1)));
        assert_eq!(row.t1_hit_at, Some(at(2)));
        assert_eq!(row.final_outcome, Some(FinalOutcome::T2BeforeStop));
        assert_eq!(row.entry_fill_price, Some(5002.2));
        // risk 7.2: 0.5 * 7.8/7.2 + 0.5 * 17.8/7.2 - 0.04
        assert_eq!(row.realized_r, Some(1.7378));
        assert_eq!(evaluated.ambiguous_bar_count, 0);
        assert!(!evaluated.missing_target2);
    }

    #[test]
    fn test_ambiguous_bar_is_flagged() {
        let setup = create_test_setup("s-1");
        let mut bars = opening_bars();
        bars.push(bar(2, 5003.0, 5011.0, 4994.0, 5000.0));

        let evaluated = evaluate_setup(
            &setup,
            &bars,
            &ExecutionModel::default(),
            ChronoDuration::minutes(90),
        );
        assert!(evaluated.row.ambiguous);
        assert_eq!(evaluated.ambiguous_bar_count, 1);
        assert!(evaluated.row.final_outcome.is_none());
        assert!(evaluated.row.realized_r.is_none());
    }

    #[test]
    fn test_untriggered_setup_has_no_outcome() {
        let setup = create_test_setup("s-1");
        let bars = vec![bar(0, 5005.0, 5008.0, 5004.0, 5007.0)];
        let evaluated = evaluate_setup(
            &setup,
            &bars,
            &ExecutionModel::default(),
            ChronoDuration::minutes(90),
        );
        assert!(evaluated.row.triggered_at.is_none());
        assert!(evaluated.row.final_outcome.is_none());
        assert!(evaluated.row.entry_fill_price.is_none());
    }

    #[test]
    fn test_realized_r_by_outcome() {
        let setup = create_test_setup("s-1");
        let model = ExecutionModel { enabled: false, ..ExecutionModel::default() };
        // entry 5001, risk 6, T1 1.5R, T2 19/6 R
        let mut verdict = MatchVerdict {
            triggered_at: Some(at(1)),
            entry_fill_price: Some(5001.0),
            outcome: Some(FinalOutcome::StopBeforeT1),
            ..MatchVerdict::default()
        };
        assert_eq!(realized_r(&setup, &verdict, &model), Some(-1.0));

        verdict.outcome = Some(FinalOutcome::T1BeforeStop);
        verdict.stop_hit_at = Some(at(5));
        assert_eq!(realized_r(&setup, &verdict, &model), Some(0.75));

        verdict.stop_hit_at = None;
        verdict.last_price = Some(5004.0);
        assert_eq!(realized_r(&setup, &verdict, &model), Some(1.0));

        verdict.outcome = Some(FinalOutcome::ExpiredUnresolved);
        assert_eq!(realized_r(&setup, &verdict, &model), Some(0.5));

        verdict.outcome = Some(FinalOutcome::InvalidatedOther);
        assert_eq!(realized_r(&setup, &verdict, &ExecutionModel::default()), Some(-0.04));

        verdict.outcome = None;
        assert_eq!(realized_r(&setup, &verdict, &model), None);
    }

    #[test]
    fn test_profitability() {
        let setup = create_test_setup("s-1");
        let make = |id: &str, setup_type: &str, r: Option<f64>| {
            let mut row = OutcomeRow::from(&setup);
            row.engine_setup_id = id.to_string();
            row.setup_type = setup_type.to_string();
            row.triggered_at = Some(at(1));
            row.final_outcome = r.map(|_| FinalOutcome::T1BeforeStop);
            row.realized_r = r;
            row
        };
        let mut untriggered = OutcomeRow::from(&setup);
        untriggered.realized_r = Some(9.0);

        let rows = vec![
            make("a", "fade_at_wall", Some(1.5)),
            make("b", "orb_breakout", Some(-1.04)),
            make("c", "fade_at_wall", Some(0.5)),
            make("d", "fade_at_wall", None),
            untriggered,
        ];
        let metrics = build_profitability(&rows);

        assert_eq!(metrics.triggered_count, 4);
        assert_eq!(metrics.resolved_count, 3);
        assert_eq!(metrics.with_realized_r_count, 3);
        assert_eq!(metrics.median_realized_r, 0.5);
        assert_eq!(metrics.cumulative_realized_r, 0.96);
        assert_eq!(metrics.expectancy_r, 0.32);
        assert_eq!(metrics.positive_realized_rate_pct, 66.67);
        assert_eq!(metrics.by_setup_type[0].key, "fade_at_wall");
        assert_eq!(metrics.by_setup_type[0].trade_count, 2);
        assert_eq!(metrics.by_setup_type[0].cumulative_realized_r, 2.0);
        assert_eq!(build_profitability(&[]), ProfitabilityMetrics::default());
    }

    #[test]
    fn test_source_parse() {
        assert_eq!("auto".parse::<BacktestSource>().unwrap(), BacktestSource::SetupInstances);
        let source: BacktestSource = serde_json::from_str(r#""auto""#).unwrap();
        assert_eq!(source, BacktestSource::SetupInstances);
        assert!("legacy".parse::<BacktestSource>().is_err());
    }
}
