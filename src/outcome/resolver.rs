//! Outcome resolver service.
//!
//! Turns live snapshots, transition events and backtest rows into durable
//! outcome fields. Every write is row-level first-writer-wins, and one row's
//! failure never aborts the batch.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::level_touch::{LevelTouch, LevelTouchRecorder};
use super::rules::{
    final_reason_for, resolve_from_setup, resolve_from_transition, resolved_at_for, OutcomeResolution,
    TrackedState, STOP_BREACH_REASON,
};
use super::{TransitionEvent, TransitionPhase};
use crate::storage::{is_missing_column_error, missing_column_name, with_timeout, RowPatch, SetupStore, WriteRule};
use crate::types::{FinalOutcome, OutcomeRow, SetupInstance, SetupKey, SetupStatus};

const PROFITABILITY_COLUMNS: [&str; 2] = ["realized_r", "entry_fill_price"];

/// Counters for one resolver call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveReport {
    pub rows_seen: u32,
    pub rows_skipped: u32,
    pub outcomes_written: u32,
    pub writes_failed: u32,
    pub schema_fallbacks: u32,
    pub duplicate_events: u32,
}

impl ResolveReport {
    fn merge(&mut self, other: &ResolveReport) {
        self.rows_seen += other.rows_seen;
        self.rows_skipped += other.rows_skipped;
        self.outcomes_written += other.outcomes_written;
        self.writes_failed += other.writes_failed;
        self.schema_fallbacks += other.schema_fallbacks;
        self.duplicate_events += other.duplicate_events;
    }
}

fn outcome_columns(patch: &mut RowPatch, resolution: &OutcomeResolution, resolved_at: Option<DateTime<Utc>>) {
    patch
        .text("final_outcome", Some(resolution.outcome.as_str()), WriteRule::WhileUnresolved)
        .text("final_reason", Some(&resolution.reason), WriteRule::WhileUnresolved)
        .time("resolved_at", resolved_at, WriteRule::WhileUnresolved);
}

pub struct OutcomeResolver {
    store: Arc<dyn SetupStore>,
    touches: Option<Arc<LevelTouchRecorder>>,
    store_timeout: Duration,
}

impl OutcomeResolver {
    pub fn new(
        store: Arc<dyn SetupStore>,
        touches: Option<Arc<LevelTouchRecorder>>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            touches,
            store_timeout,
        }
    }

    async fn load_row(&self, key: &SetupKey) -> Option<SetupInstance> {
        let loaded = with_timeout(self.store_timeout, "loading setup row", self.store.get_setup(key)).await;
        match loaded {
            Ok(row) => row,
            Err(e) => {
                warn!(setup = %key, error = %e, "Failed to load tracked setup row");
                None
            }
        }
    }

    async fn write_patch(&self, key: &SetupKey, patch: &RowPatch) -> anyhow::Result<bool> {
        with_timeout(self.store_timeout, "updating setup row", self.store.apply_patch(key, patch)).await
    }

    fn record_touch(&self, row: &SetupInstance, outcome: FinalOutcome, touched_at: Option<DateTime<Utc>>) {
        if let Some(touches) = &self.touches {
            touches.record(LevelTouch::for_outcome(row, outcome, touched_at, Utc::now()));
        }
    }

    /// Upserts live setup snapshots and resolves any that reached a
    /// terminal status.
    #[instrument(skip(self, setups), fields(count = setups.len()))]
    pub async fn resolve_outcomes(
        &self,
        setups: &[SetupInstance],
        observed_at: Option<DateTime<Utc>>,
    ) -> ResolveReport {
        let observed_at = observed_at.unwrap_or_else(Utc::now);
        let mut report = ResolveReport::default();

        for setup in setups {
            report.rows_seen += 1;
            let key = setup.key();

            let mut snapshot = setup.clone();
            snapshot.first_seen_at = snapshot.first_seen_at.or(Some(observed_at));
            snapshot.last_seen_at = Some(observed_at);
            let upsert = with_timeout(self.store_timeout, "upserting setup", self.store.upsert_setup(&snapshot)).await;
            if let Err(e) = upsert {
                warn!(setup = %key, error = %e, "Failed to upsert setup instance");
                report.writes_failed += 1;
                continue;
            }

            let Some(row) = self.load_row(&key).await else {
                report.rows_skipped += 1;
                continue;
            };

            let status_at = setup.status_updated_at.unwrap_or(observed_at);
            let mut state = TrackedState::from(&row);
            let mut patch = RowPatch::new();

            if !state.triggered && setup.triggered_at.is_some() {
                patch.time("triggered_at", setup.triggered_at, WriteRule::FillIfNull);
                state.triggered = true;
            }
            let stop_breach = setup.status == SetupStatus::Invalidated
                && setup.invalidation_reason.as_deref() == Some(STOP_BREACH_REASON);
            if stop_breach && !state.stop_hit {
                patch.time("stop_hit_at", Some(status_at), WriteRule::FillIfNull);
                state.stop_hit = true;
            }

            let resolution = resolve_from_setup(setup.status, setup.invalidation_reason.as_deref(), &state);
            if let Some(resolution) = &resolution {
                outcome_columns(&mut patch, resolution, Some(status_at));
            }
            if patch.is_empty() {
                continue;
            }
            patch.time("updated_at", Some(observed_at), WriteRule::Overwrite);

            match self.write_patch(&key, &patch).await {
                Ok(true) => {
                    if let Some(resolution) = resolution {
                        report.outcomes_written += 1;
                        debug!(setup = %key, outcome = %resolution.outcome, "Resolved setup outcome");
                        self.record_touch(&row, resolution.outcome, Some(status_at));
                    }
                }
                Ok(false) => report.rows_skipped += 1,
                Err(e) => {
                    warn!(setup = %key, error = %e, "Failed to update setup instance");
                    report.writes_failed += 1;
                }
            }
        }

        report
    }

    /// Persists transition events in order and resolves the rows they touch.
    /// Each event's snapshot is upserted before the event itself is applied.
    #[instrument(skip(self, events), fields(count = events.len()))]
    pub async fn apply_transitions(&self, events: &[TransitionEvent]) -> ResolveReport {
        let mut report = ResolveReport::default();

        for event in events {
            let key = event.setup.key();
            let ts = event.timestamp;
            let snapshot = self.resolve_outcomes(std::slice::from_ref(&event.setup), Some(ts)).await;
            report.merge(&snapshot);

            let inserted = with_timeout(
                self.store_timeout,
                "inserting transition",
                self.store.insert_transition(event),
            )
            .await;
            match inserted {
                Ok(false) => {
                    debug!(event_id = %event.event_id, "Ignoring duplicate transition");
                    report.duplicate_events += 1;
                    continue;
                }
                Ok(true) => {}
                Err(e) => {
                    warn!(event_id = %event.event_id, error = %e, "Failed to persist transition");
                    report.writes_failed += 1;
                }
            }

            let Some(row) = self.load_row(&key).await else {
                report.rows_skipped += 1;
                continue;
            };

            let mut state = TrackedState::from(&row);
            let mut patch = RowPatch::new();
            patch
                .text("latest_status", Some(event.setup.status.as_str()), WriteRule::Overwrite)
                .time("last_seen_at", Some(ts), WriteRule::Overwrite)
                .time("updated_at", Some(ts), WriteRule::Overwrite);

            if !state.triggered {
                let triggered_at = event
                    .setup
                    .triggered_at
                    .or((event.to_phase == TransitionPhase::Triggered).then_some(ts));
                if triggered_at.is_some() {
                    patch.time("triggered_at", triggered_at, WriteRule::FillIfNull);
                    state.triggered = true;
                }
            }

            match event.to_phase {
                TransitionPhase::Target1Hit if !state.t1_hit => {
                    patch.time("t1_hit_at", Some(ts), WriteRule::FillIfNull);
                    state.t1_hit = true;
                }
                TransitionPhase::Target2Hit => {
                    patch
                        .time("t1_hit_at", Some(ts), WriteRule::FillIfNull)
                        .time("t2_hit_at", Some(ts), WriteRule::FillIfNull);
                    state.t1_hit = true;
                    state.t2_hit = true;
                }
                TransitionPhase::Invalidated if event.reason.as_deref() == Some("stop") && !state.stop_hit => {
                    patch.time("stop_hit_at", Some(ts), WriteRule::FillIfNull);
                    state.stop_hit = true;
                }
                _ => {}
            }

            let resolution = resolve_from_transition(event.to_phase, event.reason.as_deref(), &state);
            if let Some(resolution) = &resolution {
                outcome_columns(&mut patch, resolution, Some(ts));
            }

            match self.write_patch(&key, &patch).await {
                Ok(true) => {
                    if let Some(resolution) = resolution {
                        report.outcomes_written += 1;
                        self.record_touch(&row, resolution.outcome, Some(ts));
                    }
                }
                Ok(false) => report.rows_skipped += 1,
                Err(e) => {
                    warn!(setup = %key, error = %e, "Failed to apply transition");
                    report.writes_failed += 1;
                }
            }
        }

        report
    }

    /// Writes backtest-derived outcomes. Rows without a trigger, and rows
    /// whose sequencing was ambiguous, are skipped.
    #[instrument(skip(self, rows), fields(count = rows.len()))]
    pub async fn persist_backtest_rows(
        &self,
        rows: &[OutcomeRow],
        observed_at: Option<DateTime<Utc>>,
    ) -> ResolveReport {
        let observed_at = observed_at.unwrap_or_else(Utc::now);
        let mut report = ResolveReport::default();
        let mut dropped_columns: HashSet<String> = HashSet::new();

        for row in rows {
            report.rows_seen += 1;
            if row.ambiguous || (!row.is_triggered() && row.final_outcome.is_none()) {
                report.rows_skipped += 1;
                continue;
            }
            let key = row.key();

            let mut patch = RowPatch::new();
            patch
                .time("updated_at", Some(observed_at), WriteRule::Overwrite)
                .time("last_seen_at", Some(observed_at), WriteRule::Overwrite)
                .time("triggered_at", row.triggered_at, WriteRule::FillIfNull)
                .time("t1_hit_at", row.t1_hit_at, WriteRule::FillIfNull)
                .time("t2_hit_at", row.t2_hit_at, WriteRule::FillIfNull)
                .time("stop_hit_at", row.stop_hit_at, WriteRule::FillIfNull);
            if row.realized_r.is_some_and(f64::is_finite) {
                patch.real("realized_r", row.realized_r, WriteRule::FillIfNull);
            }
            if row.entry_fill_price.is_some_and(f64::is_finite) {
                patch.real("entry_fill_price", row.entry_fill_price, WriteRule::FillIfNull);
            }
            if let Some(outcome) = row.final_outcome {
                let resolution = OutcomeResolution {
                    outcome,
                    reason: final_reason_for(outcome).to_string(),
                };
                let resolved_at = resolved_at_for(row.t2_hit_at, row.stop_hit_at, row.t1_hit_at, row.triggered_at);
                let status = if outcome == FinalOutcome::StopBeforeT1 {
                    SetupStatus::Invalidated
                } else {
                    SetupStatus::Expired
                };
                outcome_columns(&mut patch, &resolution, resolved_at);
                patch.text("latest_status", Some(status.as_str()), WriteRule::WhileUnresolved);
            }

            let dropped: Vec<&str> = dropped_columns.iter().map(String::as_str).collect();
            let mut patch = patch.without(&dropped);

            let mut written = self.write_patch(&key, &patch).await;
            if let Err(e) = &written {
                if is_missing_column_error(e) {
                    let missing: Vec<String> = match missing_column_name(e) {
                        Some(name) if patch.contains(&name) => vec![name],
                        _ => PROFITABILITY_COLUMNS
                            .iter()
                            .filter(|c| patch.contains(c))
                            .map(|c| c.to_string())
                            .collect(),
                    };
                    if !missing.is_empty() {
                        warn!(setup = %key, columns = ?missing, "Column missing, retrying without it");
                        report.schema_fallbacks += 1;
                        let names: Vec<&str> = missing.iter().map(String::as_str).collect();
                        patch = patch.without(&names);
                        dropped_columns.extend(missing);
                        written = self.write_patch(&key, &patch).await;
                    }
                }
            }

            match written {
                Ok(true) => {
                    if let Some(outcome) = row.final_outcome {
                        report.outcomes_written += 1;
                        if let Some(stored) = self.load_row(&key).await {
                            let touched_at =
                                resolved_at_for(row.t2_hit_at, row.stop_hit_at, row.t1_hit_at, row.triggered_at);
                            self.record_touch(&stored, outcome, touched_at);
                        }
                    }
                }
                Ok(false) => report.rows_skipped += 1,
                Err(e) => {
                    warn!(setup = %key, error = %e, "Failed to persist backtest row");
                    report.writes_failed += 1;
                }
            }
        }

        info!(
            "Persisted backtest rows: {} written, {} skipped, {} failed",
            report.outcomes_written, report.rows_skipped, report.writes_failed
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::SqliteStore;
    use crate::types::{Direction, EntryZone, SetupMetadata};
    use chrono::{NaiveDate, TimeZone};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 14, minute, 0).unwrap()
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
            p_win_calibrated: None,
            ev_r: None,
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

    fn event(id: &str, setup: &SetupInstance, to_phase: TransitionPhase, reason: Option<&str>, ts: DateTime<Utc>) -> TransitionEvent {
        TransitionEvent {
            event_id: id.to_string(),
            setup: setup.clone(),
            from_phase: None,
            to_phase,
            reason: reason.map(str::to_string),
            price: None,
            timestamp: ts,
        }
    }

    async fn create_resolver() -> (Arc<SqliteStore>, OutcomeResolver) {
        let store = SqliteStore::in_memory().await.unwrap();
        let resolver = OutcomeResolver::new(store.clone(), None, Duration::from_secs(5));
        (store, resolver)
    }

    #[tokio::test]
    async fn test_stop_breach_resolves_once() {
        let (store, resolver) = create_resolver().await;

        let mut setup = create_test_setup("s-stop");
        setup.status = SetupStatus::Invalidated;
        setup.invalidation_reason = Some(STOP_BREACH_REASON.to_string());
        setup.triggered_at = Some(at(5));
        setup.status_updated_at = Some(at(12));

        let report = resolver.resolve_outcomes(&[setup.clone()], Some(at(13))).await;
        assert_eq!(report.outcomes_written, 1);
        assert_eq!(report.writes_failed, 0);

        let row = store.get_setup(&setup.key()).await.unwrap().unwrap();
        assert_eq!(row.final_outcome, Some(FinalOutcome::StopBeforeT1));
        assert_eq!(row.final_reason.as_deref(), Some(STOP_BREACH_REASON));
        assert_eq!(row.stop_hit_at, Some(at(12)));
        assert_eq!(row.resolved_at, Some(at(12)));

        setup.status_updated_at = Some(at(20));
        let again = resolver.resolve_outcomes(&[setup.clone()], Some(at(21))).await;
        assert_eq!(again.outcomes_written, 0);
        let row = store.get_setup(&setup.key()).await.unwrap().unwrap();
        assert_eq!(row.resolved_at, Some(at(12)));
        assert_eq!(row.stop_hit_at, Some(at(12)));
    }

    #[tokio::test]
    async fn test_untriggered_expiry_stays_unresolved() {
        let (store, resolver) = create_resolver().await;

        let mut setup = create_test_setup("s-idle");
        setup.status = SetupStatus::Expired;
        let report = resolver.resolve_outcomes(&[setup.clone()], Some(at(30))).await;
        assert_eq!(report.outcomes_written, 0);

        let row = store.get_setup(&setup.key()).await.unwrap().unwrap();
        assert!(row.final_outcome.is_none());
        assert_eq!(row.last_seen_at, Some(at(30)));
    }

    #[tokio::test]
    async fn test_transition_sequence() {
        let (store, resolver) = create_resolver().await;

        let mut triggered = create_test_setup("s-flow");
        triggered.status = SetupStatus::Triggered;
        triggered.triggered_at = Some(at(5));
        let mut stopped = triggered.clone();
        stopped.status = SetupStatus::Invalidated;
        stopped.invalidation_reason = Some(STOP_BREACH_REASON.to_string());

        let events = vec![
            event("e-1", &triggered, TransitionPhase::Triggered, None, at(5)),
            event("e-2", &triggered, TransitionPhase::Target1Hit, None, at(9)),
            event("e-3", &stopped, TransitionPhase::Invalidated, Some("stop"), at(15)),
        ];
        let report = resolver.apply_transitions(&events).await;
        assert_eq!(report.outcomes_written, 1);
        assert_eq!(report.writes_failed, 0);

        let row = store.get_setup(&triggered.key()).await.unwrap().unwrap();
        assert_eq!(row.final_outcome, Some(FinalOutcome::T1BeforeStop));
        assert_eq!(row.final_reason.as_deref(), Some("stop_after_target1"));
        assert_eq!(row.triggered_at, Some(at(5)));
        assert_eq!(row.t1_hit_at, Some(at(9)));
        assert_eq!(row.status, SetupStatus::Invalidated);

        let replay = resolver.apply_transitions(&events).await;
        assert_eq!(replay.duplicate_events, 3);
        assert_eq!(replay.outcomes_written, 0);
        let row = store.get_setup(&triggered.key()).await.unwrap().unwrap();
        assert_eq!(row.final_outcome, Some(FinalOutcome::T1BeforeStop));
    }

    #[tokio::test]
    async fn test_target2_transition_implies_target1() {
        let (store, resolver) = create_resolver().await;

        let mut setup = create_test_setup("s-t2");
        setup.status = SetupStatus::Triggered;
        setup.triggered_at = Some(at(3));

        let report = resolver
            .apply_transitions(&[event("e-t2", &setup, TransitionPhase::Target2Hit, None, at(20))])
            .await;
        assert_eq!(report.outcomes_written, 1);

        let row = store.get_setup(&setup.key()).await.unwrap().unwrap();
        assert_eq!(row.final_outcome, Some(FinalOutcome::T2BeforeStop));
        assert_eq!(row.t1_hit_at, Some(at(20)));
        assert_eq!(row.t2_hit_at, Some(at(20)));
        assert_eq!(row.resolved_at, Some(at(20)));
    }

    fn backtest_row(setup: &SetupInstance) -> OutcomeRow {
        let mut row = OutcomeRow::from(setup);
        row.triggered_at = Some(at(5));
        row.t1_hit_at = Some(at(9));
        row.final_outcome = Some(FinalOutcome::T1BeforeStop);
        row.realized_r = Some(0.62);
        row.entry_fill_price = Some(5001.2);
        row
    }

    #[tokio::test]
    async fn test_persist_backtest_rows() {
        let (store, resolver) = create_resolver().await;

        let resolved = create_test_setup("s-bt");
        let ambiguous = create_test_setup("s-amb");
        let idle = create_test_setup("s-idle");
        for setup in [&resolved, &ambiguous, &idle] {
            store.upsert_setup(setup).await.unwrap();
        }

        let mut ambiguous_row = OutcomeRow::from(&ambiguous);
        ambiguous_row.triggered_at = Some(at(6));
        ambiguous_row.ambiguous = true;

        let rows = vec![backtest_row(&resolved), ambiguous_row, OutcomeRow::from(&idle)];
        let report = resolver.persist_backtest_rows(&rows, Some(at(40))).await;
        assert_eq!(report.rows_seen, 3);
        assert_eq!(report.rows_skipped, 2);
        assert_eq!(report.outcomes_written, 1);

        let row = store.get_setup(&resolved.key()).await.unwrap().unwrap();
        assert_eq!(row.final_outcome, Some(FinalOutcome::T1BeforeStop));
        assert_eq!(row.final_reason.as_deref(), Some("target1_then_stop_or_expiry"));
        assert_eq!(row.resolved_at, Some(at(9)));
        assert_eq!(row.realized_r, Some(0.62));
        assert_eq!(row.entry_fill_price, Some(5001.2));
        assert_eq!(row.status, SetupStatus::Expired);

        let ambiguous = store.get_setup(&ambiguous.key()).await.unwrap().unwrap();
        assert!(ambiguous.triggered_at.is_none());

        let mut later = backtest_row(&resolved);
        later.final_outcome = Some(FinalOutcome::StopBeforeT1);
        later.realized_r = Some(-1.0);
        resolver.persist_backtest_rows(&[later], Some(at(50))).await;
        let row = store.get_setup(&resolved.key()).await.unwrap().unwrap();
        assert_eq!(row.final_outcome, Some(FinalOutcome::T1BeforeStop));
        assert_eq!(row.realized_r, Some(0.62));
    }

    #[tokio::test]
    async fn test_persist_without_profitability_columns() {
        let (store, resolver) = create_resolver().await;
        let first = create_test_setup("s-a");
        let second = create_test_setup("s-b");
        store.upsert_setup(&first).await.unwrap();
        store.upsert_setup(&second).await.unwrap();
        sqlx::query("ALTER TABLE setup_instances DROP COLUMN realized_r")
            .execute(store.pool())
            .await
            .unwrap();

        let report = resolver
            .persist_backtest_rows(&[backtest_row(&first), backtest_row(&second)], Some(at(40)))
            .await;
        assert_eq!(report.schema_fallbacks, 1);
        assert_eq!(report.outcomes_written, 2);
        assert_eq!(report.writes_failed, 0);

        let row = store.get_setup(&second.key()).await.unwrap().unwrap();
        assert_eq!(row.final_outcome, Some(FinalOutcome::T1BeforeStop));
        assert_eq!(row.entry_fill_price, Some(5001.2));
        assert!(row.realized_r.is_none());
    }
}
