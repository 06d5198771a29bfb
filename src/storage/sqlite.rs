//! SQLite implementation of `SetupStore`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::{is_missing_table_error, timestamp_text, PatchValue, RowPatch, SetupStore, WriteRule};
use crate::optimizer::{OptimizationProfile, OptimizerState, Scorecard};
use crate::outcome::{LevelTouch, TransitionEvent};
use crate::types::{DateRange, EntryZone, FinalOutcome, SetupInstance, SetupKey, SetupMetadata};

const ACTIVE_STATE_ID: &str = "active";

#[derive(FromRow)]
struct SetupRow {
    engine_setup_id: String,
    session_date: NaiveDate,
    setup_type: String,
    direction: String,
    regime: Option<String>,
    tier: Option<String>,
    entry_zone_low: f64,
    entry_zone_high: f64,
    stop_price: f64,
    target_1_price: f64,
    target_2_price: Option<f64>,
    p_win_calibrated: Option<f64>,
    ev_r: Option<f64>,
    latest_status: String,
    latest_invalidation_reason: Option<String>,
    first_seen_at: Option<DateTime<Utc>>,
    last_seen_at: Option<DateTime<Utc>>,
    status_updated_at: Option<DateTime<Utc>>,
    triggered_at: Option<DateTime<Utc>>,
    t1_hit_at: Option<DateTime<Utc>>,
    t2_hit_at: Option<DateTime<Utc>>,
    stop_hit_at: Option<DateTime<Utc>>,
    final_outcome: Option<String>,
    final_reason: Option<String>,
    resolved_at: Option<DateTime<Utc>>,
    #[sqlx(default)]
    realized_r: Option<f64>,
    #[sqlx(default)]
    entry_fill_price: Option<f64>,
    metadata: Json<SetupMetadata>,
}

impl TryFrom<SetupRow> for SetupInstance {
    type Error = anyhow::Error;

    fn try_from(row: SetupRow) -> Result<Self> {
        Ok(SetupInstance {
            direction: row.direction.parse()?,
            status: row.latest_status.parse()?,
            final_outcome: row
                .final_outcome
                .as_deref()
                .map(str::parse::<FinalOutcome>)
                .transpose()?,
            engine_setup_id: row.engine_setup_id,
            session_date: row.session_date,
            setup_type: row.setup_type,
            regime: row.regime,
            tier: row.tier,
            entry_zone: EntryZone {
                low: row.entry_zone_low,
                high: row.entry_zone_high,
            },
            stop_price: row.stop_price,
            target1_price: row.target_1_price,
            target2_price: row.target_2_price,
            p_win_calibrated: row.p_win_calibrated,
            ev_r: row.ev_r,
            invalidation_reason: row.latest_invalidation_reason,
            first_seen_at: row.first_seen_at,
            last_seen_at: row.last_seen_at,
            status_updated_at: row.status_updated_at,
            triggered_at: row.triggered_at,
            t1_hit_at: row.t1_hit_at,
            t2_hit_at: row.t2_hit_at,
            stop_hit_at: row.stop_hit_at,
            final_reason: row.final_reason,
            resolved_at: row.resolved_at,
            realized_r: row.realized_r,
            entry_fill_price: row.entry_fill_price,
            metadata: row.metadata.0,
        })
    }
}

#[derive(FromRow)]
struct OptimizerStateRow {
    profile: Json<OptimizationProfile>,
    scorecard: Option<Json<Scorecard>>,
    scan_from: Option<NaiveDate>,
    scan_to: Option<NaiveDate>,
    training_from: Option<NaiveDate>,
    training_to: Option<NaiveDate>,
    validation_from: Option<NaiveDate>,
    validation_to: Option<NaiveDate>,
    updated_at: DateTime<Utc>,
}

fn range_of(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Option<DateRange> {
    match (from, to) {
        (Some(from), Some(to)) => DateRange::new(from, to).ok(),
        _ => None,
    }
}

/// SQLite-backed store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connects to `database_url` and creates missing tables.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Arc<Self>> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("Failed to connect to SQLite database")?;

        let store = Self { pool };
        store.create_tables().await?;
        info!("Setup store ready at {}", database_url);
        Ok(Arc::new(store))
    }

    /// Private in-memory database; a single connection keeps one schema.
    pub async fn in_memory() -> Result<Arc<Self>> {
        Self::connect("sqlite::memory:", 1).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn create_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS setup_instances (
                engine_setup_id TEXT NOT NULL,
                session_date TEXT NOT NULL,
                setup_type TEXT NOT NULL,
                direction TEXT NOT NULL,
                regime TEXT,
                tier TEXT,
                entry_zone_low REAL NOT NULL,
                entry_zone_high REAL NOT NULL,
                stop_price REAL NOT NULL,
                target_1_price REAL NOT NULL,
                target_2_price REAL,
                p_win_calibrated REAL,
                ev_r REAL,
                latest_status TEXT NOT NULL,
                latest_invalidation_reason TEXT,
                first_seen_at TEXT,
                last_seen_at TEXT,
                status_updated_at TEXT,
                triggered_at TEXT,
                t1_hit_at TEXT,
                t2_hit_at TEXT,
                stop_hit_at TEXT,
                final_outcome TEXT,
                final_reason TEXT,
                resolved_at TEXT,
                realized_r REAL,
                entry_fill_price REAL,
                metadata TEXT NOT NULL DEFAULT '{}',
                updated_at TEXT NOT NULL,
                PRIMARY KEY (engine_setup_id, session_date)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create setup_instances table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_setup_instances_session
            ON setup_instances(session_date);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create setup_instances index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS setup_transitions (
                event_id TEXT PRIMARY KEY,
                engine_setup_id TEXT NOT NULL,
                session_date TEXT NOT NULL,
                from_phase TEXT,
                to_phase TEXT NOT NULL,
                reason TEXT,
                price REAL,
                event_ts TEXT NOT NULL,
                payload TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create setup_transitions table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS level_touches (
                setup_instance_id TEXT PRIMARY KEY,
                engine_setup_id TEXT NOT NULL,
                session_date TEXT NOT NULL,
                setup_type TEXT NOT NULL,
                direction TEXT NOT NULL,
                level_price REAL,
                outcome TEXT NOT NULL,
                final_outcome TEXT NOT NULL,
                touched_at TEXT,
                recorded_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create level_touches table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS optimizer_state (
                id TEXT PRIMARY KEY,
                profile TEXT NOT NULL,
                scorecard TEXT,
                scan_from TEXT,
                scan_to TEXT,
                training_from TEXT,
                training_to TEXT,
                validation_from TEXT,
                validation_to TEXT,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create optimizer_state table")?;

        Ok(())
    }
}

fn column_assignment(column: &str, rule: WriteRule) -> String {
    match rule {
        WriteRule::Overwrite => format!("{column} = ?"),
        WriteRule::FillIfNull => format!("{column} = COALESCE({column}, ?)"),
        WriteRule::WhileUnresolved => {
            format!("{column} = CASE WHEN final_outcome IS NULL THEN ? ELSE {column} END")
        }
    }
}

#[async_trait]
impl SetupStore for SqliteStore {
    #[instrument(skip(self, setup), fields(setup = %setup.key()))]
    async fn upsert_setup(&self, setup: &SetupInstance) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO setup_instances (
                engine_setup_id, session_date, setup_type, direction, regime, tier,
                entry_zone_low, entry_zone_high, stop_price, target_1_price, target_2_price,
                p_win_calibrated, ev_r, latest_status, latest_invalidation_reason,
                first_seen_at, last_seen_at, status_updated_at, triggered_at,
                t1_hit_at, t2_hit_at, stop_hit_at,
                final_outcome, final_reason, resolved_at, realized_r, entry_fill_price,
                metadata, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(engine_setup_id, session_date) DO UPDATE SET
                setup_type = excluded.setup_type,
                direction = excluded.direction,
                regime = excluded.regime,
                tier = excluded.tier,
                entry_zone_low = excluded.entry_zone_low,
                entry_zone_high = excluded.entry_zone_high,
                stop_price = excluded.stop_price,
                target_1_price = excluded.target_1_price,
                target_2_price = excluded.target_2_price,
                p_win_calibrated = excluded.p_win_calibrated,
                ev_r = excluded.ev_r,
                latest_status = excluded.latest_status,
                latest_invalidation_reason = excluded.latest_invalidation_reason,
                first_seen_at = COALESCE(setup_instances.first_seen_at, excluded.first_seen_at),
                last_seen_at = COALESCE(excluded.last_seen_at, setup_instances.last_seen_at),
                status_updated_at = COALESCE(excluded.status_updated_at, setup_instances.status_updated_at),
                triggered_at = COALESCE(setup_instances.triggered_at, excluded.triggered_at),
                t1_hit_at = COALESCE(setup_instances.t1_hit_at, excluded.t1_hit_at),
                t2_hit_at = COALESCE(setup_instances.t2_hit_at, excluded.t2_hit_at),
                stop_hit_at = COALESCE(setup_instances.stop_hit_at, excluded.stop_hit_at),
                final_reason = CASE WHEN setup_instances.final_outcome IS NULL
                    THEN excluded.final_reason ELSE setup_instances.final_reason END,
                resolved_at = CASE WHEN setup_instances.final_outcome IS NULL
                    THEN excluded.resolved_at ELSE setup_instances.resolved_at END,
                final_outcome = COALESCE(setup_instances.final_outcome, excluded.final_outcome),
                realized_r = COALESCE(setup_instances.realized_r, excluded.realized_r),
                entry_fill_price = COALESCE(setup_instances.entry_fill_price, excluded.entry_fill_price),
                metadata = excluded.metadata,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&setup.engine_setup_id)
        .bind(setup.session_date)
        .bind(&setup.setup_type)
        .bind(setup.direction.as_str())
        .bind(&setup.regime)
        .bind(&setup.tier)
        .bind(setup.entry_zone.low)
        .bind(setup.entry_zone.high)
        .bind(setup.stop_price)
        .bind(setup.target1_price)
        .bind(setup.target2_price)
        .bind(setup.p_win_calibrated)
        .bind(setup.ev_r)
        .bind(setup.status.as_str())
        .bind(&setup.invalidation_reason)
        .bind(setup.first_seen_at.map(timestamp_text))
        .bind(setup.last_seen_at.map(timestamp_text))
        .bind(setup.status_updated_at.map(timestamp_text))
        .bind(setup.triggered_at.map(timestamp_text))
        .bind(setup.t1_hit_at.map(timestamp_text))
        .bind(setup.t2_hit_at.map(timestamp_text))
        .bind(setup.stop_hit_at.map(timestamp_text))
        .bind(setup.final_outcome.map(|o| o.as_str()))
        .bind(&setup.final_reason)
        .bind(setup.resolved_at.map(timestamp_text))
        .bind(setup.realized_r)
        .bind(setup.entry_fill_price)
        .bind(Json(&setup.metadata))
        .bind(timestamp_text(Utc::now()))
        .execute(&self.pool)
        .await
        .context("Failed to upsert setup instance")?;

        Ok(())
    }

    async fn get_setup(&self, key: &SetupKey) -> Result<Option<SetupInstance>> {
        let row = sqlx::query_as::<_, SetupRow>(
            "SELECT * FROM setup_instances WHERE engine_setup_id = ? AND session_date = ?",
        )
        .bind(&key.engine_setup_id)
        .bind(key.session_date)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load setup instance")?;

        row.map(SetupInstance::try_from).transpose()
    }

    #[instrument(skip(self), fields(range = %range))]
    async fn list_setups(&self, range: DateRange) -> Result<Vec<SetupInstance>> {
        let rows = sqlx::query_as::<_, SetupRow>(
            r#"
            SELECT * FROM setup_instances
            WHERE session_date >= ? AND session_date <= ?
            ORDER BY session_date ASC, first_seen_at ASC, engine_setup_id ASC
            "#,
        )
        .bind(range.from)
        .bind(range.to)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load setup instances")?;

        let mut setups = Vec::with_capacity(rows.len());
        for row in rows {
            let key = format!("{}:{}", row.engine_setup_id, row.session_date);
            match SetupInstance::try_from(row) {
                Ok(setup) => setups.push(setup),
                Err(e) => warn!(setup = %key, error = %e, "Skipping unreadable setup row"),
            }
        }
        debug!("Loaded {} setup rows", setups.len());
        Ok(setups)
    }

    #[instrument(skip(self, patch), fields(setup = %key))]
    async fn apply_patch(&self, key: &SetupKey, patch: &RowPatch) -> Result<bool> {
        if patch.is_empty() {
            return Ok(false);
        }

        let assignments: Vec<String> = patch
            .columns()
            .iter()
            .map(|c| column_assignment(c.column, c.rule))
            .collect();
        let sql = format!(
            "UPDATE setup_instances SET {} WHERE engine_setup_id = ? AND session_date = ?",
            assignments.join(", ")
        );

        let mut query = sqlx::query(&sql);
        for column in patch.columns() {
            query = match &column.value {
                PatchValue::Text(value) => query.bind(value.clone()),
                PatchValue::Real(value) => query.bind(*value),
            };
        }

        let result = query
            .bind(&key.engine_setup_id)
            .bind(key.session_date)
            .execute(&self.pool)
            .await
            .context("Failed to update setup instance")?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, event), fields(event_id = %event.event_id))]
    async fn insert_transition(&self, event: &TransitionEvent) -> Result<bool> {
        let payload = serde_json::json!({
            "setupType": event.setup.setup_type,
            "direction": event.setup.direction,
        });

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO setup_transitions (
                event_id, engine_setup_id, session_date, from_phase, to_phase,
                reason, price, event_ts, payload
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.setup.engine_setup_id)
        .bind(event.setup.session_date)
        .bind(event.from_phase.map(|p| p.as_str()))
        .bind(event.to_phase.as_str())
        .bind(&event.reason)
        .bind(event.price)
        .bind(timestamp_text(event.timestamp))
        .bind(Json(payload))
        .execute(&self.pool)
        .await
        .context("Failed to insert setup transition")?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_level_touch(&self, touch: &LevelTouch) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO level_touches (
                setup_instance_id, engine_setup_id, session_date, setup_type, direction,
                level_price, outcome, final_outcome, touched_at, recorded_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(setup_instance_id) DO UPDATE SET
                level_price = excluded.level_price,
                outcome = excluded.outcome,
                final_outcome = excluded.final_outcome,
                touched_at = excluded.touched_at,
                recorded_at = excluded.recorded_at
            "#,
        )
        .bind(touch.key.to_string())
        .bind(&touch.key.engine_setup_id)
        .bind(touch.key.session_date)
        .bind(&touch.setup_type)
        .bind(touch.direction.as_str())
        .bind(touch.level_price)
        .bind(touch.classification.as_str())
        .bind(touch.final_outcome.as_str())
        .bind(touch.touched_at.map(timestamp_text))
        .bind(timestamp_text(touch.recorded_at))
        .execute(&self.pool)
        .await
        .context("Failed to record level touch")?;

        Ok(())
    }

    async fn load_optimizer_state(&self) -> Result<Option<OptimizerState>> {
        let row = sqlx::query_as::<_, OptimizerStateRow>(
            "SELECT * FROM optimizer_state WHERE id = ?",
        )
        .bind(ACTIVE_STATE_ID)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load optimizer state");

        let row = match row {
            Ok(row) => row,
            Err(e) if is_missing_table_error(&e) => {
                warn!(error = %e, "Optimizer state table missing");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        Ok(row.map(|row| OptimizerState {
            profile: row.profile.0,
            scorecard: row.scorecard.map(|s| s.0),
            scan_range: range_of(row.scan_from, row.scan_to),
            training_range: range_of(row.training_from, row.training_to),
            validation_range: range_of(row.validation_from, row.validation_to),
            updated_at: row.updated_at,
        }))
    }

    #[instrument(skip(self, state))]
    async fn save_optimizer_state(&self, state: &OptimizerState) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO optimizer_state (
                id, profile, scorecard, scan_from, scan_to, training_from, training_to,
                validation_from, validation_to, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                profile = excluded.profile,
                scorecard = excluded.scorecard,
                scan_from = excluded.scan_from,
                scan_to = excluded.scan_to,
                training_from = excluded.training_from,
                training_to = excluded.training_to,
                validation_from = excluded.validation_from,
                validation_to = excluded.validation_to,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(ACTIVE_STATE_ID)
        .bind(Json(&state.profile))
        .bind(state.scorecard.as_ref().map(Json))
        .bind(state.scan_range.map(|r| r.from))
        .bind(state.scan_range.map(|r| r.to))
        .bind(state.training_range.map(|r| r.from))
        .bind(state.training_range.map(|r| r.to))
        .bind(state.validation_range.map(|r| r.from))
        .bind(state.validation_range.map(|r| r.to))
        .bind(timestamp_text(state.updated_at))
        .execute(&self.pool)
        .await
        .context("Failed to save optimizer state");

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_missing_table_error(&e) => {
                warn!(error = %e, "Optimizer state table missing, profile not persisted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn health_check(&self) -> Result<bool> {
        let one: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("Failed to run store health check")?;
        Ok(one == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::is_missing_column_error;
    use crate::types::{Direction, SetupStatus};
    use chrono::TimeZone;

    fn create_test_setup(id: &str, day: u32) -> SetupInstance {
        SetupInstance {
            engine_setup_id: id.to_string(),
            session_date: NaiveDate::from_ymd_opt(2026, 3, day).unwrap(),
            setup_type: "fade_at_wall".to_string(),
            direction: Direction::Bullish,
            regime: Some("ranging".to_string()),
            tier: Some("primary".to_string()),
            entry_zone: EntryZone { low: 5000.0, high: 5002.0 },
            stop_price: 4995.0,
            target1_price: 5010.0,
            target2_price: Some(5020.0),
            p_win_calibrated: Some(0.63),
            ev_r: Some(0.31),
            status: SetupStatus::Ready,
            invalidation_reason: None,
            first_seen_at: Some(Utc.with_ymd_and_hms(2026, 3, day, 14, 0, 0).unwrap()),
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

    #[tokio::test]
    async fn test_upsert_and_reload() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut setup = create_test_setup("s-1", 10);
        setup.metadata.confluence_score = Some(4.0);
        setup.metadata.extra.insert("rank".to_string(), serde_json::json!(2));
        store.upsert_setup(&setup).await.unwrap();

        let loaded = store.get_setup(&setup.key()).await.unwrap().unwrap();
        assert_eq!(loaded.setup_type, "fade_at_wall");
        assert_eq!(loaded.first_seen_at, setup.first_seen_at);
        assert_eq!(loaded.metadata.confluence_score, Some(4.0));
        assert_eq!(loaded.metadata.extra.get("rank"), Some(&serde_json::json!(2)));

        let range = DateRange::new(loaded.session_date, loaded.session_date).unwrap();
        assert_eq!(store.list_setups(range).await.unwrap().len(), 1);
        assert!(store.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_upsert_keeps_existing_outcome() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut setup = create_test_setup("s-1", 10);
        setup.triggered_at = Some(Utc.with_ymd_and_hms(2026, 3, 10, 14, 5, 0).unwrap());
        setup.final_outcome = Some(FinalOutcome::StopBeforeT1);
        setup.final_reason = Some("stop_breach_confirmed".to_string());
        store.upsert_setup(&setup).await.unwrap();

        setup.final_outcome = Some(FinalOutcome::T2BeforeStop);
        setup.final_reason = Some("target2_hit".to_string());
        setup.triggered_at = Some(Utc.with_ymd_and_hms(2026, 3, 10, 15, 0, 0).unwrap());
        store.upsert_setup(&setup).await.unwrap();

        let loaded = store.get_setup(&setup.key()).await.unwrap().unwrap();
        assert_eq!(loaded.final_outcome, Some(FinalOutcome::StopBeforeT1));
        assert_eq!(loaded.final_reason.as_deref(), Some("stop_breach_confirmed"));
        assert_eq!(loaded.triggered_at, Some(Utc.with_ymd_and_hms(2026, 3, 10, 14, 5, 0).unwrap()));
    }

    #[tokio::test]
    async fn test_patch_rules() {
        let store = SqliteStore::in_memory().await.unwrap();
        let setup = create_test_setup("s-1", 10);
        store.upsert_setup(&setup).await.unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 3, 10, 14, 10, 0).unwrap();

        let mut first = RowPatch::new();
        first
            .time("t1_hit_at", Some(t1), WriteRule::FillIfNull)
            .text("final_outcome", Some("t1_before_stop"), WriteRule::WhileUnresolved)
            .text("final_reason", Some("target1_then_expired"), WriteRule::WhileUnresolved);
        assert!(store.apply_patch(&setup.key(), &first).await.unwrap());

        let mut second = RowPatch::new();
        second
            .time("t1_hit_at", Some(t1 + chrono::Duration::minutes(5)), WriteRule::FillIfNull)
            .text("final_reason", Some("target2_hit"), WriteRule::WhileUnresolved)
            .text("final_outcome", Some("t2_before_stop"), WriteRule::WhileUnresolved)
            .text("latest_status", Some("expired"), WriteRule::Overwrite);
        assert!(store.apply_patch(&setup.key(), &second).await.unwrap());

        let loaded = store.get_setup(&setup.key()).await.unwrap().unwrap();
        assert_eq!(loaded.t1_hit_at, Some(t1));
        assert_eq!(loaded.final_outcome, Some(FinalOutcome::T1BeforeStop));
        assert_eq!(loaded.final_reason.as_deref(), Some("target1_then_expired"));
        assert_eq!(loaded.status, SetupStatus::Expired);

        let missing = SetupKey::new("nope", setup.session_date);
        assert!(!store.apply_patch(&missing, &second).await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_column_surfaces_missing_column_error() {
        let store = SqliteStore::in_memory().await.unwrap();
        let setup = create_test_setup("s-1", 10);
        store.upsert_setup(&setup).await.unwrap();
        sqlx::query("ALTER TABLE setup_instances DROP COLUMN realized_r")
            .execute(store.pool())
            .await
            .unwrap();

        let mut patch = RowPatch::new();
        patch.real("realized_r", Some(1.2), WriteRule::FillIfNull);
        let err = store.apply_patch(&setup.key(), &patch).await.unwrap_err();
        assert!(is_missing_column_error(&err));

        // reads tolerate the missing column
        let loaded = store.get_setup(&setup.key()).await.unwrap().unwrap();
        assert!(loaded.realized_r.is_none());
    }

    #[tokio::test]
    async fn test_optimizer_state_missing_table_is_soft() {
        let store = SqliteStore::in_memory().await.unwrap();
        sqlx::query("DROP TABLE optimizer_state")
            .execute(store.pool())
            .await
            .unwrap();

        assert!(store.load_optimizer_state().await.unwrap().is_none());
    }
}
