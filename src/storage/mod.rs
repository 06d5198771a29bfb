//! Persistence contract for setup rows, transitions, level touches and
//! optimizer state.

pub mod sqlite;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::future::Future;
use std::time::Duration;

use crate::optimizer::OptimizerState;
use crate::outcome::{LevelTouch, TransitionEvent};
use crate::types::{DateRange, SetupInstance, SetupKey};

pub use sqlite::SqliteStore;

/// Formal contract for the relational store.
#[async_trait]
pub trait SetupStore: Send + Sync {
    /// Inserts or refreshes a setup row. Outcome fields already set on the
    /// stored row are never replaced.
    async fn upsert_setup(&self, setup: &SetupInstance) -> Result<()>;

    async fn get_setup(&self, key: &SetupKey) -> Result<Option<SetupInstance>>;

    /// Setups whose session date falls in `range`, ordered by session date.
    async fn list_setups(&self, range: DateRange) -> Result<Vec<SetupInstance>>;

    /// Applies a column patch to one row. Returns false if no row matched.
    async fn apply_patch(&self, key: &SetupKey, patch: &RowPatch) -> Result<bool>;

    /// Stores a transition event. Returns false for a duplicate event id.
    async fn insert_transition(&self, event: &TransitionEvent) -> Result<bool>;

    async fn record_level_touch(&self, touch: &LevelTouch) -> Result<()>;

    async fn load_optimizer_state(&self) -> Result<Option<OptimizerState>>;

    async fn save_optimizer_state(&self, state: &OptimizerState) -> Result<()>;

    /// Health check for the storage backend.
    async fn health_check(&self) -> Result<bool>;
}

/// Value bound into a patched column.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchValue {
    Text(Option<String>),
    Real(Option<f64>),
}

/// How a patched column treats the stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteRule {
    Overwrite,
    /// Only written when the stored value is null.
    FillIfNull,
    /// Only written while the row has no final outcome.
    WhileUnresolved,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatchColumn {
    pub column: &'static str,
    pub value: PatchValue,
    pub rule: WriteRule,
}

/// Ordered set of column writes for one row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowPatch {
    columns: Vec<PatchColumn>,
}

impl RowPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&mut self, column: &'static str, value: Option<&str>, rule: WriteRule) -> &mut Self {
        self.push(column, PatchValue::Text(value.map(str::to_string)), rule)
    }

    pub fn time(&mut self, column: &'static str, value: Option<DateTime<Utc>>, rule: WriteRule) -> &mut Self {
        self.push(column, PatchValue::Text(value.map(timestamp_text)), rule)
    }

    pub fn real(&mut self, column: &'static str, value: Option<f64>, rule: WriteRule) -> &mut Self {
        self.push(column, PatchValue::Real(value.filter(|v| v.is_finite())), rule)
    }

    fn push(&mut self, column: &'static str, value: PatchValue, rule: WriteRule) -> &mut Self {
        self.columns.retain(|c| c.column != column);
        self.columns.push(PatchColumn { column, value, rule });
        self
    }

    pub fn columns(&self) -> &[PatchColumn] {
        &self.columns
    }

    pub fn contains(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c.column == column)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Copy of the patch without the named columns.
    pub fn without(&self, dropped: &[&str]) -> RowPatch {
        RowPatch {
            columns: self
                .columns
                .iter()
                .filter(|c| !dropped.contains(&c.column))
                .cloned()
                .collect(),
        }
    }
}

/// Canonical text form for stored timestamps.
pub fn timestamp_text(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn error_text(err: &anyhow::Error) -> String {
    format!("{:#}", err).to_lowercase()
}

/// The store reported a column that does not exist.
pub fn is_missing_column_error(err: &anyhow::Error) -> bool {
    let message = error_text(err);
    (message.contains("column") && message.contains("does not exist"))
        || (message.contains("could not find") && message.contains("column"))
        || message.contains("no such column")
        || message.contains("has no column named")
}

/// The store reported a table that does not exist.
pub fn is_missing_table_error(err: &anyhow::Error) -> bool {
    let message = error_text(err);
    message.contains("no such table")
        || message.contains("could not find the table")
        || (message.contains("relation") && message.contains("does not exist"))
}

/// Column name named by a missing-column error, when the message carries one.
pub fn missing_column_name(err: &anyhow::Error) -> Option<String> {
    let message = error_text(err);
    let tail = ["has no column named ", "no such column: "]
        .iter()
        .find_map(|marker| message.find(marker).map(|at| &message[at + marker.len()..]))?;
    let name: String = tail
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '.')
        .collect();
    let name = name.rsplit('.').next().unwrap_or_default().to_string();
    (!name.is_empty()).then_some(name)
}

/// Runs a store call under a deadline.
pub async fn with_timeout<T, F>(limit: Duration, what: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("Timed out after {:?} while {}", limit, what)),
    }
}
