//! Best-effort level-touch audit trail.
//!
//! Touches are queued on a bounded channel and written by a background
//! worker, so the primary outcome write never waits on them. The worker has
//! its own circuit breaker; a missing `level_touches` table disables the
//! channel for the rest of the process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::circuit_breaker::{ChannelState, CircuitBreaker};
use crate::storage::{is_missing_table_error, SetupStore};
use crate::types::{Direction, FinalOutcome, SetupInstance, SetupKey};

pub const LEVEL_TOUCH_CHANNEL: &str = "level_touches";

/// How price behaved at the setup's level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TouchClassification {
    Bounce,
    Break,
    Held,
    Unknown,
}

impl TouchClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            TouchClassification::Bounce => "bounce",
            TouchClassification::Break => "break",
            TouchClassification::Held => "held",
            TouchClassification::Unknown => "unknown",
        }
    }
}

impl From<FinalOutcome> for TouchClassification {
    fn from(outcome: FinalOutcome) -> Self {
        match outcome {
            FinalOutcome::T1BeforeStop | FinalOutcome::T2BeforeStop => TouchClassification::Bounce,
            FinalOutcome::StopBeforeT1 => TouchClassification::Break,
            FinalOutcome::ExpiredUnresolved => TouchClassification::Held,
            FinalOutcome::InvalidatedOther => TouchClassification::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LevelTouch {
    pub key: SetupKey,
    pub setup_type: String,
    pub direction: Direction,
    pub level_price: Option<f64>,
    pub classification: TouchClassification,
    pub final_outcome: FinalOutcome,
    pub touched_at: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

impl LevelTouch {
    /// Touch row for a freshly resolved setup.
    pub fn for_outcome(
        setup: &SetupInstance,
        outcome: FinalOutcome,
        touched_at: Option<DateTime<Utc>>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        let level_price = match outcome {
            FinalOutcome::T2BeforeStop => setup.target2_price.or(Some(setup.target1_price)),
            FinalOutcome::T1BeforeStop => Some(setup.target1_price),
            FinalOutcome::StopBeforeT1 => Some(setup.stop_price),
            FinalOutcome::ExpiredUnresolved => Some(setup.entry_zone.mid()),
            FinalOutcome::InvalidatedOther => None,
        };

        Self {
            key: setup.key(),
            setup_type: setup.setup_type.clone(),
            direction: setup.direction,
            level_price: level_price.filter(|p| p.is_finite()),
            classification: outcome.into(),
            final_outcome: outcome,
            touched_at,
            recorded_at,
        }
    }
}

/// Handle for queueing level touches.
pub struct LevelTouchRecorder {
    sender: mpsc::Sender<LevelTouch>,
    breaker: Arc<Mutex<CircuitBreaker>>,
    worker: JoinHandle<()>,
}

impl LevelTouchRecorder {
    /// Spawns the background writer.
    pub fn spawn(store: Arc<dyn SetupStore>, capacity: usize, breaker: CircuitBreaker) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let breaker = Arc::new(Mutex::new(breaker));
        let worker = LevelTouchWorker {
            receiver,
            store,
            breaker: breaker.clone(),
        };

        Self {
            sender,
            breaker,
            worker: tokio::spawn(worker.run()),
        }
    }

    /// Queues a touch without waiting. Returns false if it was dropped.
    pub fn record(&self, touch: LevelTouch) -> bool {
        match self.sender.try_send(touch) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(touch)) => {
                warn!(setup = %touch.key, "Level touch queue full, dropping touch");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub async fn is_enabled(&self) -> bool {
        self.breaker.lock().await.state(LEVEL_TOUCH_CHANNEL) != ChannelState::Disabled
    }

    /// Drains queued touches and stops the worker.
    pub async fn close(self) {
        drop(self.sender);
        if let Err(e) = self.worker.await {
            warn!(error = %e, "Level touch worker stopped abnormally");
        }
    }
}

struct LevelTouchWorker {
    receiver: mpsc::Receiver<LevelTouch>,
    store: Arc<dyn SetupStore>,
    breaker: Arc<Mutex<CircuitBreaker>>,
}

impl LevelTouchWorker {
    async fn run(mut self) {
        while let Some(touch) = self.receiver.recv().await {
            if !self.breaker.lock().await.is_available(LEVEL_TOUCH_CHANNEL) {
                debug!(setup = %touch.key, "Level touch channel unavailable, skipping");
                continue;
            }

            match self.store.record_level_touch(&touch).await {
                Ok(()) => {
                    self.breaker.lock().await.record_success(LEVEL_TOUCH_CHANNEL);
                    debug!(setup = %touch.key, classification = touch.classification.as_str(), "Recorded level touch");
                }
                Err(e) if is_missing_table_error(&e) => {
                    self.breaker
                        .lock()
                        .await
                        .disable(LEVEL_TOUCH_CHANNEL, &format!("{:#}", e));
                }
                Err(e) => {
                    self.breaker.lock().await.record_failure(LEVEL_TOUCH_CHANNEL);
                    warn!(setup = %touch.key, error = %e, "Failed to record level touch");
                }
            }
        }
    }
}
