//! Per-identity alert tracking for flagged matches.
//!
//! An identity is `Pending` from its first qualifying match until a
//! notification succeeds, then `Notified` until dismissed. Dismissal removes
//! it, so the next match starts over. Failed notifications are retried only
//! when the identity matches again.

use crate::notify::{NotificationError, NotificationSink};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use vigil_core::DetectionResult;
use vigil_store::WatchlistStore;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AlertError {
    #[error("no active alert for person {0}")]
    NotFound(String),
}

/// Who gets told, and how. Passed explicitly with every stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertContext {
    pub destination: Option<String>,
    pub custom_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertPhase {
    Pending,
    Notified,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertState {
    pub person_id: String,
    pub person_name: String,
    pub phase: AlertPhase,
    pub first_detected_at: DateTime<Utc>,
    pub last_detected_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub notification_sent: bool,
}

/// One notification attempt decided by [`AlertCoordinator::observe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertDispatch {
    pub person_id: String,
    pub destination: Option<String>,
    pub message: String,
    generation: u64,
}

struct Entry {
    state: AlertState,
    generation: u64,
    dispatching: bool,
}

struct Entries {
    active: HashMap<String, Entry>,
    next_generation: u64,
}

pub struct AlertCoordinator {
    watchlist: WatchlistStore,
    sink: Arc<dyn NotificationSink>,
    timeout: Duration,
    entries: Mutex<Entries>,
}

pub fn default_message(name: &str) -> String {
    format!("ALERT: {name} has been identified as FLAGGED.")
}

impl AlertCoordinator {
    pub fn new(watchlist: WatchlistStore, sink: Arc<dyn NotificationSink>, timeout: Duration) -> Self {
        Self {
            watchlist,
            sink,
            timeout,
            entries: Mutex::new(Entries {
                active: HashMap::new(),
                next_generation: 0,
            }),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one detection result to the alert states and return the
    /// notifications that should be attempted. Does no I/O.
    ///
    /// Persons are looked up in the current watchlist: a person deleted or
    /// unflagged since the match does not alert.
    pub fn observe(&self, result: &DetectionResult, ctx: &AlertContext) -> Vec<AlertDispatch> {
        let mut dispatches = Vec::new();
        let mut entries = self.entries();

        for person_id in result.matched_person_ids() {
            let Ok(person) = self.watchlist.get(person_id) else {
                continue;
            };
            if !person.is_flagged() {
                continue;
            }

            let message = ctx
                .custom_message
                .clone()
                .unwrap_or_else(|| default_message(&person.name));

            let Entries { active, next_generation } = &mut *entries;
            let entry = active.entry(person.id.clone()).or_insert_with(|| {
                *next_generation += 1;
                tracing::warn!(person_id = %person.id, name = %person.name, "flagged person detected");
                Entry {
                    state: AlertState {
                        person_id: person.id.clone(),
                        person_name: person.name.clone(),
                        phase: AlertPhase::Pending,
                        first_detected_at: result.timestamp,
                        last_detected_at: result.timestamp,
                        acknowledged: false,
                        notification_sent: false,
                    },
                    generation: *next_generation,
                    dispatching: false,
                }
            });

            entry.state.last_detected_at = entry.state.last_detected_at.max(result.timestamp);
            entry.state.person_name = person.name.clone();

            if entry.state.phase == AlertPhase::Pending && !entry.dispatching {
                entry.dispatching = true;
                dispatches.push(AlertDispatch {
                    person_id: person.id.clone(),
                    destination: ctx.destination.clone(),
                    message,
                    generation: entry.generation,
                });
            }
        }

        dispatches
    }

    /// Attempt one notification and record its outcome. If the alert was
    /// dismissed while the attempt was in flight, the outcome is discarded.
    pub async fn dispatch(&self, dispatch: AlertDispatch) -> Result<(), NotificationError> {
        let outcome = self.send(&dispatch).await;

        let mut entries = self.entries();
        let Some(entry) = entries
            .active
            .get_mut(&dispatch.person_id)
            .filter(|e| e.generation == dispatch.generation)
        else {
            tracing::debug!(person_id = %dispatch.person_id, "alert dismissed during notification");
            return outcome;
        };

        entry.dispatching = false;
        match &outcome {
            Ok(()) => {
                entry.state.phase = AlertPhase::Notified;
                entry.state.notification_sent = true;
                tracing::info!(person_id = %dispatch.person_id, "alert notification sent");
            }
            Err(e) => {
                tracing::warn!(
                    person_id = %dispatch.person_id,
                    error = %e,
                    "alert notification failed; will retry on next match"
                );
            }
        }
        outcome
    }

    async fn send(&self, dispatch: &AlertDispatch) -> Result<(), NotificationError> {
        let destination = dispatch
            .destination
            .clone()
            .ok_or(NotificationError::NoDestination)?;
        let sink = self.sink.clone();
        let message = dispatch.message.clone();

        // The blocking call cannot be cancelled; sinks bound their own work
        // (`CommandSink` kills its child at the same timeout).
        let call = tokio::task::spawn_blocking(move || sink.send_alert(&destination, &message));
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join)) => Err(NotificationError::Failed(format!("notification task: {join}"))),
            Err(_) => Err(NotificationError::Timeout(self.timeout)),
        }
    }

    /// Observe a result and spawn every resulting notification. Callers do
    /// not need to await the returned handles. Must run inside a tokio
    /// runtime.
    pub fn on_new_result(
        self: &Arc<Self>,
        result: &DetectionResult,
        ctx: &AlertContext,
    ) -> Vec<JoinHandle<()>> {
        self.observe(result, ctx)
            .into_iter()
            .map(|dispatch| {
                let coordinator = Arc::clone(self);
                tokio::spawn(async move {
                    let _ = coordinator.dispatch(dispatch).await;
                })
            })
            .collect()
    }

    /// End the alert for `person_id`. The next qualifying match alerts again.
    pub fn dismiss(&self, person_id: &str) -> Result<(), AlertError> {
        match self.entries().active.remove(person_id) {
            Some(_) => {
                tracing::info!(person_id, "alert dismissed");
                Ok(())
            }
            None => Err(AlertError::NotFound(person_id.to_string())),
        }
    }

    /// Silence the alarm for `person_id` without ending the alert.
    pub fn acknowledge(&self, person_id: &str) -> Result<(), AlertError> {
        let mut entries = self.entries();
        let entry = entries
            .active
            .get_mut(person_id)
            .ok_or_else(|| AlertError::NotFound(person_id.to_string()))?;
        entry.state.acknowledged = true;
        Ok(())
    }

    /// Active alerts, oldest first.
    pub fn active(&self) -> Vec<AlertState> {
        let mut states: Vec<AlertState> =
            self.entries().active.values().map(|e| e.state.clone()).collect();
        states.sort_by(|a, b| {
            a.first_detected_at
                .cmp(&b.first_detected_at)
                .then_with(|| a.person_id.cmp(&b.person_id))
        });
        states
    }

    pub fn phase(&self, person_id: &str) -> Option<AlertPhase> {
        self.entries().active.get(person_id).map(|e| e.state.phase)
    }

    /// True while any active alert is unacknowledged.
    pub fn alarm_active(&self) -> bool {
        self.entries().active.values().any(|e| !e.state.acknowledged)
    }
}
