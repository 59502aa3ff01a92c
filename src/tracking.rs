//! Tracking state machine: the on/off/paused control plane that gates all
//! capture producers.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture_scheduler::CaptureScheduler;
use crate::idle_monitor::{ActivityMeter, IdleCallback, IdleMonitor, SubscriberId};
use crate::records::{IdleSession, RecordKind, TrackingSession};
use crate::traits::DeliveryLedgerTrait;

/// Well-known fallback when a start request carries an unresolvable task
/// id. Matches the backend's seeded default task row.
pub const DEFAULT_TASK_ID: &str = "00000000-0000-0000-0000-000000000001";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingState {
    #[default]
    Stopped,
    Tracking,
    Paused,
}

impl fmt::Display for TrackingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrackingState::Stopped => "stopped",
            TrackingState::Tracking => "tracking",
            TrackingState::Paused => "paused",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("cannot {action} while {from}")]
    InvalidTransition {
        action: &'static str,
        from: TrackingState,
    },
}

/// Session identity handed to producers on each tick.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub time_log_id: String,
    pub user_id: String,
}

/// Shared gate consulted by the capture scheduler on every tick.
///
/// The gate is open only while state is `Tracking`; pausing closes it
/// without touching the session, so producers keep ticking but enqueue
/// nothing until resume.
#[derive(Default)]
pub struct TrackingGate {
    inner: Mutex<GateInner>,
}

#[derive(Default)]
struct GateInner {
    state: TrackingState,
    session: Option<TrackingSession>,
}

impl TrackingGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TrackingState {
        self.inner.lock().unwrap().state
    }

    /// `Some` only while tracking is active and not paused.
    pub fn capture_context(&self) -> Option<SessionContext> {
        let inner = self.inner.lock().unwrap();
        if inner.state != TrackingState::Tracking {
            return None;
        }
        inner.session.as_ref().map(|s| SessionContext {
            time_log_id: s.id.clone(),
            user_id: s.user_id.clone(),
        })
    }

    pub fn session(&self) -> Option<TrackingSession> {
        self.inner.lock().unwrap().session.clone()
    }

    #[cfg(test)]
    pub(crate) fn force(&self, state: TrackingState, session: Option<TrackingSession>) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = state;
        inner.session = session;
    }
}

/// Drives the tracking lifecycle: owns the session, the scheduler and the
/// idle subscription.
pub struct Tracker {
    gate: Arc<TrackingGate>,
    scheduler: Arc<CaptureScheduler>,
    idle_monitor: Arc<IdleMonitor>,
    meter: Arc<ActivityMeter>,
    ledger: Arc<dyn DeliveryLedgerTrait>,
    user_id: String,
    project_id: String,
    idle_subscription: Mutex<Option<SubscriberId>>,
    open_idle: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl Tracker {
    pub fn new(
        gate: Arc<TrackingGate>,
        scheduler: Arc<CaptureScheduler>,
        idle_monitor: Arc<IdleMonitor>,
        meter: Arc<ActivityMeter>,
        ledger: Arc<dyn DeliveryLedgerTrait>,
        user_id: String,
        project_id: String,
    ) -> Self {
        Self {
            gate,
            scheduler,
            idle_monitor,
            meter,
            ledger,
            user_id,
            project_id,
            idle_subscription: Mutex::new(None),
            open_idle: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> TrackingState {
        self.gate.state()
    }

    /// Open a tracking session and start the capture pipeline.
    ///
    /// Valid only from `Stopped`. An unresolvable task id is replaced with
    /// [`DEFAULT_TASK_ID`] rather than failing the session; the
    /// substitution is logged so misconfiguration stays visible.
    pub fn start(&self, task_id: &str) -> Result<TrackingSession, TrackingError> {
        // State and session are committed before anything can suspend, so
        // producers never observe a half-open session
        let session = {
            let mut inner = self.gate.inner.lock().unwrap();
            if inner.state != TrackingState::Stopped {
                return Err(TrackingError::InvalidTransition {
                    action: "start",
                    from: inner.state,
                });
            }
            let session = TrackingSession {
                id: uuid::Uuid::new_v4().to_string(),
                user_id: self.user_id.clone(),
                task_id: resolve_task_id(task_id),
                started_at: Utc::now(),
                ended_at: None,
            };
            inner.state = TrackingState::Tracking;
            inner.session = Some(session.clone());
            session
        };

        let subscription = self.idle_monitor.subscribe(self.idle_callback());
        *self.idle_subscription.lock().unwrap() = Some(subscription);
        self.scheduler.start();

        tracing::info!(
            session_id = %session.id,
            task_id = %session.task_id,
            user_id = %session.user_id,
            "Tracking started"
        );
        Ok(session)
    }

    /// Suspend capture without closing the session. Valid only from
    /// `Tracking`; producers keep ticking and notice on the next tick.
    pub fn pause(&self) -> Result<(), TrackingError> {
        let mut inner = self.gate.inner.lock().unwrap();
        if inner.state != TrackingState::Tracking {
            return Err(TrackingError::InvalidTransition {
                action: "pause",
                from: inner.state,
            });
        }
        inner.state = TrackingState::Paused;
        tracing::info!("Tracking paused");
        Ok(())
    }

    /// Re-open the gate. Valid only from `Paused`; the existing session
    /// continues, no new one is created.
    pub fn resume(&self) -> Result<(), TrackingError> {
        let mut inner = self.gate.inner.lock().unwrap();
        if inner.state != TrackingState::Paused {
            return Err(TrackingError::InvalidTransition {
                action: "resume",
                from: inner.state,
            });
        }
        inner.state = TrackingState::Tracking;
        tracing::info!("Tracking resumed");
        Ok(())
    }

    /// Close the session, stop the producers and flush any open idle
    /// period. Valid from `Tracking` or `Paused`.
    ///
    /// In-flight ticks may still enqueue after this returns; the delivery
    /// queue tolerates records arriving after logical stop.
    pub fn stop(&self) -> Result<TrackingSession, TrackingError> {
        let session = {
            let mut inner = self.gate.inner.lock().unwrap();
            let Some(mut session) = inner.session.take() else {
                return Err(TrackingError::InvalidTransition {
                    action: "stop",
                    from: inner.state,
                });
            };
            inner.state = TrackingState::Stopped;
            session.ended_at = Some(Utc::now());
            session
        };

        self.scheduler.stop();
        if let Some(subscription) = self.idle_subscription.lock().unwrap().take() {
            self.idle_monitor.unsubscribe(subscription);
        }
        self.flush_open_idle();
        self.meter.set_idle(false);

        tracing::info!(session_id = %session.id, "Tracking stopped");
        Ok(session)
    }

    fn idle_callback(&self) -> IdleCallback {
        let meter = self.meter.clone();
        let open_idle = self.open_idle.clone();
        let ledger = self.ledger.clone();
        let user_id = self.user_id.clone();
        let project_id = self.project_id.clone();

        Arc::new(move |event| {
            meter.set_idle(event.idle);
            if event.idle {
                let mut slot = open_idle.lock().unwrap();
                // At most one open idle period per tracking session.
                // Backdated to when input actually stopped, not to when the
                // threshold check noticed
                if slot.is_none() {
                    let started = Utc::now()
                        - chrono::Duration::from_std(event.idle_for)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                    *slot = Some(started);
                    tracing::info!(idle_for_secs = event.idle_for.as_secs(), "Idle period started");
                }
            } else if let Some(start) = open_idle.lock().unwrap().take() {
                enqueue_idle_session(&*ledger, &user_id, &project_id, start, Utc::now());
            }
        })
    }

    fn flush_open_idle(&self) {
        if let Some(start) = self.open_idle.lock().unwrap().take() {
            enqueue_idle_session(&*self.ledger, &self.user_id, &self.project_id, start, Utc::now());
        }
    }
}

fn resolve_task_id(raw: &str) -> String {
    match uuid::Uuid::parse_str(raw.trim()) {
        Ok(id) => id.to_string(),
        Err(_) => {
            tracing::warn!(
                task_id = %raw,
                fallback = DEFAULT_TASK_ID,
                "Task id is not a valid UUID — substituting the default task"
            );
            DEFAULT_TASK_ID.to_string()
        }
    }
}

fn enqueue_idle_session(
    ledger: &dyn DeliveryLedgerTrait,
    user_id: &str,
    project_id: &str,
    idle_start: DateTime<Utc>,
    idle_end: DateTime<Utc>,
) {
    let session = IdleSession {
        user_id: user_id.to_string(),
        project_id: project_id.to_string(),
        idle_start,
        idle_end,
        duration_minutes: (idle_end - idle_start).num_seconds() as f64 / 60.0,
    };

    let payload = match serde_json::to_value(&session) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize idle session");
            return;
        }
    };
    match ledger.enqueue(RecordKind::IdleSession, payload) {
        Ok(entry_id) => {
            tracing::info!(
                entry_id = %entry_id,
                duration_minutes = format!("{:.1}", session.duration_minutes),
                "Idle session enqueued"
            );
        }
        Err(e) => tracing::error!(error = %e, "Failed to enqueue idle session"),
    }
}
