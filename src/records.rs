//! Capture record types shared between the scheduler, ledger and backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Partition key for the delivery queue. Entries of the same kind are
/// delivered FIFO; no ordering is guaranteed across kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    AppActivity,
    Screenshot,
    IdleSession,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [
        RecordKind::AppActivity,
        RecordKind::Screenshot,
        RecordKind::IdleSession,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::AppActivity => "app_activity",
            RecordKind::Screenshot => "screenshot",
            RecordKind::IdleSession => "idle_session",
        }
    }

    pub fn parse(s: &str) -> Option<RecordKind> {
        match s {
            "app_activity" => Some(RecordKind::AppActivity),
            "screenshot" => Some(RecordKind::Screenshot),
            "idle_session" => Some(RecordKind::IdleSession),
            _ => None,
        }
    }
}

/// A single observation produced by the capture scheduler.
///
/// Immutable once created; owned by the delivery queue until the backend
/// acknowledges it. `time_log_id` is `Some` only while the originating
/// tracking session is open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CaptureRecord {
    AppActivity {
        user_id: String,
        time_log_id: Option<String>,
        captured_at: DateTime<Utc>,
        app_name: String,
        window_title: String,
        app_path: Option<String>,
    },
    Screenshot {
        user_id: String,
        time_log_id: Option<String>,
        captured_at: DateTime<Utc>,
        image_url: String,
        activity_percent: u8,
    },
}

impl CaptureRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            CaptureRecord::AppActivity { .. } => RecordKind::AppActivity,
            CaptureRecord::Screenshot { .. } => RecordKind::Screenshot,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            CaptureRecord::AppActivity { user_id, .. } => user_id,
            CaptureRecord::Screenshot { user_id, .. } => user_id,
        }
    }
}

/// A completed idle period within a tracking session.
///
/// Opened on the Active→Idle edge; the end timestamp and duration are
/// known once the user becomes active again (or tracking stops and the
/// open period is flushed). Only completed sessions enter the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdleSession {
    pub user_id: String,
    pub project_id: String,
    pub idle_start: DateTime<Utc>,
    pub idle_end: DateTime<Utc>,
    pub duration_minutes: f64,
}

/// One on-the-clock interval. Created by `Tracker::start`, closed by
/// `Tracker::stop`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingSession {
    pub id: String,
    pub user_id: String,
    pub task_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}
