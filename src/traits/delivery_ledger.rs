//! Delivery ledger trait for at-least-once delivery

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::records::RecordKind;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(String),
    #[error("entry not found: {0}")]
    NotFound(String),
}

/// Status of a queue entry.
///
/// Transitions are monotonic: an entry never leaves `delivered`, and
/// `failed` entries stay in the retry pool until they are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    InFlight,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::InFlight => "in_flight",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> DeliveryStatus {
        match s {
            "in_flight" => DeliveryStatus::InFlight,
            "delivered" => DeliveryStatus::Delivered,
            "failed" => DeliveryStatus::Failed,
            _ => DeliveryStatus::Pending,
        }
    }
}

/// A capture record (or idle session) wrapped with delivery metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    pub kind: RecordKind,
    pub payload: serde_json::Value,
    pub status: DeliveryStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// Unix timestamp before which the entry must not be retried.
    pub next_retry_at: i64,
    pub created_at: i64,
    pub delivered_at: Option<i64>,
}

/// Trait for delivery queue operations
///
/// Production: SQLite with WAL mode
/// Testing: in-memory SQLite
pub trait DeliveryLedgerTrait: Send + Sync {
    /// Durably enqueue a record payload. Returns the entry id.
    fn enqueue(&self, kind: RecordKind, payload: serde_json::Value) -> Result<String, LedgerError>;

    /// Claim up to `limit` ready entries of one kind, FIFO by insertion
    /// order. Claimed entries become `in_flight`.
    fn claim_batch(&self, kind: RecordKind, limit: usize) -> Result<Vec<QueueEntry>, LedgerError>;

    /// Mark an in-flight entry as acknowledged by the backend.
    fn mark_delivered(&self, entry_id: &str) -> Result<(), LedgerError>;

    /// Record a failed attempt: bumps the attempt count and schedules the
    /// next retry with exponential backoff. Returns the new status.
    fn mark_failed(&self, entry_id: &str, error: &str) -> Result<DeliveryStatus, LedgerError>;

    /// Get entries by status
    fn get_by_status(&self, status: DeliveryStatus) -> Result<Vec<QueueEntry>, LedgerError>;

    /// Get queue statistics
    fn get_stats(&self) -> Result<LedgerStats, LedgerError>;

    /// Return entries stuck in-flight from a crashed run to the retry
    /// pool. Called once at startup.
    fn recover_orphans(&self) -> Result<usize, LedgerError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerStats {
    pub pending: usize,
    pub in_flight: usize,
    pub delivered_today: usize,
    pub failed: usize,
    /// Entries past the configured attempt budget. They stay in the retry
    /// pool; this count exists so operators can alert on it.
    pub exhausted: usize,
}
