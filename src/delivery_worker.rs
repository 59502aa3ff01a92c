//! Background delivery worker.
//!
//! Polls the capture queue and submits pending entries to the backend in
//! per-kind batches. Acknowledgments are applied per entry, so a partial
//! batch failure never penalizes the accepted members. Confirmed
//! screenshot captures are republished on the fan-out hub — only after
//! the backend durably acknowledged them, never speculatively.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::fanout::FanoutHub;
use crate::records::RecordKind;
use crate::traits::{BackendClient, DeliveryLedgerTrait, QueueEntry};

/// Channel carrying confirmed screenshot capture events.
pub const SCREENSHOT_CHANNEL: &str = "screenshotCaptured";

/// Result of processing one delivery pass across all record kinds.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub delivered: usize,
    pub failed: usize,
}

/// Claim and submit one batch per record kind.
pub async fn process_batch(
    ledger: &dyn DeliveryLedgerTrait,
    backend: &dyn BackendClient,
    fanout: &FanoutHub,
    batch_size: usize,
) -> BatchResult {
    let mut result = BatchResult::default();

    for kind in RecordKind::ALL {
        let entries = match ledger.claim_batch(kind, batch_size) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(kind = kind.as_str(), error = %e, "Failed to claim batch");
                continue;
            }
        };
        if entries.is_empty() {
            continue;
        }

        match backend.submit_batch(kind, &entries).await {
            Ok(outcomes) => {
                for entry in &entries {
                    match outcomes.iter().find(|o| o.entry_id == entry.id) {
                        Some(outcome) if outcome.accepted => {
                            if ledger.mark_delivered(&entry.id).is_ok() {
                                result.delivered += 1;
                                publish_confirmed(fanout, entry);
                            }
                        }
                        Some(outcome) => {
                            let error = outcome
                                .error
                                .clone()
                                .unwrap_or_else(|| "rejected by backend".to_string());
                            if ledger.mark_failed(&entry.id, &error).is_ok() {
                                result.failed += 1;
                            }
                        }
                        None => {
                            // The backend ack must cover every submitted
                            // entry; a hole is treated as a failed attempt
                            tracing::warn!(
                                entry_id = %entry.id,
                                kind = kind.as_str(),
                                "Backend response missing acknowledgment for entry"
                            );
                            if ledger.mark_failed(&entry.id, "missing acknowledgment").is_ok() {
                                result.failed += 1;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    kind = kind.as_str(),
                    entries = entries.len(),
                    error = %e,
                    retryable = e.is_retryable(),
                    "Batch submission failed"
                );
                for entry in &entries {
                    if ledger.mark_failed(&entry.id, &e.to_string()).is_ok() {
                        result.failed += 1;
                    }
                }
            }
        }
    }

    if result.delivered > 0 || result.failed > 0 {
        tracing::info!(
            delivered = result.delivered,
            failed = result.failed,
            "Delivery batch processed"
        );
    }
    result
}

/// Republish a durably acknowledged entry to live dashboards.
fn publish_confirmed(fanout: &FanoutHub, entry: &QueueEntry) {
    if entry.kind != RecordKind::Screenshot {
        return;
    }
    let payload = &entry.payload;
    let event = serde_json::json!({
        "screenshotCaptured": {
            "id": entry.id,
            "image_url": payload.get("image_url").cloned().unwrap_or(serde_json::Value::Null),
            "captured_at": payload.get("captured_at").cloned().unwrap_or(serde_json::Value::Null),
            "activity_percent": payload.get("activity_percent").cloned().unwrap_or(serde_json::Value::Null),
            "userId": payload.get("user_id").cloned().unwrap_or(serde_json::Value::Null),
        }
    });
    if let Err(e) = fanout.publish(SCREENSHOT_CHANNEL, event) {
        // Best-effort broadcast; the record itself is already safe
        tracing::warn!(entry_id = %entry.id, error = %e, "Failed to publish screenshot event");
    }
}

/// Spawn the background delivery loop. Returns the JoinHandle for shutdown.
pub fn spawn_worker(
    ledger: Arc<dyn DeliveryLedgerTrait>,
    backend: Arc<dyn BackendClient>,
    fanout: Arc<FanoutHub>,
    poll_interval: Duration,
    batch_size: usize,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(
            poll_secs = poll_interval.as_secs(),
            batch_size,
            "Delivery worker started"
        );
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            process_batch(&*ledger, &*backend, &fanout, batch_size).await;
        }
    })
}
