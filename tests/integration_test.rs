//! End-to-end integration tests for the TimePost capture pipeline.
//!
//! Tests the full flow: Tracking → Capture Tick → Enqueue → Deliver →
//! Fan-out, with scripted externals and a paused tokio clock.

use std::sync::Arc;
use std::time::Duration;

use timepost::capture_scheduler::{CaptureScheduler, SchedulerConfig};
use timepost::delivery_worker::{self, SCREENSHOT_CHANNEL};
use timepost::fanout::FanoutHub;
use timepost::idle_monitor::{ActivityMeter, IdleMonitor};
use timepost::mocks::{
    FixedScreenshotProvider, ManualInputSource, RecordedBackendClient, ScriptedWindowInspector,
};
use timepost::records::RecordKind;
use timepost::tracking::{Tracker, TrackingGate, TrackingState, DEFAULT_TASK_ID};
use timepost::traits::{ActiveWindow, BackendError, DeliveryLedgerTrait, DeliveryStatus};
use timepost::DeliveryLedger;

struct Pipeline {
    tracker: Tracker,
    ledger: Arc<DeliveryLedger>,
    backend: Arc<RecordedBackendClient>,
    fanout: Arc<FanoutHub>,
    inspector: Arc<ScriptedWindowInspector>,
    input: Arc<ManualInputSource>,
}

/// Build the full pipeline with scripted externals.
///
/// Idle threshold 300s, poll 5s, app samples every 15s, screenshots every
/// 300s — the production defaults.
fn pipeline() -> Pipeline {
    let ledger = Arc::new(DeliveryLedger::open_in_memory().unwrap());
    let backend = Arc::new(RecordedBackendClient::accept_all());
    let fanout = Arc::new(FanoutHub::new());
    let inspector = Arc::new(ScriptedWindowInspector::new());
    let input = Arc::new(ManualInputSource::new());

    let gate = Arc::new(TrackingGate::new());
    let meter = Arc::new(ActivityMeter::new());
    let idle_monitor = Arc::new(IdleMonitor::new(
        input.clone(),
        Duration::from_secs(300),
        Duration::from_secs(5),
    ));
    let scheduler = Arc::new(CaptureScheduler::new(
        SchedulerConfig::default(),
        gate.clone(),
        inspector.clone(),
        Arc::new(FixedScreenshotProvider::new()),
        meter.clone(),
        ledger.clone(),
    ));
    let tracker = Tracker::new(
        gate,
        scheduler,
        idle_monitor,
        meter,
        ledger.clone(),
        "u-1".to_string(),
        "p-1".to_string(),
    );

    Pipeline {
        tracker,
        ledger,
        backend,
        fanout,
        inspector,
        input,
    }
}

fn editor() -> ActiveWindow {
    ActiveWindow {
        app_name: "Editor".to_string(),
        window_title: "file.txt".to_string(),
        app_path: Some("/Applications/Editor.app".to_string()),
    }
}

#[tokio::test(start_paused = true)]
async fn test_full_pipeline_capture_deliver_fanout() {
    let p = pipeline();
    p.inspector.set_window(Some(editor()));

    let session = p.tracker.start(DEFAULT_TASK_ID).unwrap();

    // One app sample after 15s
    tokio::time::sleep(Duration::from_secs(16)).await;
    let pending = p.ledger.get_by_status(DeliveryStatus::Pending).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, RecordKind::AppActivity);
    assert_eq!(pending[0].payload["app_name"], "Editor");
    assert_eq!(pending[0].payload["time_log_id"], session.id.as_str());

    // Screenshot lands at 300s
    let mut dashboard = p.fanout.subscribe(&[SCREENSHOT_CHANNEL]);
    tokio::time::sleep(Duration::from_secs(285)).await;
    let stats = p.ledger.get_stats().unwrap();
    assert!(stats.pending > 1, "app samples kept accumulating");

    // Deliver everything; the confirmed screenshot reaches the dashboard
    let result =
        delivery_worker::process_batch(&*p.ledger, &*p.backend, &p.fanout, 50).await;
    assert!(result.delivered >= 2);
    assert_eq!(result.failed, 0);

    let message = dashboard.recv().await.unwrap();
    let event = &message.payload["screenshotCaptured"];
    assert_eq!(event["userId"], "u-1");
    assert_eq!(event["activity_percent"], 100, "no idle time in the window");

    p.tracker.stop().unwrap();
    p.fanout.close();
}

#[tokio::test(start_paused = true)]
async fn test_pipeline_retry_on_backend_failure() {
    let p = pipeline();
    p.inspector.set_window(Some(editor()));
    p.tracker.start(DEFAULT_TASK_ID).unwrap();

    tokio::time::sleep(Duration::from_secs(16)).await;

    // Backend down: entry stays queued with a retry schedule
    let broken = RecordedBackendClient::always_fail(BackendError::Network("refused".to_string()));
    let result = delivery_worker::process_batch(&*p.ledger, &broken, &p.fanout, 10).await;
    assert_eq!(result.delivered, 0);
    assert_eq!(result.failed, 1);

    let failed = p.ledger.get_by_status(DeliveryStatus::Failed).unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempt_count, 1);

    // After the backoff window the same entry delivers on a healthy backend
    tokio::time::sleep(Duration::from_secs(5)).await;
    let result = delivery_worker::process_batch(&*p.ledger, &*p.backend, &p.fanout, 10).await;
    assert_eq!(result.delivered, 1);
    assert_eq!(
        p.ledger.get_by_status(DeliveryStatus::Delivered).unwrap().len(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_pause_suppresses_capture_without_closing_session() {
    let p = pipeline();
    p.inspector.set_window(Some(editor()));

    let session = p.tracker.start(DEFAULT_TASK_ID).unwrap();
    tokio::time::sleep(Duration::from_secs(16)).await;
    assert_eq!(p.ledger.get_stats().unwrap().pending, 1);

    p.tracker.pause().unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(p.ledger.get_stats().unwrap().pending, 1, "no captures while paused");

    p.tracker.resume().unwrap();
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(p.ledger.get_stats().unwrap().pending, 2);

    let closed = p.tracker.stop().unwrap();
    assert_eq!(closed.id, session.id, "pause/resume never replaced the session");
}

#[tokio::test(start_paused = true)]
async fn test_idle_gap_produces_one_idle_session_record() {
    let p = pipeline();
    p.tracker.start(DEFAULT_TASK_ID).unwrap();

    // 310s without input, then activity resumes
    tokio::time::sleep(Duration::from_secs(310)).await;
    p.input.simulate_input();
    tokio::time::sleep(Duration::from_secs(6)).await;

    let pending = p.ledger.get_by_status(DeliveryStatus::Pending).unwrap();
    let idle: Vec<_> = pending
        .iter()
        .filter(|e| e.kind == RecordKind::IdleSession)
        .collect();
    assert_eq!(idle.len(), 1, "exactly one idle session per gap");
    assert_eq!(idle[0].payload["user_id"], "u-1");
    assert_eq!(idle[0].payload["project_id"], "p-1");
    // The period is backdated to when input stopped, so it covers the
    // whole ~5 minute gap, not just the part after detection
    let minutes = idle[0].payload["duration_minutes"].as_f64().unwrap();
    assert!((4.9..6.0).contains(&minutes), "got {minutes} minutes");

    // The idle session delivers like any other record
    let result = delivery_worker::process_batch(&*p.ledger, &*p.backend, &p.fanout, 50).await;
    assert!(result.delivered >= 1);
    let batches = p.backend.batches();
    assert!(batches.iter().any(|b| b.kind == RecordKind::IdleSession));

    p.tracker.stop().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_orphan_recovery_then_redelivery() {
    let ledger = Arc::new(DeliveryLedger::open_in_memory().unwrap());
    let backend = RecordedBackendClient::accept_all();
    let fanout = FanoutHub::new();

    // Simulate a crash mid-delivery: claimed but never acknowledged
    ledger
        .enqueue(RecordKind::AppActivity, serde_json::json!({"app_name": "Editor"}))
        .unwrap();
    let claimed = ledger.claim_batch(RecordKind::AppActivity, 1).unwrap();
    assert_eq!(claimed[0].status, DeliveryStatus::InFlight);

    // Startup recovery makes it immediately claimable again
    let recovered = ledger.recover_orphans().unwrap();
    assert_eq!(recovered, 1);

    let result = delivery_worker::process_batch(&*ledger, &backend, &fanout, 10).await;
    assert_eq!(result.delivered, 1);
    assert_eq!(ledger.get_by_status(DeliveryStatus::Delivered).unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_records_after_logical_stop_are_tolerated() {
    let p = pipeline();
    p.tracker.start(DEFAULT_TASK_ID).unwrap();
    p.tracker.stop().unwrap();
    assert_eq!(p.tracker.state(), TrackingState::Stopped);

    // An in-flight tick finishing after stop may still enqueue; the queue
    // accepts and delivers it
    p.ledger
        .enqueue(
            RecordKind::AppActivity,
            serde_json::json!({"app_name": "Editor", "time_log_id": null}),
        )
        .unwrap();

    let result = delivery_worker::process_batch(&*p.ledger, &*p.backend, &p.fanout, 10).await;
    assert_eq!(result.delivered, 1);
}
