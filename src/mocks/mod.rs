//! Test doubles for dependency injection
//!
//! Provides scripted implementations of all external dependencies for
//! isolated testing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::records::RecordKind;
use crate::traits::{
    ActiveWindow, BackendClient, BackendError, EntryOutcome, InputHandler, InputSource,
    InputSourceError, InspectorError, QueueEntry, ScreenshotError, ScreenshotProvider,
    ScreenshotUpload, WindowInspector,
};

// Re-export the in-memory ledger constructor alongside the other doubles
pub use crate::ledger::DeliveryLedger as InMemoryLedger;

// ============================================================================
// ManualInputSource
// ============================================================================

/// Input source driven by the test instead of real input hooks.
///
/// `simulate_input` stands in for a pointer move or key press.
#[derive(Default)]
pub struct ManualInputSource {
    handler: Mutex<Option<InputHandler>>,
    start_count: AtomicUsize,
}

impl ManualInputSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver one synthetic input event to the registered handler.
    pub fn simulate_input(&self) {
        if let Some(handler) = self.handler.lock().unwrap().as_ref() {
            handler();
        }
    }

    pub fn is_started(&self) -> bool {
        self.handler.lock().unwrap().is_some()
    }

    /// How many times `start` was called (for listener-leak assertions).
    pub fn start_count(&self) -> usize {
        self.start_count.load(Ordering::SeqCst)
    }
}

impl InputSource for ManualInputSource {
    fn start(&self, on_input: InputHandler) -> Result<(), InputSourceError> {
        self.start_count.fetch_add(1, Ordering::SeqCst);
        *self.handler.lock().unwrap() = Some(on_input);
        Ok(())
    }

    fn stop(&self) {
        *self.handler.lock().unwrap() = None;
    }
}

// ============================================================================
// ScriptedWindowInspector
// ============================================================================

#[derive(Clone)]
enum InspectorBehavior {
    Window(Option<ActiveWindow>),
    Fail(String),
    Hang(Duration),
}

/// Window inspector whose answers are scripted by the test.
pub struct ScriptedWindowInspector {
    behavior: Mutex<InspectorBehavior>,
    call_count: AtomicUsize,
}

impl ScriptedWindowInspector {
    /// Starts with no foreground window.
    pub fn new() -> Self {
        Self {
            behavior: Mutex::new(InspectorBehavior::Window(None)),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn set_window(&self, window: Option<ActiveWindow>) {
        *self.behavior.lock().unwrap() = InspectorBehavior::Window(window);
    }

    /// Every subsequent query fails with the given message.
    pub fn fail_with(&self, message: &str) {
        *self.behavior.lock().unwrap() = InspectorBehavior::Fail(message.to_string());
    }

    /// Every subsequent query stalls, to exercise tick timeouts.
    pub fn hang_for(&self, duration: Duration) {
        *self.behavior.lock().unwrap() = InspectorBehavior::Hang(duration);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedWindowInspector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WindowInspector for ScriptedWindowInspector {
    async fn active_window(&self) -> Result<Option<ActiveWindow>, InspectorError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            InspectorBehavior::Window(window) => Ok(window),
            InspectorBehavior::Fail(message) => Err(InspectorError::QueryFailed(message)),
            InspectorBehavior::Hang(duration) => {
                tokio::time::sleep(duration).await;
                Ok(None)
            }
        }
    }
}

// ============================================================================
// FixedScreenshotProvider
// ============================================================================

/// Screenshot provider returning sequential fake image URLs.
#[derive(Default)]
pub struct FixedScreenshotProvider {
    call_count: AtomicUsize,
    fail_with: Mutex<Option<String>>,
}

impl FixedScreenshotProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent capture fails with the given message.
    pub fn fail_with(&self, message: &str) {
        *self.fail_with.lock().unwrap() = Some(message.to_string());
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// URL the n-th successful capture returned (0-based).
    pub fn url_at(&self, n: usize) -> String {
        format!("https://cdn.example.com/shots/{n}.png")
    }
}

#[async_trait]
impl ScreenshotProvider for FixedScreenshotProvider {
    async fn capture(&self) -> Result<ScreenshotUpload, ScreenshotError> {
        if let Some(message) = self.fail_with.lock().unwrap().clone() {
            return Err(ScreenshotError::CaptureFailed(message));
        }
        let n = self.call_count.fetch_add(1, Ordering::SeqCst);
        Ok(ScreenshotUpload {
            image_url: self.url_at(n),
        })
    }
}

// ============================================================================
// RecordedBackendClient
// ============================================================================

/// One submitted batch, as the backend saw it.
#[derive(Debug, Clone)]
pub struct RecordedBatch {
    pub kind: RecordKind,
    pub entry_ids: Vec<String>,
    pub payloads: Vec<serde_json::Value>,
}

#[derive(Clone)]
enum BackendBehavior {
    /// Acknowledge every entry.
    AcceptAll,
    /// Whole-batch transport failure.
    AlwaysFail(BackendError),
    /// Acknowledge everything except the listed entry ids.
    RejectEntries(Vec<String>),
}

/// Backend client for testing: records every batch and answers with a
/// configurable behavior.
pub struct RecordedBackendClient {
    batches: Mutex<Vec<RecordedBatch>>,
    behavior: Mutex<BackendBehavior>,
    call_count: AtomicUsize,
}

impl RecordedBackendClient {
    pub fn accept_all() -> Self {
        Self::with_behavior(BackendBehavior::AcceptAll)
    }

    pub fn always_fail(error: BackendError) -> Self {
        Self::with_behavior(BackendBehavior::AlwaysFail(error))
    }

    /// Per-entry rejection: listed ids are rejected, the rest accepted.
    pub fn reject_entries(entry_ids: Vec<String>) -> Self {
        Self::with_behavior(BackendBehavior::RejectEntries(entry_ids))
    }

    fn with_behavior(behavior: BackendBehavior) -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            behavior: Mutex::new(behavior),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Switch behavior mid-test (e.g. fail first, then recover).
    pub fn set_accept_all(&self) {
        *self.behavior.lock().unwrap() = BackendBehavior::AcceptAll;
    }

    pub fn batches(&self) -> Vec<RecordedBatch> {
        self.batches.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendClient for RecordedBackendClient {
    async fn submit_batch(
        &self,
        kind: RecordKind,
        entries: &[QueueEntry],
    ) -> Result<Vec<EntryOutcome>, BackendError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.batches.lock().unwrap().push(RecordedBatch {
            kind,
            entry_ids: entries.iter().map(|e| e.id.clone()).collect(),
            payloads: entries.iter().map(|e| e.payload.clone()).collect(),
        });

        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            BackendBehavior::AcceptAll => {
                Ok(entries.iter().map(|e| EntryOutcome::accepted(&e.id)).collect())
            }
            BackendBehavior::AlwaysFail(error) => Err(error),
            BackendBehavior::RejectEntries(rejected) => Ok(entries
                .iter()
                .map(|e| {
                    if rejected.contains(&e.id) {
                        EntryOutcome::rejected(&e.id, "validation failed")
                    } else {
                        EntryOutcome::accepted(&e.id)
                    }
                })
                .collect()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_manual_input_source_lifecycle() {
        let source = ManualInputSource::new();
        assert!(!source.is_started());

        // Simulate without a handler: must not panic
        source.simulate_input();

        let hits = Arc::new(AtomicUsize::new(0));
        let sink = hits.clone();
        source
            .start(Arc::new(move || {
                sink.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert!(source.is_started());

        source.simulate_input();
        source.simulate_input();
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        source.stop();
        assert!(!source.is_started());
        source.simulate_input();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_scripted_inspector_behaviors() {
        let inspector = ScriptedWindowInspector::new();
        assert_eq!(inspector.active_window().await.unwrap(), None);

        inspector.set_window(Some(ActiveWindow {
            app_name: "Editor".to_string(),
            window_title: "file.txt".to_string(),
            app_path: None,
        }));
        let window = inspector.active_window().await.unwrap().unwrap();
        assert_eq!(window.app_name, "Editor");

        inspector.fail_with("screen locked");
        assert!(inspector.active_window().await.is_err());
        assert_eq!(inspector.call_count(), 3);
    }

    #[tokio::test]
    async fn test_fixed_screenshot_provider_sequences_urls() {
        let provider = FixedScreenshotProvider::new();
        assert_eq!(provider.capture().await.unwrap().image_url, provider.url_at(0));
        assert_eq!(provider.capture().await.unwrap().image_url, provider.url_at(1));

        provider.fail_with("no display");
        assert!(provider.capture().await.is_err());
        assert_eq!(provider.call_count(), 2, "failed captures do not consume a URL");
    }

    #[tokio::test]
    async fn test_recorded_backend_reject_entries() {
        let client = RecordedBackendClient::reject_entries(vec!["b".to_string()]);
        let entries: Vec<QueueEntry> = ["a", "b"]
            .iter()
            .map(|id| QueueEntry {
                id: id.to_string(),
                kind: RecordKind::AppActivity,
                payload: serde_json::json!({}),
                status: crate::traits::DeliveryStatus::InFlight,
                attempt_count: 0,
                last_error: None,
                next_retry_at: 0,
                created_at: 0,
                delivered_at: None,
            })
            .collect();

        let outcomes = client
            .submit_batch(RecordKind::AppActivity, &entries)
            .await
            .unwrap();
        assert!(outcomes[0].accepted);
        assert!(!outcomes[1].accepted);
        assert_eq!(client.batches()[0].entry_ids, vec!["a", "b"]);
    }
}
