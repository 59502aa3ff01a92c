//! Periodic capture producers gated by tracking state.
//!
//! Each producer owns its own cancellation token and timer; a failed or
//! slow tick is logged and skipped without disturbing the schedule. The
//! tracking gate is re-checked on every tick, so pause/resume takes effect
//! on the next tick boundary without restarting timers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::idle_monitor::ActivityMeter;
use crate::records::{CaptureRecord, RecordKind};
use crate::tracking::{SessionContext, TrackingGate};
use crate::traits::{
    DeliveryLedgerTrait, InspectorError, LedgerError, ScreenshotError, ScreenshotProvider,
    WindowInspector,
};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub track_applications: bool,
    pub app_sample_interval: Duration,
    pub screenshot_interval: Duration,
    /// Upper bound on one tick's capture work; a tick past it is abandoned
    /// and logged, and the schedule continues.
    pub tick_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            track_applications: true,
            app_sample_interval: Duration::from_secs(15),
            screenshot_interval: Duration::from_secs(300),
            tick_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Producer {
    AppSampler,
    Screenshots,
}

impl Producer {
    fn as_str(&self) -> &'static str {
        match self {
            Producer::AppSampler => "app_sampler",
            Producer::Screenshots => "screenshots",
        }
    }
}

#[derive(Debug, Error)]
enum TickError {
    #[error(transparent)]
    Inspector(#[from] InspectorError),
    #[error(transparent)]
    Screenshot(#[from] ScreenshotError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

struct ProducerCtx {
    gate: Arc<TrackingGate>,
    inspector: Arc<dyn WindowInspector>,
    screenshots: Arc<dyn ScreenshotProvider>,
    meter: Arc<ActivityMeter>,
    ledger: Arc<dyn DeliveryLedgerTrait>,
}

pub struct CaptureScheduler {
    config: SchedulerConfig,
    ctx: Arc<ProducerCtx>,
    producers: Mutex<HashMap<Producer, CancellationToken>>,
}

impl CaptureScheduler {
    pub fn new(
        config: SchedulerConfig,
        gate: Arc<TrackingGate>,
        inspector: Arc<dyn WindowInspector>,
        screenshots: Arc<dyn ScreenshotProvider>,
        meter: Arc<ActivityMeter>,
        ledger: Arc<dyn DeliveryLedgerTrait>,
    ) -> Self {
        Self {
            config,
            ctx: Arc::new(ProducerCtx {
                gate,
                inspector,
                screenshots,
                meter,
                ledger,
            }),
            producers: Mutex::new(HashMap::new()),
        }
    }

    /// Start both producers. Idempotent: an already-running producer's
    /// timer is replaced, never doubled. Must be called within a tokio
    /// runtime.
    pub fn start(&self) {
        if self.config.track_applications {
            self.start_producer(Producer::AppSampler, self.config.app_sample_interval);
        } else {
            tracing::info!("Application tracking disabled — app sampler not started");
        }
        self.start_producer(Producer::Screenshots, self.config.screenshot_interval);
    }

    /// Cancel all producer timers without waiting for in-flight ticks.
    pub fn stop(&self) {
        let mut producers = self.producers.lock().unwrap();
        for (producer, token) in producers.drain() {
            token.cancel();
            tracing::debug!(producer = producer.as_str(), "Producer cancelled");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.producers.lock().unwrap().is_empty()
    }

    fn start_producer(&self, producer: Producer, period: Duration) {
        let token = CancellationToken::new();
        {
            let mut producers = self.producers.lock().unwrap();
            if let Some(old) = producers.insert(producer, token.clone()) {
                old.cancel();
                tracing::debug!(producer = producer.as_str(), "Replacing existing producer timer");
            }
        }
        tracing::info!(
            producer = producer.as_str(),
            period_secs = period.as_secs(),
            "Producer started"
        );
        tokio::spawn(run_producer(
            self.ctx.clone(),
            producer,
            period,
            self.config.tick_timeout,
            token,
        ));
    }
}

async fn run_producer(
    ctx: Arc<ProducerCtx>,
    producer: Producer,
    period: Duration,
    tick_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // interval yields immediately; skip so the first sample lands one full
    // period after start
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Gate is re-read every tick so pause/resume applies at the
                // next boundary
                let Some(session) = ctx.gate.capture_context() else {
                    continue;
                };
                match tokio::time::timeout(tick_timeout, run_tick(&ctx, producer, &session)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(
                            producer = producer.as_str(),
                            error = %e,
                            "Capture tick failed — schedule continues"
                        );
                    }
                    Err(_) => {
                        tracing::warn!(
                            producer = producer.as_str(),
                            timeout_secs = tick_timeout.as_secs(),
                            "Capture tick timed out — schedule continues"
                        );
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::debug!(producer = producer.as_str(), "Producer loop exited");
                break;
            }
        }
    }
}

async fn run_tick(
    ctx: &ProducerCtx,
    producer: Producer,
    session: &SessionContext,
) -> Result<(), TickError> {
    match producer {
        Producer::AppSampler => {
            let Some(window) = ctx.inspector.active_window().await? else {
                tracing::debug!("No foreground window — sample skipped");
                return Ok(());
            };
            let record = CaptureRecord::AppActivity {
                user_id: session.user_id.clone(),
                time_log_id: Some(session.time_log_id.clone()),
                captured_at: Utc::now(),
                app_name: window.app_name,
                window_title: window.window_title,
                app_path: window.app_path,
            };
            let entry_id = ctx
                .ledger
                .enqueue(RecordKind::AppActivity, serde_json::to_value(&record)?)?;
            tracing::debug!(entry_id = %entry_id, "App activity enqueued");
        }
        Producer::Screenshots => {
            // Upload happens out-of-band; the record is enqueued once the
            // image reference is known
            let upload = ctx.screenshots.capture().await?;
            let record = CaptureRecord::Screenshot {
                user_id: session.user_id.clone(),
                time_log_id: Some(session.time_log_id.clone()),
                captured_at: Utc::now(),
                image_url: upload.image_url,
                activity_percent: ctx.meter.take_percent(),
            };
            let entry_id = ctx
                .ledger
                .enqueue(RecordKind::Screenshot, serde_json::to_value(&record)?)?;
            tracing::info!(entry_id = %entry_id, "Screenshot enqueued");
        }
    }
    Ok(())
}
