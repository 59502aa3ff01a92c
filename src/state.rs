//! Application state wiring

use std::path::Path;
use std::sync::Arc;

use crate::capture_scheduler::{CaptureScheduler, SchedulerConfig};
use crate::config::{AgentSettings, AppConfig};
use crate::fanout::FanoutHub;
use crate::idle_monitor::{ActivityMeter, IdleMonitor};
use crate::ledger::DeliveryLedger;
use crate::production::{
    HttpBackendClient, ScreenCaptureProvider, SystemInputSource, SystemWindowInspector,
};
use crate::tracking::{Tracker, TrackingGate};
use crate::traits::{BackendClient, DeliveryLedgerTrait};

/// Application state containing all dependencies
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub settings: AgentSettings,
    pub ledger: Arc<dyn DeliveryLedgerTrait>,
    pub backend: Arc<dyn BackendClient>,
    pub fanout: Arc<FanoutHub>,
    pub idle_monitor: Arc<IdleMonitor>,
    pub tracker: Arc<Tracker>,
}

impl AppState {
    /// Create a new AppState with production implementations
    pub fn new_production(data_dir: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        tracing::info!("Initializing AppState");
        std::fs::create_dir_all(data_dir)?;

        let config_path = data_dir.join("config.sqlite");
        tracing::info!(path = %config_path.display(), "Opening config database");
        let config = Arc::new(AppConfig::open(&config_path)?);
        let settings = AgentSettings::load(&config)?;

        let queue_path = data_dir.join("queue.sqlite");
        tracing::info!(path = %queue_path.display(), "Opening capture queue");
        let ledger: Arc<dyn DeliveryLedgerTrait> = Arc::new(DeliveryLedger::open(
            &queue_path,
            settings.max_delivery_attempts,
        )?);

        let backend: Arc<dyn BackendClient> = Arc::new(HttpBackendClient::new(
            &settings.backend_url,
            settings.api_token.clone(),
        )?);
        let fanout = Arc::new(FanoutHub::new());

        let idle_monitor = Arc::new(IdleMonitor::new(
            Arc::new(SystemInputSource::new()),
            settings.idle_threshold,
            settings.idle_poll_interval,
        ));
        let meter = Arc::new(ActivityMeter::new());
        let gate = Arc::new(TrackingGate::new());

        let scheduler = Arc::new(CaptureScheduler::new(
            SchedulerConfig {
                track_applications: settings.track_applications,
                app_sample_interval: settings.app_sample_interval,
                screenshot_interval: settings.screenshot_interval,
                ..SchedulerConfig::default()
            },
            gate.clone(),
            Arc::new(SystemWindowInspector::new()),
            Arc::new(ScreenCaptureProvider::new(
                &settings.backend_url,
                settings.api_token.clone(),
            )?),
            meter.clone(),
            ledger.clone(),
        ));

        let tracker = Arc::new(Tracker::new(
            gate,
            scheduler,
            idle_monitor.clone(),
            meter,
            ledger.clone(),
            settings.user_id.clone(),
            settings.project_id.clone(),
        ));

        tracing::info!("AppState initialization complete");
        Ok(Self {
            config,
            settings,
            ledger,
            backend,
            fanout,
            idle_monitor,
            tracker,
        })
    }

    /// Create a new AppState with test implementations
    #[cfg(test)]
    pub fn new_test() -> Self {
        use crate::mocks::{
            FixedScreenshotProvider, ManualInputSource, RecordedBackendClient,
            ScriptedWindowInspector,
        };
        use std::time::Duration;

        let config = Arc::new(AppConfig::open_in_memory().unwrap());
        let settings = AgentSettings {
            backend_url: "https://track.example.com".to_string(),
            api_token: None,
            user_id: "u-test".to_string(),
            project_id: "p-test".to_string(),
            task_id: String::new(),
            track_applications: true,
            idle_threshold: Duration::from_secs(300),
            idle_poll_interval: Duration::from_secs(5),
            app_sample_interval: Duration::from_secs(15),
            screenshot_interval: Duration::from_secs(300),
            delivery_poll_interval: Duration::from_secs(5),
            delivery_batch_size: 10,
            max_delivery_attempts: None,
        };

        let ledger: Arc<dyn DeliveryLedgerTrait> =
            Arc::new(DeliveryLedger::open_in_memory().unwrap());
        let backend: Arc<dyn BackendClient> = Arc::new(RecordedBackendClient::accept_all());
        let fanout = Arc::new(FanoutHub::new());
        let idle_monitor = Arc::new(IdleMonitor::new(
            Arc::new(ManualInputSource::new()),
            settings.idle_threshold,
            settings.idle_poll_interval,
        ));
        let meter = Arc::new(ActivityMeter::new());
        let gate = Arc::new(TrackingGate::new());
        let scheduler = Arc::new(CaptureScheduler::new(
            SchedulerConfig::default(),
            gate.clone(),
            Arc::new(ScriptedWindowInspector::new()),
            Arc::new(FixedScreenshotProvider::new()),
            meter.clone(),
            ledger.clone(),
        ));
        let tracker = Arc::new(Tracker::new(
            gate,
            scheduler,
            idle_monitor.clone(),
            meter,
            ledger.clone(),
            settings.user_id.clone(),
            settings.project_id.clone(),
        ));

        Self {
            config,
            settings,
            ledger,
            backend,
            fanout,
            idle_monitor,
            tracker,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::TrackingState;

    #[tokio::test(start_paused = true)]
    async fn test_wired_state_runs_tracking_lifecycle() {
        let state = AppState::new_test();
        assert_eq!(state.tracker.state(), TrackingState::Stopped);

        state.tracker.start("").unwrap();
        assert_eq!(state.tracker.state(), TrackingState::Tracking);
        assert_eq!(state.idle_monitor.subscriber_count(), 1);

        state.tracker.stop().unwrap();
        assert_eq!(state.tracker.state(), TrackingState::Stopped);
        assert_eq!(state.idle_monitor.subscriber_count(), 0);
        state.fanout.close();
    }
}
