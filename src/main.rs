use std::path::PathBuf;

use tracing_appender::rolling;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use timepost::{delivery_worker, AppState};

fn init_logging(data_dir: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = rolling::daily(&log_dir, "timepost.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "timepost=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer()) // stdout
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false)) // file
        .init();

    // Keep guard alive for application lifetime
    std::mem::forget(guard);
    Ok(())
}

#[tokio::main]
async fn main() {
    let data_dir = std::env::var("TIMEPOST_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./timepost-data"));

    if let Err(e) = init_logging(&data_dir) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }
    tracing::info!("TimePost starting up");

    // Configuration errors are the only fatal startup failures
    let state = match AppState::new_production(&data_dir) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize — check backend_url/user_id configuration");
            std::process::exit(1);
        }
    };

    // Entries stuck in-flight from a crashed run go back to the retry pool
    let recovered = state.ledger.recover_orphans().unwrap_or(0);
    if recovered > 0 {
        tracing::warn!(recovered, "Recovered orphaned deliveries from previous session");
    }

    let _worker = delivery_worker::spawn_worker(
        state.ledger.clone(),
        state.backend.clone(),
        state.fanout.clone(),
        state.settings.delivery_poll_interval,
        state.settings.delivery_batch_size,
    );

    match state.tracker.start(&state.settings.task_id) {
        Ok(session) => {
            tracing::info!(session_id = %session.id, task_id = %session.task_id, "On the clock");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to start tracking");
            std::process::exit(1);
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown requested");

    if let Err(e) = state.tracker.stop() {
        tracing::warn!(error = %e, "Tracking was not active at shutdown");
    }

    // One final delivery pass; whatever stays pending survives in the
    // queue and ships on the next run
    let result = delivery_worker::process_batch(
        &*state.ledger,
        &*state.backend,
        &state.fanout,
        state.settings.delivery_batch_size,
    )
    .await;
    tracing::info!(
        delivered = result.delivered,
        failed = result.failed,
        "Final delivery pass complete"
    );

    state.fanout.close();
    tracing::info!("TimePost stopped");
}
