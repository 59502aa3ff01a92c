//! SQLite-based configuration store and typed agent settings

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection};
use thiserror::Error;

use crate::traits::LedgerError;

/// Default project used for idle sessions when none is configured.
/// Mirrors the backend's seeded default project row.
const DEFAULT_PROJECT_ID: &str = "00000000-0000-0000-0000-000000000001";

pub struct AppConfig {
    conn: Mutex<Connection>,
}

impl AppConfig {
    /// Create config table in an existing database connection
    pub fn init_table(conn: &Connection) -> Result<(), LedgerError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS app_config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )
        .map_err(|e| LedgerError::Database(e.to_string()))
    }

    /// Open or create a config database at the given path
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path).map_err(|e| LedgerError::Database(e.to_string()))?;
        Self::init_table(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open standalone in-memory config (for testing)
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory().map_err(|e| LedgerError::Database(e.to_string()))?;
        Self::init_table(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT value FROM app_config WHERE key = ?1",
            params![key],
            |row| row.get(0),
        );
        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(LedgerError::Database(e.to_string())),
        }
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), LedgerError> {
        tracing::debug!(key = %key, "Config set");
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO app_config (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, now],
        )
        .map_err(|e| LedgerError::Database(e.to_string()))?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<(), LedgerError> {
        tracing::debug!(key = %key, "Config delete");
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM app_config WHERE key = ?1", params![key])
            .map_err(|e| LedgerError::Database(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("backend_url is not configured (set TIMEPOST_BACKEND_URL or the backend_url config key)")]
    MissingBackendUrl,
    #[error("user_id is not configured (set TIMEPOST_USER_ID or the user_id config key)")]
    MissingUserId,
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error(transparent)]
    Store(#[from] LedgerError),
}

/// Typed agent settings, read once at startup.
///
/// Each key resolves environment variable (`TIMEPOST_<KEY>`) first, then
/// the config store, then the built-in default. Only the backend URL and
/// user id are required.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub backend_url: String,
    pub api_token: Option<String>,
    pub user_id: String,
    pub project_id: String,
    /// Task to track when the agent starts. An empty or malformed value
    /// falls back to the default task sentinel at start time.
    pub task_id: String,
    pub track_applications: bool,
    pub idle_threshold: Duration,
    pub idle_poll_interval: Duration,
    pub app_sample_interval: Duration,
    pub screenshot_interval: Duration,
    pub delivery_poll_interval: Duration,
    pub delivery_batch_size: usize,
    /// Attempt budget before the ledger starts logging at error level.
    /// `None` means unlimited; entries are never dropped either way.
    pub max_delivery_attempts: Option<u32>,
}

impl AgentSettings {
    pub fn load(config: &AppConfig) -> Result<Self, SettingsError> {
        let backend_url = lookup(config, "backend_url")?.ok_or(SettingsError::MissingBackendUrl)?;
        let user_id = lookup(config, "user_id")?.ok_or(SettingsError::MissingUserId)?;

        let max_attempts = lookup_u64(config, "max_delivery_attempts")?.unwrap_or(0);

        let settings = Self {
            backend_url,
            api_token: lookup(config, "api_token")?,
            user_id,
            project_id: lookup(config, "project_id")?
                .unwrap_or_else(|| DEFAULT_PROJECT_ID.to_string()),
            task_id: lookup(config, "task_id")?.unwrap_or_default(),
            track_applications: lookup(config, "track_applications")?
                .map(|v| v == "true")
                .unwrap_or(true),
            idle_threshold: Duration::from_secs(
                lookup_u64(config, "idle_threshold_minutes")?.unwrap_or(5) * 60,
            ),
            idle_poll_interval: Duration::from_secs(
                lookup_u64(config, "idle_poll_secs")?.unwrap_or(5),
            ),
            app_sample_interval: Duration::from_secs(
                lookup_u64(config, "app_sample_secs")?.unwrap_or(15),
            ),
            screenshot_interval: Duration::from_secs(
                lookup_u64(config, "screenshot_interval_secs")?.unwrap_or(300),
            ),
            delivery_poll_interval: Duration::from_secs(
                lookup_u64(config, "delivery_poll_secs")?.unwrap_or(5),
            ),
            delivery_batch_size: lookup_u64(config, "delivery_batch_size")?.unwrap_or(10) as usize,
            max_delivery_attempts: (max_attempts > 0).then_some(max_attempts as u32),
        };

        tracing::info!(
            backend_url = %settings.backend_url,
            user_id = %settings.user_id,
            track_applications = settings.track_applications,
            idle_threshold_secs = settings.idle_threshold.as_secs(),
            screenshot_interval_secs = settings.screenshot_interval.as_secs(),
            "Agent settings loaded"
        );
        Ok(settings)
    }
}

/// Environment override first, then the config store.
fn lookup(config: &AppConfig, key: &str) -> Result<Option<String>, SettingsError> {
    let env_key = format!("TIMEPOST_{}", key.to_uppercase());
    if let Ok(value) = std::env::var(&env_key) {
        if !value.is_empty() {
            tracing::debug!(key = %key, "Setting resolved from environment");
            return Ok(Some(value));
        }
    }
    Ok(config.get(key)?)
}

fn lookup_u64(config: &AppConfig, key: &'static str) -> Result<Option<u64>, SettingsError> {
    match lookup(config, key)? {
        Some(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| SettingsError::InvalidValue { key, value }),
        None => Ok(None),
    }
}
