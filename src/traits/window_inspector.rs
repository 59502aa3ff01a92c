//! Foreground window inspector trait

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum InspectorError {
    #[error("window query failed: {0}")]
    QueryFailed(String),
}

/// The currently focused application window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveWindow {
    pub app_name: String,
    pub window_title: String,
    pub app_path: Option<String>,
}

/// Trait for querying the foreground application
///
/// May fail transiently (screen locked, permissions revoked mid-run);
/// callers treat a failure as a skipped sample, never as fatal.
#[async_trait::async_trait]
pub trait WindowInspector: Send + Sync {
    /// Returns `None` when no window has focus (e.g. desktop or login
    /// screen in front).
    async fn active_window(&self) -> Result<Option<ActiveWindow>, InspectorError>;
}
