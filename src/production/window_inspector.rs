//! Foreground window inspection.
//!
//! macOS: queries System Events via osascript. Requires Automation
//! permission for the agent; a denial surfaces as a query failure at the
//! tick boundary, never as a crash. Other platforms report no foreground
//! window.

use crate::traits::{ActiveWindow, InspectorError, WindowInspector};

pub struct SystemWindowInspector;

impl SystemWindowInspector {
    pub fn new() -> Self {
        #[cfg(not(target_os = "macos"))]
        tracing::warn!("Window inspection unavailable on this platform — app samples will be empty");
        Self
    }
}

impl Default for SystemWindowInspector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "macos")]
const FRONTMOST_SCRIPT: &str = r#"
tell application "System Events"
    set frontApp to first application process whose frontmost is true
    set appName to name of frontApp
    set appPath to POSIX path of (application file of frontApp)
    try
        set windowTitle to name of front window of frontApp
    on error
        set windowTitle to ""
    end try
end tell
return appName & linefeed & windowTitle & linefeed & appPath
"#;

#[async_trait::async_trait]
impl WindowInspector for SystemWindowInspector {
    #[cfg(target_os = "macos")]
    async fn active_window(&self) -> Result<Option<ActiveWindow>, InspectorError> {
        let output = tokio::process::Command::new("osascript")
            .arg("-e")
            .arg(FRONTMOST_SCRIPT)
            .output()
            .await
            .map_err(|e| InspectorError::QueryFailed(format!("osascript failed to launch: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(InspectorError::QueryFailed(format!(
                "osascript exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut lines = stdout.lines();
        let app_name = lines.next().unwrap_or("").trim().to_string();
        if app_name.is_empty() {
            return Ok(None);
        }
        let window_title = lines.next().unwrap_or("").trim().to_string();
        let app_path = lines
            .next()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);

        Ok(Some(ActiveWindow {
            app_name,
            window_title,
            app_path,
        }))
    }

    #[cfg(not(target_os = "macos"))]
    async fn active_window(&self) -> Result<Option<ActiveWindow>, InspectorError> {
        Ok(None)
    }
}
