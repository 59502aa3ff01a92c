//! Screen capture and out-of-band upload.
//!
//! macOS: shells out to `screencapture`, then POSTs the image bytes to the
//! backend's upload endpoint, which stores them and returns the public
//! URL. Only that URL flows through the delivery queue.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;

use crate::traits::{ScreenshotError, ScreenshotProvider, ScreenshotUpload};

const UPLOAD_TIMEOUT_SECONDS: u64 = 60;

#[derive(Debug, Deserialize)]
struct UploadResponse {
    image_url: String,
}

pub struct ScreenCaptureProvider {
    client: Client,
    upload_url: String,
    api_token: Option<String>,
}

impl ScreenCaptureProvider {
    pub fn new(base_url: &str, api_token: Option<String>) -> Result<Self, ScreenshotError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(UPLOAD_TIMEOUT_SECONDS))
            .build()
            .map_err(|e| ScreenshotError::UploadFailed(e.to_string()))?;

        Ok(Self {
            client,
            upload_url: format!("{}/api/screenshots", base_url.trim_end_matches('/')),
            api_token,
        })
    }

    #[cfg(target_os = "macos")]
    async fn capture_bytes(&self) -> Result<Vec<u8>, ScreenshotError> {
        let path = std::env::temp_dir().join(format!("timepost-{}.jpg", uuid::Uuid::new_v4()));

        let status = tokio::process::Command::new("screencapture")
            .arg("-x") // no capture sound
            .args(["-t", "jpg"])
            .arg(&path)
            .status()
            .await
            .map_err(|e| ScreenshotError::CaptureFailed(format!("screencapture failed to launch: {}", e)))?;

        if !status.success() {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(ScreenshotError::CaptureFailed(format!(
                "screencapture exited with {}",
                status
            )));
        }

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| ScreenshotError::CaptureFailed(e.to_string()))?;
        let _ = tokio::fs::remove_file(&path).await;
        Ok(bytes)
    }

    #[cfg(not(target_os = "macos"))]
    async fn capture_bytes(&self) -> Result<Vec<u8>, ScreenshotError> {
        Err(ScreenshotError::CaptureFailed(
            "no screen capture backend for this platform".to_string(),
        ))
    }
}

#[async_trait::async_trait]
impl ScreenshotProvider for ScreenCaptureProvider {
    async fn capture(&self) -> Result<ScreenshotUpload, ScreenshotError> {
        let bytes = self.capture_bytes().await?;
        tracing::debug!(bytes = bytes.len(), "Screen captured, uploading");

        let mut request = self
            .client
            .post(&self.upload_url)
            .header("Content-Type", "image/jpeg")
            .body(bytes);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ScreenshotError::UploadFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ScreenshotError::UploadFailed(format!("HTTP {}", status.as_u16())));
        }

        let parsed: UploadResponse = response
            .json()
            .await
            .map_err(|e| ScreenshotError::UploadFailed(format!("bad upload response: {}", e)))?;

        Ok(ScreenshotUpload {
            image_url: parsed.image_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_url_construction() {
        let provider = ScreenCaptureProvider::new("https://track.example.com/", None).unwrap();
        assert_eq!(provider.upload_url, "https://track.example.com/api/screenshots");
    }
}
