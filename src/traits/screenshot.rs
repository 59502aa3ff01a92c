//! Screenshot provider trait

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ScreenshotError {
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("upload failed: {0}")]
    UploadFailed(String),
}

/// Reference to an uploaded screen image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotUpload {
    pub image_url: String,
}

/// Trait for capturing and uploading a screen image
///
/// The image itself is shipped out-of-band; only the resulting URL goes
/// through the delivery queue. Capture may be slow or fail.
#[async_trait::async_trait]
pub trait ScreenshotProvider: Send + Sync {
    async fn capture(&self) -> Result<ScreenshotUpload, ScreenshotError>;
}
