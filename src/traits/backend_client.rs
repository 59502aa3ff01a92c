//! Backend store client trait for batched record submission

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::delivery_ledger::QueueEntry;
use crate::records::RecordKind;

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP error: {0}")]
    Http(u16),
    #[error("timeout")]
    Timeout,
    #[error("invalid backend URL: {0}")]
    InvalidUrl(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    /// Whether this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Network(_) => true,
            BackendError::Http(code) => {
                // Retry server errors and rate limits, not client errors
                *code >= 500 || *code == 429
            }
            BackendError::Timeout => true,
            BackendError::InvalidUrl(_) => false,
            BackendError::InvalidResponse(_) => false,
        }
    }
}

/// Per-entry acknowledgment from a batch submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryOutcome {
    pub entry_id: String,
    pub accepted: bool,
    pub error: Option<String>,
}

impl EntryOutcome {
    pub fn accepted(entry_id: impl Into<String>) -> Self {
        Self {
            entry_id: entry_id.into(),
            accepted: true,
            error: None,
        }
    }

    pub fn rejected(entry_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            entry_id: entry_id.into(),
            accepted: false,
            error: Some(error.into()),
        }
    }
}

/// Trait for submitting capture batches to the backend store
///
/// Production: reqwest HTTP client
/// Testing: recorded responses
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait BackendClient: Send + Sync {
    /// Submit a batch of same-kind entries. On success the backend
    /// acknowledges each entry individually; a partial failure must not
    /// fail the accepted members.
    async fn submit_batch(
        &self,
        kind: RecordKind,
        entries: &[QueueEntry],
    ) -> Result<Vec<EntryOutcome>, BackendError>;
}
