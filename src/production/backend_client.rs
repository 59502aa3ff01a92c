//! Reqwest-based backend client implementation

use std::time::{Duration, Instant};

use reqwest::Client;
use serde::Deserialize;

use crate::records::RecordKind;
use crate::traits::{BackendClient, BackendError, EntryOutcome, QueueEntry};

const TIMEOUT_SECONDS: u64 = 25;

/// Per-entry acknowledgment as the ingest API returns it.
#[derive(Debug, Deserialize)]
struct AckRow {
    id: String,
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IngestResponse {
    results: Vec<AckRow>,
}

pub struct HttpBackendClient {
    client: Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpBackendClient {
    pub fn new(base_url: &str, api_token: Option<String>) -> Result<Self, BackendError> {
        reqwest::Url::parse(base_url).map_err(|e| BackendError::InvalidUrl(e.to_string()))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECONDS))
            .build()
            .map_err(|e| BackendError::Network(e.to_string()))?;

        tracing::debug!("Initialized backend client with {}s timeout", TIMEOUT_SECONDS);
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
        })
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait::async_trait]
impl BackendClient for HttpBackendClient {
    async fn submit_batch(
        &self,
        kind: RecordKind,
        entries: &[QueueEntry],
    ) -> Result<Vec<EntryOutcome>, BackendError> {
        let url = format!("{}/api/ingest/{}", self.base_url, kind.as_str());
        let body = serde_json::json!({
            "entries": entries
                .iter()
                .map(|e| serde_json::json!({"id": e.id, "payload": e.payload}))
                .collect::<Vec<_>>(),
        });

        let start = Instant::now();
        let request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body);

        let response = self.apply_auth(request).send().await.map_err(|e| {
            if e.is_timeout() {
                tracing::warn!(url = %url, "Backend request timed out");
                BackendError::Timeout
            } else {
                tracing::warn!(url = %url, error = %e, "Backend network error");
                BackendError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let duration_ms = start.elapsed().as_millis() as u64;
        tracing::debug!(
            url = %url,
            status,
            duration_ms,
            entries = entries.len(),
            "Backend batch response"
        );

        if !(200..300).contains(&status) {
            return Err(BackendError::Http(status));
        }

        let parsed: IngestResponse = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        Ok(parsed
            .results
            .into_iter()
            .map(|row| EntryOutcome {
                entry_id: row.id,
                accepted: row.ok,
                error: row.error,
            })
            .collect())
    }
}
