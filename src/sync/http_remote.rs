//! HTTP client for the remote document store.

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::{PullPage, PushEntry, PushOutcome, RemoteStore, SyncError};
use crate::config::SyncConfig;

#[derive(Serialize)]
struct PushRequest<'a> {
    entries: &'a [PushEntry],
}

#[derive(Deserialize)]
struct PushResponse {
    results: Vec<PushOutcome>,
}

/// Talks JSON to `/v1/push` and `/v1/pull` on the sync server.
pub struct HttpRemoteStore {
    client: reqwest::Client,
    server_url: String,
    api_key: String,
}

impl HttpRemoteStore {
    /// Creates a client from config. Errors if sync is not configured.
    pub fn from_config(config: &SyncConfig) -> Result<Self, SyncError> {
        let server_url = config
            .server_url
            .clone()
            .ok_or(SyncError::NotConfigured)?;
        let api_key = config.api_key.clone().ok_or(SyncError::NotConfigured)?;
        Ok(Self::new(server_url, api_key))
    }

    pub fn new(server_url: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            server_url,
            api_key,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.server_url.trim_end_matches('/'), path)
    }
}

/// 4xx responses mean the request itself is bad and retrying is
/// pointless, except 408 and 429 which are load/timing conditions.
fn classify_status(status: StatusCode, body: String) -> SyncError {
    let message = format!("{}: {}", status, body);
    if status.is_client_error()
        && status != StatusCode::REQUEST_TIMEOUT
        && status != StatusCode::TOO_MANY_REQUESTS
    {
        SyncError::Permanent(message)
    } else {
        SyncError::Transient(message)
    }
}

impl RemoteStore for HttpRemoteStore {
    async fn push_batch(&self, batch: &[PushEntry]) -> Result<Vec<PushOutcome>, SyncError> {
        let response = self
            .client
            .post(self.endpoint("/v1/push"))
            .bearer_auth(&self.api_key)
            .json(&PushRequest { entries: batch })
            .send()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let parsed: PushResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;
        Ok(parsed.results)
    }

    async fn pull_since(
        &self,
        checkpoint: DateTime<Utc>,
        owner_id: &str,
    ) -> Result<PullPage, SyncError> {
        let response = self
            .client
            .get(self.endpoint("/v1/pull"))
            .bearer_auth(&self.api_key)
            .query(&[
                ("since", checkpoint.to_rfc3339()),
                ("owner", owner_id.to_string()),
            ])
            .send()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        response
            .json()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_paths() {
        let client = HttpRemoteStore::new("http://localhost:8080".to_string(), "key".to_string());
        assert_eq!(client.endpoint("/v1/push"), "http://localhost:8080/v1/push");
    }

    #[test]
    fn test_endpoint_strips_trailing_slash() {
        let client =
            HttpRemoteStore::new("https://sync.example.com/".to_string(), "key".to_string());
        assert_eq!(
            client.endpoint("/v1/pull"),
            "https://sync.example.com/v1/pull"
        );
    }

    #[test]
    fn test_permission_denied_is_permanent() {
        let err = classify_status(StatusCode::FORBIDDEN, "no".to_string());
        assert!(matches!(err, SyncError::Permanent(_)));
    }

    #[test]
    fn test_throttling_is_transient() {
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down".to_string());
        assert!(matches!(err, SyncError::Transient(_)));
        let err = classify_status(StatusCode::SERVICE_UNAVAILABLE, "down".to_string());
        assert!(matches!(err, SyncError::Transient(_)));
    }

    #[test]
    fn test_from_config_requires_url_and_key() {
        let config = SyncConfig::default();
        assert!(matches!(
            HttpRemoteStore::from_config(&config),
            Err(SyncError::NotConfigured)
        ));
    }
}
