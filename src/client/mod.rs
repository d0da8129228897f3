//! Client library for talking to a geolock node.

use crate::error::{GeolockError, Result};
use crate::lock::{Lock, LockError, LockInfo, LockResult, LockStatus};
use crate::server::api::*;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

/// Default connection timeout for client requests.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default request timeout for client operations. Covers a raft commit
/// plus a cross-region quorum round.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the public lock API.
///
/// Lock operations return [`LockResult`]; transport failures are folded
/// into it as `ERROR` (or `TIMEOUT`) so callers handle one error type.
#[derive(Clone)]
pub struct LockClient {
    base_url: String,
    client: Client,
}

impl LockClient {
    /// Create a client for `base_url`, e.g. `http://127.0.0.1:7070`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeouts(base_url, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeouts(
        base_url: impl Into<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        let base_url = base_url.into();
        let base_url = if base_url.contains("://") {
            base_url
        } else {
            format!("http://{}", base_url)
        };

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check server health.
    pub async fn health(&self) -> Result<bool> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| GeolockError::Network(e.to_string()))?;
        Ok(response.status().is_success())
    }

    pub async fn acquire(
        &self,
        lock_id: &str,
        client_id: &str,
        timeout_ms: Option<u64>,
    ) -> LockResult<Lock> {
        let request = AcquireRequest {
            lock_id: lock_id.to_string(),
            client_id: client_id.to_string(),
            timeout_ms,
        };
        let response: LockResponse = self.post("locks/acquire", &request).await?;
        response.into_result()?.ok_or_else(missing_lock)
    }

    pub async fn release(
        &self,
        lock_id: &str,
        client_id: &str,
        fencing_token: u64,
    ) -> LockResult<()> {
        let request = ReleaseRequest {
            lock_id: lock_id.to_string(),
            client_id: client_id.to_string(),
            fencing_token,
        };
        let response: LockResponse = self.post("locks/release", &request).await?;
        response.into_result().map(|_| ())
    }

    pub async fn extend(
        &self,
        lock_id: &str,
        client_id: &str,
        fencing_token: u64,
        timeout_ms: Option<u64>,
    ) -> LockResult<Lock> {
        let request = ExtendRequest {
            lock_id: lock_id.to_string(),
            client_id: client_id.to_string(),
            fencing_token,
            timeout_ms,
        };
        let response: LockResponse = self.post("locks/extend", &request).await?;
        response.into_result()?.ok_or_else(missing_lock)
    }

    pub async fn check(&self, lock_id: &str) -> LockResult<LockInfo> {
        let request = CheckRequest {
            lock_id: lock_id.to_string(),
        };
        let response: CheckResponse = self.post("locks/check", &request).await?;
        response.into_result(lock_id)
    }

    /// Locks the node currently knows to be held.
    pub async fn list(&self) -> Result<Vec<LockInfo>> {
        let response: LockListResponse = self.get("locks").await?;
        Ok(response.locks)
    }

    pub async fn status(&self) -> Result<StatusResponse> {
        self.get("status").await
    }

    async fn get<Resp: DeserializeOwned>(&self, endpoint: &str) -> Result<Resp> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| GeolockError::Network(e.to_string()))?;

        response
            .json()
            .await
            .map_err(|e| GeolockError::Deserialization(e.to_string()))
    }

    async fn post<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: &Req,
    ) -> Result<Resp> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| GeolockError::Network(e.to_string()))?;

        response
            .json()
            .await
            .map_err(|e| GeolockError::Deserialization(e.to_string()))
    }
}

fn missing_lock() -> LockError {
    LockError::new(LockStatus::Error, "server reported success without a lock")
}
