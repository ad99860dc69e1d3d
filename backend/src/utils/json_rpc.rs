//! Minimal JSON-RPC 2.0 client over HTTP.
//!
//! Used for the confidential network. Calls are single attempts;
//! read-only callers may wrap them in [`retry_rpc_operation`].

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Errors from a JSON-RPC call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP error: {0}")]
    Http(u16),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("failed to decode response: {0}")]
    Decode(String),
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<JsonRpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorBody {
    code: i64,
    message: String,
}

/// JSON-RPC client bound to one endpoint.
#[derive(Debug)]
pub struct JsonRpcClient {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: &str, request_timeout: Duration) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            url: url.to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Call `method` with `params` and decode the `result` member.
    ///
    /// A missing `result` is decoded from `null`, so `Option<T>` results
    /// (pending receipts) come back as `None`.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, RpcError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        debug!("JSON-RPC {} -> {} (id {})", method, self.url, request.id);

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RpcError::Timeout
                } else {
                    RpcError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RpcError::Http(status.as_u16()));
        }

        let body: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| RpcError::Decode(e.to_string()))?;

        if let Some(error) = body.error {
            return Err(RpcError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        serde_json::from_value(body.result.unwrap_or(serde_json::Value::Null))
            .map_err(|e| RpcError::Decode(format!("{}: {}", method, e)))
    }
}

/// Execute a read-only RPC operation with retry logic.
///
/// Retries up to 4 attempts (initial attempt + 3 retries) with exponential
/// backoff, each attempt bounded by a 10-second timeout. Only use this for
/// calls that are safe to repeat.
pub async fn retry_rpc_operation<F, Fut, T>(mut operation: F) -> Result<T, RpcError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    const MAX_RETRIES: u32 = 3;
    const INITIAL_DELAY_MS: u64 = 200;
    const TIMEOUT_SECS: u64 = 10;

    let mut attempt = 0;
    loop {
        let error = match timeout(Duration::from_secs(TIMEOUT_SECS), operation()).await {
            Ok(Ok(result)) => {
                if attempt > 0 {
                    info!("RPC operation succeeded after {} retries", attempt);
                }
                return Ok(result);
            }
            // A JSON-RPC error is an answer, not a network failure
            Ok(Err(e @ RpcError::Rpc { .. })) => return Err(e),
            Ok(Err(e)) => e,
            Err(_) => RpcError::Timeout,
        };

        if attempt >= MAX_RETRIES {
            warn!("RPC operation failed after {} attempts: {}", attempt + 1, error);
            return Err(error);
        }

        let delay_ms = INITIAL_DELAY_MS * (1 << attempt);
        debug!(
            "RPC operation failed (attempt {}): {}. Retrying in {}ms...",
            attempt + 1,
            error,
            delay_ms
        );
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        attempt += 1;
    }
}
