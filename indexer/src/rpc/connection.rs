//! HTTP dispatch seam for the transport.
//!
//! `RpcTransport` owns rotation, caching, and rate limiting; the actual wire
//! call goes through this trait so tests can serve a synthetic chain.

use super::RpcError;
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[async_trait]
pub trait RpcConnection: Send + Sync {
    /// Execute one JSON-RPC call against a specific endpoint URL.
    async fn request(&self, url: &str, method: &str, params: Value) -> Result<Value, RpcError>;
}

/// JSON-RPC 2.0 over HTTP POST.
pub struct HttpConnection {
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpConnection {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .wrap_err("failed to build HTTP client")?;
        Ok(Self {
            client,
            next_id: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl RpcConnection for HttpConnection {
    async fn request(&self, url: &str, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let failure = |reason: String| RpcError::EndpointFailure {
            url: url.to_string(),
            method: method.to_string(),
            reason,
        };

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|err| failure(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(failure(format!("http status {status}")));
        }

        let envelope: Value = response
            .json()
            .await
            .map_err(|err| failure(format!("invalid json body: {err}")))?;
        if let Some(error) = envelope.get("error").filter(|error| !error.is_null()) {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(failure(format!("rpc error {code}: {message}")));
        }

        envelope
            .get("result")
            .cloned()
            .ok_or_else(|| failure("response missing result field".to_string()))
    }
}
