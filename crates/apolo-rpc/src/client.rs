//! HTTP JSON-RPC 2.0 client
//!
//! Low-level communication with one downstream endpoint.

use reqwest::{Client, ClientBuilder};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, instrument};

use crate::types::{JsonRpcRequest, JsonRpcResponse};

/// Client for one JSON-RPC endpoint
pub struct JsonRpcClient {
    http_client: Client,
    base_url: String,
    origin_host: String,
    timeout_ms: u64,
    request_id: AtomicU64,
}

/// JSON-RPC client errors
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("HTTP error: status {0}")]
    HttpError(u16),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("RPC error {0}: {1}")]
    RpcError(i32, String),

    #[error("NOT_FOUND")]
    NotFound,

    #[error("Empty response from {0}")]
    EmptyResponse(String),

    #[error("Timeout: request took longer than {0}ms")]
    Timeout(u64),
}

impl RpcError {
    /// The endpoint could not be reached at all
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            RpcError::Connection(_) | RpcError::Timeout(_) | RpcError::HttpError(_)
        )
    }
}

impl std::fmt::Debug for JsonRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonRpcClient")
            .field("base_url", &self.base_url)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl JsonRpcClient {
    /// Creates a new client
    ///
    /// # Arguments
    ///
    /// * `base_url` - JSON-RPC endpoint URL (e.g. "http://127.0.0.1:2080/jsonrpc")
    /// * `timeout_ms` - Request timeout in milliseconds
    pub fn new(base_url: &str, timeout_ms: u64) -> Result<Self, RpcError> {
        let http_client = ClientBuilder::new()
            .timeout(Duration::from_millis(timeout_ms))
            .pool_max_idle_per_host(20)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| RpcError::Connection(e.to_string()))?;

        let origin_host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "apolo-charging".to_string());

        Ok(Self {
            http_client,
            base_url: base_url.to_string(),
            origin_host,
            timeout_ms,
            request_id: AtomicU64::new(1),
        })
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Hostname sent along as request origin
    pub fn origin_host(&self) -> &str {
        &self.origin_host
    }

    /// Executes one JSON-RPC call
    #[instrument(skip(self, params))]
    pub async fn call<T, R>(&self, method: &str, params: T) -> Result<R, RpcError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let request_id = self.next_id();

        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params: vec![params],
            id: request_id,
        };

        debug!("RPC request: method={}, id={}", method, request_id);

        let response = self
            .http_client
            .post(&self.base_url)
            .header("X-Origin-Host", &self.origin_host)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RpcError::Timeout(self.timeout_ms)
                } else {
                    RpcError::Connection(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            error!("RPC HTTP error: status={}", status);
            return Err(RpcError::HttpError(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| RpcError::ParseError(format!("Failed to read response body: {}", e)))?;

        debug!("RPC response: {}", body);

        parse_response(&body, method)
    }
}

/// Decodes a response body, mapping remote errors
pub(crate) fn parse_response<R: DeserializeOwned>(body: &str, method: &str) -> Result<R, RpcError> {
    let rpc_response: JsonRpcResponse<R> = serde_json::from_str(body)
        .map_err(|e| RpcError::ParseError(format!("Failed to parse JSON: {} - Body: {}", e, body)))?;

    if let Some(err) = rpc_response.error {
        if err.message().to_uppercase().starts_with("NOT_FOUND") {
            return Err(RpcError::NotFound);
        }
        return Err(RpcError::RpcError(err.code(), err.message().to_string()));
    }

    rpc_response
        .result
        .ok_or_else(|| RpcError::EmptyResponse(method.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = JsonRpcClient::new("http://localhost:2080/jsonrpc", 50);
        assert!(client.is_ok());
        assert_eq!(client.unwrap().base_url(), "http://localhost:2080/jsonrpc");
    }

    #[test]
    fn test_request_id_increment() {
        let client = JsonRpcClient::new("http://localhost:2080/jsonrpc", 50).unwrap();

        assert_eq!(client.next_id(), 1);
        assert_eq!(client.next_id(), 2);
        assert_eq!(client.next_id(), 3);
    }

    #[test]
    fn test_parse_response() {
        let ok: String = parse_response(r#"{"id":1,"result":"Pong","error":null}"#, "CoreSv1.Ping")
            .unwrap();
        assert_eq!(ok, "Pong");

        let nf = parse_response::<String>(
            r#"{"id":1,"result":null,"error":"NOT_FOUND"}"#,
            "ThresholdSv1.ProcessEvent",
        );
        assert!(matches!(nf, Err(RpcError::NotFound)));

        let empty = parse_response::<String>(r#"{"id":1,"result":null}"#, "RateSv1.CostForEvent");
        assert!(matches!(empty, Err(RpcError::EmptyResponse(_))));

        let bad = parse_response::<String>("<html>", "CoreSv1.Ping");
        assert!(matches!(bad, Err(RpcError::ParseError(_))));
    }

    #[test]
    fn test_connectivity_classification() {
        assert!(RpcError::Timeout(50).is_connectivity());
        assert!(RpcError::Connection("refused".into()).is_connectivity());
        assert!(!RpcError::NotFound.is_connectivity());
    }
}
