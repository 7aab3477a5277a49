//! Downstream RPC for the Apolo charging engine
//!
//! [`JsonRpcConnManager`] implements the core `ConnManager` trait over HTTP
//! JSON-RPC 2.0. Connections are configured by ID; a call walks the
//! requested IDs in order and answers from the first reachable one.
//!
//! # Usage
//!
//! ```rust,ignore
//! use apolo_rpc::JsonRpcConnManager;
//!
//! let conns = JsonRpcConnManager::from_config(&config.rpc)?;
//! let reply = conns
//!     .call(&["*rates".to_string()], "RateSv1.CostForEvent", args)
//!     .await?;
//! ```

mod client;
pub mod types;

pub use client::{JsonRpcClient, RpcError};
pub use types::*;

use apolo_core::config::RpcConfig;
use apolo_core::error::AppError;
use apolo_core::traits::ConnManager;
use apolo_core::AppResult;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{info, warn};

impl From<RpcError> for AppError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::NotFound => AppError::not_found(),
            e if e.is_connectivity() => AppError::NotConnected(e.to_string()),
            e => AppError::Rpc(e.to_string()),
        }
    }
}

/// Connection manager over configured JSON-RPC endpoints
#[derive(Debug, Default)]
pub struct JsonRpcConnManager {
    clients: HashMap<String, JsonRpcClient>,
}

impl JsonRpcConnManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds one client per configured connection
    pub fn from_config(cfg: &RpcConfig) -> AppResult<Self> {
        let mut mgr = Self::new();
        for (conn_id, url) in &cfg.connections {
            mgr.add_connection(conn_id, url, cfg.timeout_ms)?;
        }
        info!("Configured {} RPC connection(s)", mgr.clients.len());
        Ok(mgr)
    }

    pub fn add_connection(&mut self, conn_id: &str, url: &str, timeout_ms: u64) -> AppResult<()> {
        let client = JsonRpcClient::new(url, timeout_ms).map_err(|e| {
            AppError::Config(format!("invalid connection {}: {}", conn_id, e))
        })?;
        self.clients.insert(conn_id.to_string(), client);
        Ok(())
    }

    pub fn has_connection(&self, conn_id: &str) -> bool {
        self.clients.contains_key(conn_id)
    }
}

#[async_trait]
impl ConnManager for JsonRpcConnManager {
    async fn call(&self, conn_ids: &[String], method: &str, args: Value) -> AppResult<Value> {
        let mut last_err: Option<RpcError> = None;
        for conn_id in conn_ids {
            let Some(client) = self.clients.get(conn_id) else {
                warn!("Unknown RPC connection {}", conn_id);
                continue;
            };
            match client.call::<_, Value>(method, &args).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_connectivity() => {
                    warn!("Connection {} unreachable for {}: {}", conn_id, method, e);
                    last_err = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(match last_err {
            Some(e) => e.into(),
            None => AppError::NotConnected(format!("no connection for {}", method)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apolo_core::traits::methods;
    use serde_json::json;

    #[test]
    fn test_error_mapping() {
        assert!(AppError::from(RpcError::NotFound).is_not_found());
        assert!(matches!(
            AppError::from(RpcError::Timeout(20)),
            AppError::NotConnected(_)
        ));
        assert!(matches!(
            AppError::from(RpcError::RpcError(-1, "SERVER_ERROR".into())),
            AppError::Rpc(_)
        ));
    }

    #[test]
    fn test_from_config() {
        let mut cfg = RpcConfig::default();
        cfg.connections
            .insert("*rates".to_string(), "http://127.0.0.1:2080/jsonrpc".to_string());
        let mgr = JsonRpcConnManager::from_config(&cfg).unwrap();
        assert!(mgr.has_connection("*rates"));
        assert!(!mgr.has_connection("*attributes"));
    }

    #[tokio::test]
    async fn test_unknown_connection_is_not_connected() {
        let mgr = JsonRpcConnManager::new();
        let err = mgr
            .call(&["*thresholds".to_string()], methods::CORE_PING, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_not_connected() {
        let mut mgr = JsonRpcConnManager::new();
        mgr.add_connection("*rates", "http://127.0.0.1:1/jsonrpc", 200)
            .unwrap();
        let err = mgr
            .call(&["*rates".to_string()], methods::RATES_COST_FOR_EVENT, json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), apolo_core::ErrorKind::Connectivity);
    }
}
