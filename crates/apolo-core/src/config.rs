//! Application configuration
//!
//! This module provides centralized configuration management using the `config` crate.
//! Configuration can be loaded from environment variables and config files.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub accounts: AccountsConfig,
    #[serde(default)]
    pub resources: ResourcesConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Settings shared by both engines
#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    /// Tenant used when a request carries none
    #[serde(default = "default_tenant")]
    pub default_tenant: String,

    /// Maximum wait for a named lock, in milliseconds
    #[serde(default = "default_locking_timeout")]
    pub locking_timeout_ms: u64,
}

fn default_tenant() -> String {
    "apolo.net".to_string()
}

fn default_locking_timeout() -> u64 {
    5000
}

impl GeneralConfig {
    pub fn locking_timeout(&self) -> Duration {
        Duration::from_millis(self.locking_timeout_ms)
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            default_tenant: default_tenant(),
            locking_timeout_ms: default_locking_timeout(),
        }
    }
}

/// Balance engine configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AccountsConfig {
    /// Iteration cap of the bisection debit search
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Usage assumed by max queries without one, in nanoseconds
    #[serde(default = "default_max_usage")]
    pub max_usage_ns: i64,

    #[serde(default)]
    pub attributes_conns: Vec<String>,

    #[serde(default)]
    pub rates_conns: Vec<String>,
}

fn default_max_iterations() -> usize {
    100
}

fn default_max_usage() -> i64 {
    72 * 3600 * 1_000_000_000 // 72h
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_usage_ns: default_max_usage(),
            attributes_conns: Vec::new(),
            rates_conns: Vec::new(),
        }
    }
}

/// Resource engine configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ResourcesConfig {
    /// Persistence of usage changes, in milliseconds
    ///
    /// Positive: background backup loop at that interval. Zero: write on each
    /// request. Negative: never persist.
    #[serde(default)]
    pub store_interval_ms: i64,

    #[serde(default)]
    pub thresholds_conns: Vec<String>,
}

/// Store policy derived from `store_interval_ms`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorePolicy {
    Backup(Duration),
    Synchronous,
    Disabled,
}

impl ResourcesConfig {
    pub fn store_policy(&self) -> StorePolicy {
        match self.store_interval_ms {
            ms if ms > 0 => StorePolicy::Backup(Duration::from_millis(ms as u64)),
            0 => StorePolicy::Synchronous,
            _ => StorePolicy::Disabled,
        }
    }
}

/// Cache configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// TTL of the per-event matched resources, in seconds
    #[serde(default = "default_event_resources_ttl")]
    pub event_resources_ttl_secs: u64,
}

fn default_event_resources_ttl() -> u64 {
    300
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            event_resources_ttl_secs: default_event_resources_ttl(),
        }
    }
}

/// Downstream connections
#[derive(Debug, Deserialize, Clone)]
pub struct RpcConfig {
    /// Connection ID to JSON-RPC endpoint URL
    #[serde(default)]
    pub connections: HashMap<String, String>,

    /// Request timeout in milliseconds
    #[serde(default = "default_rpc_timeout")]
    pub timeout_ms: u64,
}

fn default_rpc_timeout() -> u64 {
    2000
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            connections: HashMap::new(),
            timeout_ms: default_rpc_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and optional config file
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with default values
            .set_default("general.default_tenant", default_tenant())?
            .set_default("general.locking_timeout_ms", default_locking_timeout())?
            .set_default("accounts.max_iterations", default_max_iterations() as i64)?
            .set_default("accounts.max_usage_ns", default_max_usage())?
            .set_default("resources.store_interval_ms", 0)?
            .set_default(
                "cache.event_resources_ttl_secs",
                default_event_resources_ttl(),
            )?
            .set_default("rpc.timeout_ms", default_rpc_timeout())?
            .set_default("logging.level", default_log_level())?
            .set_default("logging.json", false)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables with APOLO_ prefix
            .add_source(
                Environment::with_prefix("APOLO")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("accounts.attributes_conns")
                    .with_list_parse_key("accounts.rates_conns")
                    .with_list_parse_key("resources.thresholds_conns")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("APOLO").separator("__"))
            .build()?;

        config.try_deserialize()
    }
}
