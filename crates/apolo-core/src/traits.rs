//! Collaborator traits
//!
//! The engines consume these services without knowing their internals:
//! filter evaluation, storage, downstream RPC, and caching.

use crate::error::AppError;
use crate::models::{Account, ChargingEvent, Resource, ResourceProfile};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// Downstream RPC method names
pub mod methods {
    pub const ATTRIBUTES_PROCESS_EVENT: &str = "AttributeSv1.ProcessEvent";
    pub const RATES_COST_FOR_EVENT: &str = "RateSv1.CostForEvent";
    pub const THRESHOLDS_PROCESS_EVENT: &str = "ThresholdSv1.ProcessEvent";
    pub const FILTERS_PASS: &str = "FilterSv1.Pass";
    pub const CORE_PING: &str = "CoreSv1.Ping";
}

/// Filter evaluation service
#[async_trait]
pub trait FilterEvaluator: Send + Sync {
    /// True when every filter in `filter_ids` passes for `event`
    ///
    /// An empty list always passes. Unknown or malformed filters are errors.
    async fn pass(
        &self,
        tenant: &str,
        filter_ids: &[String],
        event: &ChargingEvent,
    ) -> Result<bool, AppError>;
}

/// Storage manager for accounts and resources
///
/// Every entity is stored whole under its tenant and ID. A missing entity is
/// reported as [`AppError::NotFound`].
#[async_trait]
pub trait DataManager: Send + Sync {
    async fn get_account(&self, tenant: &str, id: &str) -> Result<Account, AppError>;

    async fn set_account(&self, account: &Account) -> Result<(), AppError>;

    async fn remove_account(&self, tenant: &str, id: &str) -> Result<(), AppError>;

    /// Account IDs worth considering for `event`; `NotFound` when none
    async fn matching_account_ids(
        &self,
        tenant: &str,
        event: &ChargingEvent,
    ) -> Result<Vec<String>, AppError>;

    async fn get_resource(&self, tenant: &str, id: &str) -> Result<Resource, AppError>;

    async fn set_resource(&self, resource: &Resource) -> Result<(), AppError>;

    async fn remove_resource(&self, tenant: &str, id: &str) -> Result<(), AppError>;

    async fn get_resource_profile(
        &self,
        tenant: &str,
        id: &str,
    ) -> Result<ResourceProfile, AppError>;

    async fn set_resource_profile(&self, profile: &ResourceProfile) -> Result<(), AppError>;

    async fn remove_resource_profile(&self, tenant: &str, id: &str) -> Result<(), AppError>;

    /// Resource profile IDs worth considering for `event`; `NotFound` when none
    async fn matching_resource_profile_ids(
        &self,
        tenant: &str,
        event: &ChargingEvent,
    ) -> Result<Vec<String>, AppError>;
}

/// Connection manager for downstream services
#[async_trait]
pub trait ConnManager: Send + Sync {
    /// Calls `method` on the first reachable connection out of `conn_ids`
    ///
    /// Unreachable services surface as [`AppError::NotConnected`].
    async fn call(&self, conn_ids: &[String], method: &str, args: Value)
        -> Result<Value, AppError>;
}

/// Cache service trait
#[async_trait]
pub trait CacheService: Send + Sync {
    /// Get value from cache
    async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, AppError>;

    /// Set value in cache; a TTL of 0 never expires
    async fn set<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: u64,
    ) -> Result<(), AppError>;

    /// Delete value from cache
    async fn delete(&self, key: &str) -> Result<bool, AppError>;

    /// Check if key exists
    async fn exists(&self, key: &str) -> Result<bool, AppError>;
}
