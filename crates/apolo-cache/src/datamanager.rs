//! In-memory data manager
//!
//! Keeps every account, resource, and resource profile as a whole serialized
//! entity keyed by `tenant:id`. Good enough as the process-local store and for
//! tests; a persistent driver implements the same trait.

use apolo_core::error::AppError;
use apolo_core::models::{Account, ChargingEvent, Resource, ResourceProfile};
use apolo_core::traits::DataManager;
use apolo_core::AppResult;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Default)]
struct Table {
    rows: RwLock<BTreeMap<String, String>>,
}

impl Table {
    fn key(tenant: &str, id: &str) -> String {
        format!("{}:{}", tenant, id)
    }

    fn get<T: DeserializeOwned>(&self, tenant: &str, id: &str) -> AppResult<T> {
        let rows = self.rows.read();
        let raw = rows
            .get(&Self::key(tenant, id))
            .ok_or_else(AppError::not_found)?;
        Ok(serde_json::from_str(raw)?)
    }

    fn set<T: Serialize>(&self, tenant: &str, id: &str, value: &T) -> AppResult<()> {
        let raw = serde_json::to_string(value)?;
        self.rows.write().insert(Self::key(tenant, id), raw);
        Ok(())
    }

    fn remove(&self, tenant: &str, id: &str) -> AppResult<()> {
        self.rows
            .write()
            .remove(&Self::key(tenant, id))
            .map(|_| ())
            .ok_or_else(AppError::not_found)
    }

    fn ids_for_tenant(&self, tenant: &str) -> AppResult<Vec<String>> {
        let prefix = format!("{}:", tenant);
        let ids: Vec<String> = self
            .rows
            .read()
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect();
        if ids.is_empty() {
            return Err(AppError::not_found());
        }
        Ok(ids)
    }
}

/// [`DataManager`] backed by process memory
///
/// Matching queries return every ID of the tenant; filtering against the
/// event is left to the engines.
#[derive(Debug, Default)]
pub struct InMemoryDataManager {
    accounts: Table,
    resources: Table,
    resource_profiles: Table,
}

impl InMemoryDataManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DataManager for InMemoryDataManager {
    async fn get_account(&self, tenant: &str, id: &str) -> AppResult<Account> {
        self.accounts.get(tenant, id)
    }

    async fn set_account(&self, account: &Account) -> AppResult<()> {
        debug!("Storing account {}", account.tenant_id());
        self.accounts.set(&account.tenant, &account.id, account)
    }

    async fn remove_account(&self, tenant: &str, id: &str) -> AppResult<()> {
        self.accounts.remove(tenant, id)
    }

    async fn matching_account_ids(
        &self,
        tenant: &str,
        _event: &ChargingEvent,
    ) -> AppResult<Vec<String>> {
        self.accounts.ids_for_tenant(tenant)
    }

    async fn get_resource(&self, tenant: &str, id: &str) -> AppResult<Resource> {
        self.resources.get(tenant, id)
    }

    async fn set_resource(&self, resource: &Resource) -> AppResult<()> {
        debug!("Storing resource {}", resource.tenant_id());
        self.resources.set(&resource.tenant, &resource.id, resource)
    }

    async fn remove_resource(&self, tenant: &str, id: &str) -> AppResult<()> {
        self.resources.remove(tenant, id)
    }

    async fn get_resource_profile(&self, tenant: &str, id: &str) -> AppResult<ResourceProfile> {
        self.resource_profiles.get(tenant, id)
    }

    async fn set_resource_profile(&self, profile: &ResourceProfile) -> AppResult<()> {
        self.resource_profiles
            .set(&profile.tenant, &profile.id, profile)
    }

    async fn remove_resource_profile(&self, tenant: &str, id: &str) -> AppResult<()> {
        self.resource_profiles.remove(tenant, id)
    }

    async fn matching_resource_profile_ids(
        &self,
        tenant: &str,
        _event: &ChargingEvent,
    ) -> AppResult<Vec<String>> {
        self.resource_profiles.ids_for_tenant(tenant)
    }
}
