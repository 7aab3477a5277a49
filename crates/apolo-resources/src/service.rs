//! Resource service
//!
//! Entry point of the resource engine. Matches the resources of an event,
//! runs admission on them, and persists changes according to the store
//! policy. Live resource state is kept in the cache and written back while
//! the resource is still locked.

use apolo_cache::keys::{self, RESOURCE_TTL_SECS};
use apolo_cache::{Guardian, MemoryCache};
use apolo_core::config::{AppConfig, ResourcesConfig, StorePolicy};
use apolo_core::decimal::decimal_from_value;
use apolo_core::models::event::USAGE_FIELD;
use apolo_core::models::{
    ChargingEvent, Resource, ResourceProfile, ResourceUsage, ResourceWithConfig,
};
use apolo_core::traits::{methods, CacheService, ConnManager, DataManager, FilterEvaluator};
use apolo_core::weights::weight_from_dynamics;
use apolo_core::{AppError, AppResult};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::constants::{
    EVENT_TYPE_FIELD, OPT_EVENT_TYPE, OPT_THRESHOLD_IDS, OPT_UNITS, OPT_USAGE_ID, OPT_USAGE_TTL,
    REPLY_OK, RESOURCE_ID_FIELD, RESOURCE_UPDATE,
};
use crate::resource::{LockHandle, TrackedProfile, TrackedResource};
use crate::resources::Resources;

/// Usage carried by a resource request
#[derive(Debug, Clone, PartialEq)]
pub struct UsageArgs {
    pub usage_id: String,

    /// Requested usage TTL; overrides the profile default unless zero
    pub ttl: Option<chrono::Duration>,

    pub units: Decimal,
}

impl UsageArgs {
    /// Reads the usage ID, TTL, and units out of the event options
    pub fn from_event(event: &ChargingEvent) -> AppResult<Self> {
        if event.id.is_empty() {
            return Err(AppError::mandatory_ie_missing(["ID"]));
        }
        let usage_id = event
            .opt(OPT_USAGE_ID)
            .and_then(apolo_core::models::event::value_as_string)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::mandatory_ie_missing(["UsageID"]))?;

        let ttl = match event.opt(OPT_USAGE_TTL) {
            None | Some(Value::Null) => None,
            Some(value) => {
                let ms = decimal_from_value(value)
                    .and_then(|d| d.trunc().to_i64())
                    .ok_or_else(|| {
                        AppError::InvalidInput(format!("{}: {}", OPT_USAGE_TTL, value))
                    })?;
                Some(chrono::Duration::milliseconds(ms))
            }
        };

        let units = match event.opt(OPT_UNITS) {
            None | Some(Value::Null) => Decimal::ONE,
            Some(value) => decimal_from_value(value)
                .ok_or_else(|| AppError::InvalidInput(format!("{}: {}", OPT_UNITS, value)))?,
        };

        Ok(Self {
            usage_id,
            ttl,
            units,
        })
    }

    fn usage(&self, tenant: &str) -> ResourceUsage {
        ResourceUsage::new(tenant, &self.usage_id, self.units)
    }
}

/// TTL applied to usages recorded on a resource of `profile`
fn resolve_ttl(
    requested: Option<chrono::Duration>,
    profile: &ResourceProfile,
) -> Option<chrono::Duration> {
    match requested {
        Some(ttl) if ttl != chrono::Duration::zero() => Some(ttl),
        Some(_) => None,
        None if profile.usage_ttl_ms >= 0 => {
            Some(chrono::Duration::milliseconds(profile.usage_ttl_ms))
        }
        None => None,
    }
}

struct BackupLoop {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Resource engine service
pub struct ResourceService {
    dm: Arc<dyn DataManager>,
    filters: Arc<dyn FilterEvaluator>,
    conns: Arc<dyn ConnManager>,
    cache: Arc<MemoryCache>,
    guardian: Arc<Guardian>,
    cfg: RwLock<ResourcesConfig>,
    default_tenant: String,
    locking_timeout: Duration,
    event_resources_ttl: u64,
    /// Resources waiting for the backup loop, as (tenant, id)
    stored_resources: Mutex<BTreeSet<(String, String)>>,
    backup: AsyncMutex<Option<BackupLoop>>,
}

impl std::fmt::Debug for ResourceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceService")
            .field("cfg", &*self.cfg.read())
            .field("default_tenant", &self.default_tenant)
            .field("pending", &self.stored_resources.lock().len())
            .finish()
    }
}

impl ResourceService {
    pub fn new(
        dm: Arc<dyn DataManager>,
        filters: Arc<dyn FilterEvaluator>,
        conns: Arc<dyn ConnManager>,
        cache: Arc<MemoryCache>,
        guardian: Arc<Guardian>,
        cfg: &AppConfig,
    ) -> Self {
        Self {
            dm,
            filters,
            conns,
            cache,
            guardian,
            cfg: RwLock::new(cfg.resources.clone()),
            default_tenant: cfg.general.default_tenant.clone(),
            locking_timeout: cfg.general.locking_timeout(),
            event_resources_ttl: cfg.cache.event_resources_ttl_secs,
            stored_resources: Mutex::new(BTreeSet::new()),
            backup: AsyncMutex::new(None),
        }
    }

    fn tenant<'a>(&'a self, tenant: &'a str) -> &'a str {
        if tenant.is_empty() {
            &self.default_tenant
        } else {
            tenant
        }
    }

    fn store_policy(&self) -> StorePolicy {
        self.cfg.read().store_policy()
    }

    /// Number of resources queued for the backup loop
    pub fn pending_store_count(&self) -> usize {
        self.stored_resources.lock().len()
    }

    // ==================== Lifecycle ====================

    /// Spawns the background loop
    ///
    /// Under the backup policy every tick stores the queued resources. Each
    /// tick also drops expired cache entries, so per-event matches never
    /// accumulate.
    pub async fn start_loop(self: &Arc<Self>) {
        let mut backup = self.backup.lock().await;
        if backup.is_some() {
            return;
        }
        let (interval, store) = match self.store_policy() {
            StorePolicy::Backup(interval) => (interval, true),
            _ => (Duration::from_secs(self.event_resources_ttl.max(1)), false),
        };

        let (stop, stop_rx) = oneshot::channel();
        let svc = Arc::clone(self);
        let handle = tokio::spawn(async move {
            svc.run_backup(interval, store, stop_rx).await;
        });
        info!(
            "Resource loop started, interval {:?}, storing: {}",
            interval, store
        );
        *backup = Some(BackupLoop { stop, handle });
    }

    async fn run_backup(&self, interval: Duration, store: bool, mut stop: oneshot::Receiver<()>) {
        loop {
            if store {
                self.store_resources().await;
            }
            let purged = self.cache.purge_expired();
            if purged > 0 {
                debug!("Purged {} expired cache entries", purged);
            }
            tokio::select! {
                _ = &mut stop => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn stop_loop(&self) {
        let Some(backup) = self.backup.lock().await.take() else {
            return;
        };
        let _ = backup.stop.send(());
        if let Err(e) = backup.handle.await {
            error!("Resource loop ended abnormally: {}", e);
        }
        info!("Resource loop stopped");
    }

    /// Applies a new configuration and restarts the background loop
    pub async fn reload(self: &Arc<Self>, cfg: &ResourcesConfig) {
        self.stop_loop().await;
        *self.cfg.write() = cfg.clone();
        self.start_loop().await;
    }

    /// Stops the background loop and stores whatever is still pending
    pub async fn shutdown(&self) {
        self.stop_loop().await;
        self.store_resources().await;
        info!("Resource service shut down");
    }

    // ==================== Persistence ====================

    async fn load_resource(&self, tenant: &str, id: &str) -> AppResult<Resource> {
        let key = keys::resource_key(tenant, id);
        if let Some(resource) = self.cache.get::<Resource>(&key).await? {
            return Ok(resource);
        }
        let resource = self.dm.get_resource(tenant, id).await?;
        self.cache.set(&key, &resource, RESOURCE_TTL_SECS).await?;
        Ok(resource)
    }

    /// Writes the live state of every matched resource back to the cache
    async fn cache_resources(&self, rs: &Resources) -> AppResult<()> {
        for r in rs.iter() {
            self.cache
                .set(
                    &keys::resource_key(r.tenant(), r.id()),
                    &r.resource,
                    RESOURCE_TTL_SECS,
                )
                .await?;
        }
        Ok(())
    }

    async fn persist(&self, resource: &Resource) -> AppResult<()> {
        if let Err(e) = self.dm.set_resource(resource).await {
            warn!("Failed saving resource {}: {}", resource.tenant_id(), e);
            return Err(e);
        }
        let key = keys::resource_key(&resource.tenant, &resource.id);
        if self.cache.exists(&key).await? {
            if let Err(e) = self.cache.set(&key, resource, RESOURCE_TTL_SECS).await {
                warn!("Failed caching resource {}: {}", resource.tenant_id(), e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Persists a dirty resource and clears its dirty flag
    pub async fn store_resource(&self, r: &mut TrackedResource) -> AppResult<()> {
        if !r.is_dirty() {
            return Ok(());
        }
        self.persist(&r.resource).await?;
        r.mark_clean();
        Ok(())
    }

    async fn store_matched_resources(&self, rs: &mut Resources) -> AppResult<()> {
        match self.store_policy() {
            StorePolicy::Disabled => Ok(()),
            StorePolicy::Backup(_) => {
                let mut stored = self.stored_resources.lock();
                for r in rs.iter_mut() {
                    if r.mark_dirty() {
                        stored.insert((r.tenant().to_string(), r.id().to_string()));
                    }
                }
                Ok(())
            }
            StorePolicy::Synchronous => {
                for r in rs.iter_mut() {
                    if r.mark_dirty() {
                        self.store_resource(r).await?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Drains the dirty set, re-queuing resources that failed to store
    pub async fn store_resources(&self) {
        let mut failed = Vec::new();
        loop {
            let next = self.stored_resources.lock().pop_first();
            let Some((tenant, id)) = next else {
                break;
            };
            if let Err(e) = self.store_cached(&tenant, &id).await {
                debug!("Re-queuing resource {}:{} after: {}", tenant, id, e);
                failed.push((tenant, id));
            }
            tokio::task::yield_now().await;
        }
        if !failed.is_empty() {
            warn!("{} resources could not be stored, retrying next backup", failed.len());
            self.stored_resources.lock().extend(failed);
        }
    }

    async fn store_cached(&self, tenant: &str, id: &str) -> AppResult<()> {
        let _lock = LockHandle::acquire(
            &self.guardian,
            keys::resource_lock_key(tenant, id),
            self.locking_timeout,
        )
        .await?;
        let Some(resource) = self
            .cache
            .get::<Resource>(&keys::resource_key(tenant, id))
            .await?
        else {
            warn!("Failed retrieving from cache resource {}:{}", tenant, id);
            return Ok(());
        };
        self.persist(&resource).await
    }

    // ==================== Matching ====================

    /// Resources of `event`, locked, highest weight first
    ///
    /// The matched IDs are cached per usage ID, including the absence of any
    /// match. A cached set is dropped again when a later step fails.
    async fn matching_resources_for_event(
        &self,
        tenant: &str,
        event: &ChargingEvent,
        args: &UsageArgs,
    ) -> AppResult<Resources> {
        let cache_key = keys::event_resources_key(&args.usage_id);
        let cached: Option<Option<Vec<String>>> = self.cache.get(&cache_key).await?;
        let (ids, from_cache) = match cached {
            Some(None) => return Err(AppError::not_found()),
            Some(Some(ids)) => (ids, true),
            None => match self.dm.matching_resource_profile_ids(tenant, event).await {
                Ok(ids) => (ids, false),
                Err(e) if e.is_not_found() => {
                    self.cache
                        .set::<Option<Vec<String>>>(&cache_key, &None, self.event_resources_ttl)
                        .await?;
                    return Err(e);
                }
                Err(e) => return Err(e),
            },
        };

        let result = match self.lock_matching(tenant, event, ids, args.ttl).await {
            Ok(rs) => {
                let mut ids = rs.ids();
                ids.sort();
                self.cache
                    .set(&cache_key, &Some(ids), self.event_resources_ttl)
                    .await
                    .map(|_| rs)
            }
            Err(e) => Err(e),
        };
        if result.is_err() && from_cache {
            self.cache.delete(&cache_key).await?;
        }
        result
    }

    async fn lock_matching(
        &self,
        tenant: &str,
        event: &ChargingEvent,
        mut ids: Vec<String>,
        ttl: Option<chrono::Duration>,
    ) -> AppResult<Resources> {
        // a stable order keeps concurrent requests from deadlocking
        ids.sort();
        ids.dedup();

        let mut weighted: Vec<(TrackedResource, f64)> = Vec::with_capacity(ids.len());
        for id in &ids {
            let prf_lock = LockHandle::acquire(
                &self.guardian,
                keys::resource_profile_lock_key(tenant, id),
                self.locking_timeout,
            )
            .await?;
            let profile = match self.dm.get_resource_profile(tenant, id).await {
                Ok(profile) => profile,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            if !self.filters.pass(tenant, &profile.filter_ids, event).await? {
                continue;
            }

            let res_lock = LockHandle::acquire(
                &self.guardian,
                keys::resource_lock_key(&profile.tenant, &profile.id),
                self.locking_timeout,
            )
            .await?;
            let resource = self.load_resource(&profile.tenant, &profile.id).await?;
            let weight =
                weight_from_dynamics(&profile.weights, self.filters.as_ref(), tenant, event)
                    .await?;

            let stored = profile.stored;
            let ttl = resolve_ttl(ttl, &profile);
            let mut r = TrackedResource::new(resource)
                .with_lock(res_lock)
                .with_profile(TrackedProfile::locked(profile, prf_lock))
                .with_ttl(ttl);
            if stored {
                r.track_changes();
            }
            weighted.push((r, weight));
        }

        if weighted.is_empty() {
            return Err(AppError::not_found());
        }
        Ok(Resources::from_weighted(weighted))
    }

    // ==================== Thresholds ====================

    /// Notifies the threshold service of the new totals
    async fn process_thresholds(
        &self,
        rs: &mut Resources,
        opts: &HashMap<String, Value>,
    ) -> AppResult<()> {
        let conns = self.cfg.read().thresholds_conns.clone();
        if conns.is_empty() {
            return Ok(());
        }

        let mut with_errors = false;
        for r in rs.iter_mut() {
            let threshold_ids = match r.profile() {
                Some(profile) if !profile.thresholds_disabled() => profile.threshold_ids.clone(),
                _ => continue,
            };
            let total = r.total_usage();

            let mut event = ChargingEvent::new(r.tenant(), Uuid::new_v4().to_string())
                .with_field(EVENT_TYPE_FIELD, RESOURCE_UPDATE)
                .with_field(RESOURCE_ID_FIELD, r.id())
                .with_field(USAGE_FIELD, total.to_string());
            event.time = Some(Utc::now());
            event.api_opts = opts.clone();
            event
                .api_opts
                .insert(OPT_EVENT_TYPE.to_string(), json!(RESOURCE_UPDATE));
            event
                .api_opts
                .insert(OPT_THRESHOLD_IDS.to_string(), json!(threshold_ids));

            let args = serde_json::to_value(&event)?;
            if let Err(e) = self
                .conns
                .call(&conns, methods::THRESHOLDS_PROCESS_EVENT, args)
                .await
            {
                if !threshold_ids.is_empty() || !e.is_not_found() {
                    warn!(
                        "Error {} processing event {} for resource {} with thresholds",
                        e,
                        event.id,
                        r.id()
                    );
                    with_errors = true;
                }
            }
        }
        if with_errors {
            return Err(AppError::PartiallyExecuted);
        }
        Ok(())
    }

    // ==================== API ====================

    /// Resources matching `event`
    #[instrument(skip(self, event), fields(event = %event.id))]
    pub async fn resources_for_event(&self, event: &ChargingEvent) -> AppResult<Vec<Resource>> {
        let args = UsageArgs::from_event(event)?;
        let tenant = self.tenant(&event.tenant);
        let rs = self.matching_resources_for_event(tenant, event, &args).await?;
        Ok(rs.into_iter().map(|r| r.resource).collect())
    }

    /// Checks whether the usage would be admitted, without recording it
    #[instrument(skip(self, event), fields(event = %event.id))]
    pub async fn authorize_resources(&self, event: &ChargingEvent) -> AppResult<String> {
        let args = UsageArgs::from_event(event)?;
        let tenant = self.tenant(&event.tenant);
        let mut rs = self.matching_resources_for_event(tenant, event, &args).await?;

        let result = rs.allocate_resource(&args.usage(tenant), true);
        self.cache_resources(&rs).await?;
        match result {
            Err(AppError::ResourceUnavailable) => Err(AppError::ResourceUnauthorized),
            other => other,
        }
    }

    /// Admits and records the usage on every matched resource
    #[instrument(skip(self, event), fields(event = %event.id))]
    pub async fn allocate_resources(&self, event: &ChargingEvent) -> AppResult<String> {
        let args = UsageArgs::from_event(event)?;
        let tenant = self.tenant(&event.tenant);
        let mut rs = self.matching_resources_for_event(tenant, event, &args).await?;

        let message = rs.allocate_resource(&args.usage(tenant), false)?;
        self.cache_resources(&rs).await?;
        self.store_matched_resources(&mut rs).await?;
        self.process_thresholds(&mut rs, &event.api_opts).await?;
        info!(
            "Allocated {} units for usage {} on {:?}",
            args.units,
            args.usage_id,
            rs.ids()
        );
        Ok(message)
    }

    /// Gives the usage back to every matched resource
    #[instrument(skip(self, event), fields(event = %event.id))]
    pub async fn release_resources(&self, event: &ChargingEvent) -> AppResult<String> {
        let args = UsageArgs::from_event(event)?;
        let tenant = self.tenant(&event.tenant);
        let mut rs = self.matching_resources_for_event(tenant, event, &args).await?;

        let cleared = rs.clear_usage(&args.usage_id);
        self.cache_resources(&rs).await?;
        self.store_matched_resources(&mut rs).await?;
        cleared?;
        self.process_thresholds(&mut rs, &event.api_opts).await?;
        info!("Released usage {} on {:?}", args.usage_id, rs.ids());
        Ok(REPLY_OK.to_string())
    }

    /// Live state of one resource
    pub async fn get_resource(&self, tenant: &str, id: &str) -> AppResult<Resource> {
        let tenant = self.tenant(tenant);
        self.guardian
            .guard(
                &[keys::resource_lock_key(tenant, id)],
                self.locking_timeout,
                || self.load_resource(tenant, id),
            )
            .await
    }

    /// Live state of one resource together with its profile
    pub async fn get_resource_with_config(
        &self,
        tenant: &str,
        id: &str,
    ) -> AppResult<ResourceWithConfig> {
        let tenant = self.tenant(tenant);
        let _prf_lock = LockHandle::acquire(
            &self.guardian,
            keys::resource_profile_lock_key(tenant, id),
            self.locking_timeout,
        )
        .await?;
        let config = self.dm.get_resource_profile(tenant, id).await?;
        let _res_lock = LockHandle::acquire(
            &self.guardian,
            keys::resource_lock_key(tenant, id),
            self.locking_timeout,
        )
        .await?;
        let resource = self.load_resource(tenant, id).await?;
        Ok(ResourceWithConfig { resource, config })
    }

    pub async fn get_resource_profile(&self, tenant: &str, id: &str) -> AppResult<ResourceProfile> {
        self.dm.get_resource_profile(self.tenant(tenant), id).await
    }

    /// Stores a profile, creating an empty resource for it when missing
    pub async fn set_resource_profile(&self, mut profile: ResourceProfile) -> AppResult<()> {
        if profile.id.is_empty() {
            return Err(AppError::mandatory_ie_missing(["ID"]));
        }
        if profile.tenant.is_empty() {
            profile.tenant = self.default_tenant.clone();
        }
        let (tenant, id) = (profile.tenant.as_str(), profile.id.as_str());

        self.guardian
            .guard(
                &[keys::resource_profile_lock_key(tenant, id)],
                self.locking_timeout,
                || self.dm.set_resource_profile(&profile),
            )
            .await?;
        self.guardian
            .guard(
                &[keys::resource_lock_key(tenant, id)],
                self.locking_timeout,
                || async move {
                    match self.dm.get_resource(tenant, id).await {
                        Ok(_) => Ok(()),
                        Err(e) if e.is_not_found() => {
                            self.dm.set_resource(&Resource::new(tenant, id)).await
                        }
                        Err(e) => Err(e),
                    }
                },
            )
            .await?;
        info!("Resource profile {}:{} stored", tenant, id);
        Ok(())
    }

    /// Removes a profile along with its resource
    pub async fn remove_resource_profile(&self, tenant: &str, id: &str) -> AppResult<()> {
        let tenant = self.tenant(tenant);
        self.guardian
            .guard(
                &[keys::resource_profile_lock_key(tenant, id)],
                self.locking_timeout,
                || self.dm.remove_resource_profile(tenant, id),
            )
            .await?;
        self.guardian
            .guard(
                &[keys::resource_lock_key(tenant, id)],
                self.locking_timeout,
                || async move {
                    match self.dm.remove_resource(tenant, id).await {
                        Err(e) if !e.is_not_found() => return Err(e),
                        _ => {}
                    }
                    self.cache.delete(&keys::resource_key(tenant, id)).await?;
                    self.stored_resources
                        .lock()
                        .remove(&(tenant.to_string(), id.to_string()));
                    Ok::<(), AppError>(())
                },
            )
            .await?;
        info!("Resource profile {}:{} removed", tenant, id);
        Ok(())
    }
}
