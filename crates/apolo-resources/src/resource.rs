//! A matched resource and the locks it holds
//!
//! [`TrackedResource`] wraps the stored [`Resource`] with the request-scoped
//! state the engine needs: the resource lock, the profile (itself locked),
//! the usage TTL resolved for this request, a lazily computed total, and the
//! dirty flag driving persistence.

use apolo_cache::Guardian;
use apolo_core::models::{Resource, ResourceProfile, ResourceUsage};
use apolo_core::{AppError, AppResult, Snapshot};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Named lock released on drop
pub struct LockHandle {
    guardian: Arc<Guardian>,
    ref_id: String,
}

impl LockHandle {
    /// Acquires `key`, failing with `LockTimeout` after `timeout`
    pub async fn acquire(
        guardian: &Arc<Guardian>,
        key: String,
        timeout: std::time::Duration,
    ) -> AppResult<Self> {
        let ref_id = guardian.guard_ids(&[key], timeout).await?;
        Ok(Self {
            guardian: Arc::clone(guardian),
            ref_id,
        })
    }

    pub fn ref_id(&self) -> &str {
        &self.ref_id
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.guardian.unguard_ids(&self.ref_id);
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("ref_id", &self.ref_id)
            .finish()
    }
}

/// A resource profile, locked for the duration of a request
#[derive(Debug)]
pub struct TrackedProfile {
    pub profile: ResourceProfile,
    lock: Option<LockHandle>,
}

impl TrackedProfile {
    pub fn new(profile: ResourceProfile) -> Self {
        Self {
            profile,
            lock: None,
        }
    }

    pub fn locked(profile: ResourceProfile, lock: LockHandle) -> Self {
        Self {
            profile,
            lock: Some(lock),
        }
    }

    pub fn unlock(&mut self) {
        self.lock = None;
    }
}

/// Mutable part of a resource, for checkpoints
#[derive(Debug, Clone, PartialEq)]
pub struct UsageState {
    usages: HashMap<String, ResourceUsage>,
    ttl_idx: Vec<String>,
    total: Option<Decimal>,
}

/// A resource matched for one request
///
/// The resource lock is declared before the profile so it is released first.
#[derive(Debug)]
pub struct TrackedResource {
    pub resource: Resource,
    lock: Option<LockHandle>,
    profile: Option<TrackedProfile>,
    ttl: Option<Duration>,
    total: Option<Decimal>,
    dirty: Option<bool>,
}

impl TrackedResource {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            lock: None,
            profile: None,
            ttl: None,
            total: None,
            dirty: None,
        }
    }

    pub fn with_lock(mut self, lock: LockHandle) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn with_profile(mut self, profile: TrackedProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    /// TTL applied to usages recorded through this handle
    ///
    /// `None` or a negative TTL records usages without expiry. A zero TTL
    /// records nothing.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn id(&self) -> &str {
        &self.resource.id
    }

    pub fn tenant(&self) -> &str {
        &self.resource.tenant
    }

    pub fn profile(&self) -> Option<&ResourceProfile> {
        self.profile.as_ref().map(|p| &p.profile)
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Starts tracking changes for persistence
    pub fn track_changes(&mut self) {
        if self.dirty.is_none() {
            self.dirty = Some(false);
        }
    }

    /// True when changes are tracked for persistence
    pub fn is_tracked(&self) -> bool {
        self.dirty.is_some()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty == Some(true)
    }

    /// Flags a tracked resource as needing a write; untracked ones are ignored
    pub fn mark_dirty(&mut self) -> bool {
        match self.dirty.as_mut() {
            Some(dirty) => {
                *dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn mark_clean(&mut self) {
        if let Some(dirty) = self.dirty.as_mut() {
            *dirty = false;
        }
    }

    /// Releases the resource lock, then the profile lock
    pub fn unlock(&mut self) {
        self.lock = None;
        if let Some(profile) = self.profile.as_mut() {
            profile.unlock();
        }
    }

    /// Sum of the recorded units, computed once and then kept current
    pub fn total_usage(&mut self) -> Decimal {
        match self.total {
            Some(total) => total,
            None => {
                let total = self.resource.total_usage();
                self.total = Some(total);
                total
            }
        }
    }

    /// Records a new usage
    pub fn record_usage(&mut self, usage: &ResourceUsage) -> AppResult<()> {
        if self.resource.usages.contains_key(&usage.id) {
            return Err(AppError::DuplicateUsage(usage.tenant_id()));
        }
        let mut usage = usage.clone();
        match self.ttl {
            Some(ttl) if ttl == Duration::zero() => {
                debug!(
                    "Zero TTL on resource {}, usage {} not recorded",
                    self.resource.id, usage.id
                );
                return Ok(());
            }
            Some(ttl) if ttl > Duration::zero() => {
                usage.expiry_time = Some(Utc::now() + ttl);
            }
            _ => {}
        }

        if let Some(expiry) = usage.expiry_time {
            let usages = &self.resource.usages;
            let pos = self
                .resource
                .ttl_idx
                .iter()
                .position(|id| {
                    usages
                        .get(id)
                        .and_then(|u| u.expiry_time)
                        .is_some_and(|e| e > expiry)
                })
                .unwrap_or(self.resource.ttl_idx.len());
            self.resource.ttl_idx.insert(pos, usage.id.clone());
        }
        if let Some(total) = self.total.as_mut() {
            *total += usage.units;
        }
        self.resource.usages.insert(usage.id.clone(), usage);
        Ok(())
    }

    /// Removes the usage with `id`
    pub fn clear_usage(&mut self, id: &str) -> AppResult<()> {
        let usage = self
            .resource
            .usages
            .remove(id)
            .ok_or_else(|| AppError::UsageNotFound(id.to_string()))?;
        if usage.expiry_time.is_some() {
            self.resource.ttl_idx.retain(|idx| idx != id);
        }
        if let Some(total) = self.total.as_mut() {
            *total -= usage.units;
        }
        Ok(())
    }

    /// Drops expired usages from the front of the TTL index
    pub fn remove_expired_units(&mut self) -> usize {
        self.remove_expired_units_at(Utc::now())
    }

    pub(crate) fn remove_expired_units_at(&mut self, now: DateTime<Utc>) -> usize {
        let usages = &self.resource.usages;
        let first_active = self
            .resource
            .ttl_idx
            .iter()
            .position(|id| usages.get(id).is_some_and(|u| u.is_active(now)))
            .unwrap_or(self.resource.ttl_idx.len());
        if first_active == 0 {
            return 0;
        }

        let expired: Vec<String> = self.resource.ttl_idx.drain(..first_active).collect();
        let mut removed = 0;
        for id in expired {
            let Some(usage) = self.resource.usages.remove(&id) else {
                continue;
            };
            removed += 1;
            if let Some(total) = self.total.as_mut() {
                *total -= usage.units;
            }
        }
        if let Some(total) = self.total {
            if total < Decimal::ZERO {
                warn!(
                    "Resetting total usage for resource {}, usage smaller than 0: {}",
                    self.resource.id, total
                );
                self.total = None;
            }
        }
        removed
    }
}

impl Snapshot for TrackedResource {
    type State = UsageState;

    fn capture(&self) -> UsageState {
        UsageState {
            usages: self.resource.usages.clone(),
            ttl_idx: self.resource.ttl_idx.clone(),
            total: self.total,
        }
    }

    fn restore(&mut self, state: UsageState) {
        self.resource.usages = state.usages;
        self.resource.ttl_idx = state.ttl_idx;
        self.total = state.total;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn usage(id: &str, units: Decimal) -> ResourceUsage {
        ResourceUsage::new("apolo.net", id, units)
    }

    fn expiring(id: &str, units: Decimal, expiry: DateTime<Utc>) -> ResourceUsage {
        let mut u = usage(id, units);
        u.expiry_time = Some(expiry);
        u
    }

    fn tracked() -> TrackedResource {
        TrackedResource::new(Resource::new("apolo.net", "RES1"))
    }

    #[test]
    fn test_record_and_clear() {
        let mut r = tracked();
        assert_eq!(r.total_usage(), dec!(0));

        r.record_usage(&usage("RU1", dec!(2))).unwrap();
        r.record_usage(&usage("RU2", dec!(3))).unwrap();
        assert_eq!(r.total_usage(), dec!(5));
        assert!(r.resource.ttl_idx.is_empty());

        assert_eq!(
            r.record_usage(&usage("RU1", dec!(1))).unwrap_err(),
            AppError::DuplicateUsage("apolo.net:RU1".to_string())
        );

        r.clear_usage("RU1").unwrap();
        assert_eq!(r.total_usage(), dec!(3));
        assert_eq!(
            r.clear_usage("RU1").unwrap_err(),
            AppError::UsageNotFound("RU1".to_string())
        );
    }

    #[test]
    fn test_zero_ttl_records_nothing() {
        let mut r = tracked().with_ttl(Some(Duration::zero()));
        r.record_usage(&usage("RU1", dec!(2))).unwrap();
        assert!(r.resource.usages.is_empty());
        assert_eq!(r.total_usage(), dec!(0));
    }

    #[test]
    fn test_ttl_stamps_and_indexes_by_expiry() {
        let mut r = tracked().with_ttl(Some(Duration::minutes(10)));
        r.record_usage(&usage("RU_LONG", dec!(1))).unwrap();

        r = r.with_ttl(Some(Duration::minutes(1)));
        r.record_usage(&usage("RU_SHORT", dec!(1))).unwrap();

        // negative TTL means no expiry
        r = r.with_ttl(Some(Duration::milliseconds(-1)));
        r.record_usage(&usage("RU_FOREVER", dec!(1))).unwrap();

        assert_eq!(r.resource.ttl_idx, vec!["RU_SHORT", "RU_LONG"]);
        assert!(r.resource.usages["RU_LONG"].expiry_time.is_some());
        assert!(r.resource.usages["RU_FOREVER"].expiry_time.is_none());

        r.clear_usage("RU_SHORT").unwrap();
        assert_eq!(r.resource.ttl_idx, vec!["RU_LONG"]);
    }

    #[test]
    fn test_remove_expired_units() {
        let now = Utc::now();
        let mut r = tracked();
        r.record_usage(&expiring("RU1", dec!(1), now - Duration::seconds(5)))
            .unwrap();
        r.record_usage(&expiring("RU2", dec!(2), now - Duration::seconds(1)))
            .unwrap();
        r.record_usage(&expiring("RU3", dec!(4), now + Duration::minutes(1)))
            .unwrap();
        r.record_usage(&usage("RU4", dec!(8))).unwrap();
        r.resource.ttl_idx.insert(0, "RU_GONE".to_string());
        assert_eq!(r.total_usage(), dec!(15));

        assert_eq!(r.remove_expired_units_at(now), 2);
        assert_eq!(r.resource.ttl_idx, vec!["RU3"]);
        assert_eq!(r.total_usage(), dec!(12));
        assert_eq!(r.remove_expired_units_at(now), 0);
    }

    #[test]
    fn test_negative_total_is_recomputed() {
        let now = Utc::now();
        let mut r = tracked();
        r.record_usage(&expiring("RU1", dec!(3), now - Duration::seconds(1)))
            .unwrap();
        r.record_usage(&usage("RU2", dec!(1))).unwrap();
        r.total = Some(dec!(1));

        r.remove_expired_units_at(now);
        assert_eq!(r.total, None);
        assert_eq!(r.total_usage(), dec!(1));
    }

    #[test]
    fn test_dirty_tracking() {
        let mut r = tracked();
        assert!(!r.mark_dirty());
        assert!(!r.is_tracked());

        r.track_changes();
        assert!(r.is_tracked());
        assert!(!r.is_dirty());
        assert!(r.mark_dirty());
        assert!(r.is_dirty());

        r.track_changes();
        assert!(r.is_dirty());
        r.mark_clean();
        assert!(!r.is_dirty());
    }

    #[tokio::test]
    async fn test_locks_released_on_drop() {
        let guardian = Arc::new(Guardian::new());
        let timeout = std::time::Duration::from_millis(50);
        let prf_lock = LockHandle::acquire(&guardian, "lock:prf".to_string(), timeout)
            .await
            .unwrap();
        let res_lock = LockHandle::acquire(&guardian, "lock:res".to_string(), timeout)
            .await
            .unwrap();

        let profile = TrackedProfile::locked(
            ResourceProfile::new("apolo.net", "RES1", dec!(10)),
            prf_lock,
        );
        let mut r = tracked().with_lock(res_lock).with_profile(profile);
        assert!(r.is_locked());
        assert_eq!(guardian.held_count(), 2);

        r.unlock();
        assert!(!r.is_locked());
        assert_eq!(guardian.held_count(), 0);

        let lock = LockHandle::acquire(&guardian, "lock:res".to_string(), timeout)
            .await
            .unwrap();
        let r = tracked().with_lock(lock);
        assert_eq!(guardian.held_count(), 1);
        drop(r);
        assert_eq!(guardian.held_count(), 0);
    }

    proptest! {
        #[test]
        fn prop_record_then_clear_restores_state(
            existing in prop::collection::vec((1u32..50, -60i64..600), 0..8),
            units in 1u32..50,
            ttl_secs in prop::option::of(-1i64..600),
        ) {
            let now = Utc::now();
            let mut r = tracked();
            for (i, (u, exp)) in existing.iter().enumerate() {
                let id = format!("RU{}", i);
                let ru = if *exp < 0 {
                    usage(&id, Decimal::from(*u))
                } else {
                    expiring(&id, Decimal::from(*u), now + Duration::seconds(*exp))
                };
                r.record_usage(&ru).unwrap();
            }
            r.total_usage();
            let before = r.capture();

            r = r.with_ttl(ttl_secs.map(Duration::seconds));
            r.record_usage(&usage("RU_NEW", Decimal::from(units))).unwrap();
            let recorded = r.resource.usages.contains_key("RU_NEW");
            match r.clear_usage("RU_NEW") {
                Ok(()) => prop_assert!(recorded),
                Err(_) => prop_assert!(!recorded),
            }
            prop_assert_eq!(r.capture(), before);
        }

        #[test]
        fn prop_sweep_never_grows_usage(
            expiries in prop::collection::vec(-120i64..120, 0..12),
        ) {
            let now = Utc::now();
            let mut r = tracked().with_ttl(None);
            for (i, exp) in expiries.iter().enumerate() {
                r.record_usage(&expiring(&format!("RU{}", i), Decimal::ONE, now + Duration::seconds(*exp)))
                    .unwrap();
            }
            let before = r.total_usage();
            let removed = r.remove_expired_units_at(now);
            let after = r.total_usage();

            prop_assert!(after <= before);
            prop_assert_eq!(before - after, Decimal::from(removed));
            prop_assert!(r.resource.usages.values().all(|u| u.is_active(now)));
        }
    }
}
