//! The set of resources matched for one event

use apolo_core::models::resource::UNLIMITED;
use apolo_core::models::ResourceUsage;
use apolo_core::{AppError, AppResult, Checkpoint};
use chrono::Duration;
use std::cmp::Ordering;
use tracing::{debug, warn};

use crate::resource::TrackedResource;

/// Matched resources, highest weight first
#[derive(Debug, Default)]
pub struct Resources(Vec<TrackedResource>);

impl Resources {
    pub fn new(items: Vec<TrackedResource>) -> Self {
        Self(items)
    }

    /// Orders by descending weight and applies the first blocker
    ///
    /// Equal weights keep their input order. Everything after a blocking
    /// resource is dropped, releasing its locks.
    pub fn from_weighted(mut weighted: Vec<(TrackedResource, f64)>) -> Self {
        weighted.sort_by(|(_, a), (_, b)| b.partial_cmp(a).unwrap_or(Ordering::Equal));
        let blocker = weighted
            .iter()
            .position(|(r, _)| r.profile().is_some_and(|p| p.blocker));
        if let Some(idx) = blocker {
            if idx + 1 < weighted.len() {
                debug!(
                    "Resource {} blocks {} lower weight resources",
                    weighted[idx].0.id(),
                    weighted.len() - idx - 1
                );
                weighted.truncate(idx + 1);
            }
        }
        Self(weighted.into_iter().map(|(r, _)| r).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TrackedResource> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, TrackedResource> {
        self.0.iter_mut()
    }

    pub fn into_inner(self) -> Vec<TrackedResource> {
        self.0
    }

    pub fn ids(&self) -> Vec<String> {
        self.0.iter().map(|r| r.id().to_string()).collect()
    }

    /// Releases every lock held by the set
    pub fn unlock(&mut self) {
        for r in self.0.iter_mut() {
            r.unlock();
        }
    }

    /// Records `usage` on every resource or on none
    pub fn record_usage(&mut self, usage: &ResourceUsage) -> AppResult<()> {
        let mut recorded = 0;
        let mut failure = None;
        for r in self.0.iter_mut() {
            if let Err(e) = r.record_usage(usage) {
                warn!("Cannot record usage on resource {}: {}", r.id(), e);
                failure = Some(e);
                break;
            }
            recorded += 1;
        }
        let Some(err) = failure else {
            return Ok(());
        };
        for r in self.0[..recorded].iter_mut() {
            if let Err(e) = r.clear_usage(&usage.id) {
                warn!("Cannot clear usage on resource {}: {}", r.id(), e);
            }
        }
        Err(err)
    }

    /// Gives the units of `usage_id` back to every resource
    ///
    /// A missing usage only counts as an error on resources recording with a
    /// non-zero TTL.
    pub fn clear_usage(&mut self, usage_id: &str) -> AppResult<()> {
        let mut result = Ok(());
        for r in self.0.iter_mut() {
            if let Err(e) = r.clear_usage(usage_id) {
                if r.ttl().is_some_and(|ttl| ttl != Duration::zero()) {
                    warn!("Clear of usage {} on resource {}: {}", usage_id, r.id(), e);
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Checks whether `usage` fits and, unless `dry_run`, records it
    ///
    /// Returns the allocation message of the first resource with room for
    /// the units. A real run that fails leaves the set as it found it.
    pub fn allocate_resource(&mut self, usage: &ResourceUsage, dry_run: bool) -> AppResult<String> {
        if self.0.is_empty() {
            return Err(AppError::ResourceUnavailable);
        }
        if dry_run {
            return self.admit(usage, false);
        }

        let checkpoint = Checkpoint::capture(self.0.as_slice());
        let result = match self.admit(usage, true) {
            Ok(message) => self.record_usage(usage).map(|_| message),
            Err(e) => Err(e),
        };
        match result {
            Ok(message) => {
                checkpoint.commit();
                Ok(message)
            }
            Err(e) => {
                checkpoint.rollback(self.0.as_mut_slice());
                Err(e)
            }
        }
    }

    fn admit(&mut self, usage: &ResourceUsage, replace: bool) -> AppResult<String> {
        let mut message: Option<String> = None;
        for r in self.0.iter_mut() {
            r.remove_expired_units();
            if replace && r.resource.usages.contains_key(&usage.id) {
                r.clear_usage(&usage.id)?;
            }
            let total = r.total_usage();
            let Some(profile) = r.profile() else {
                return Err(AppError::MissingProfile(r.resource.tenant_id()));
            };
            if message.is_none() && (profile.limit == UNLIMITED || profile.limit >= total + usage.units)
            {
                message = Some(if profile.allocation_message.is_empty() {
                    profile.id.clone()
                } else {
                    profile.allocation_message.clone()
                });
            }
        }
        message.ok_or(AppError::ResourceUnavailable)
    }
}

impl IntoIterator for Resources {
    type Item = TrackedResource;
    type IntoIter = std::vec::IntoIter<TrackedResource>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
