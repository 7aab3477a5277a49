//! Resource models
//!
//! A resource is a shared capacity pool tracked through usage records. Its
//! profile holds the static configuration (limit, weights, TTL, thresholds).

use crate::weights::DynamicWeight;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Threshold ID sentinel disabling threshold notification
pub const META_NONE: &str = "*none";

/// Limit value meaning "no capacity limit"
pub const UNLIMITED: Decimal = Decimal::NEGATIVE_ONE;

/// One usage recorded on a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    #[serde(rename = "Tenant")]
    pub tenant: String,

    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "ExpiryTime", skip_serializing_if = "Option::is_none")]
    pub expiry_time: Option<DateTime<Utc>>,

    #[serde(rename = "Units")]
    pub units: Decimal,
}

impl ResourceUsage {
    pub fn new(tenant: impl Into<String>, id: impl Into<String>, units: Decimal) -> Self {
        Self {
            tenant: tenant.into(),
            id: id.into(),
            expiry_time: None,
            units,
        }
    }

    /// `tenant:id`
    pub fn tenant_id(&self) -> String {
        format!("{}:{}", self.tenant, self.id)
    }

    /// A usage without expiry never expires
    pub fn is_active(&self, at: DateTime<Utc>) -> bool {
        self.expiry_time.map_or(true, |exp| exp > at)
    }
}

/// Persisted resource state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "Tenant")]
    pub tenant: String,

    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "Usages", default)]
    pub usages: HashMap<String, ResourceUsage>,

    /// Usage IDs with an expiry, oldest expiry first
    #[serde(rename = "TTLIdx", default)]
    pub ttl_idx: Vec<String>,
}

impl Resource {
    pub fn new(tenant: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            id: id.into(),
            ..Default::default()
        }
    }

    /// `tenant:id`
    pub fn tenant_id(&self) -> String {
        format!("{}:{}", self.tenant, self.id)
    }

    /// Sum of all recorded units
    pub fn total_usage(&self) -> Decimal {
        self.usages.values().map(|u| u.units).sum()
    }
}

/// Static configuration of a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceProfile {
    #[serde(rename = "Tenant")]
    pub tenant: String,

    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "FilterIDs", default)]
    pub filter_ids: Vec<String>,

    /// Default TTL of recorded usages in milliseconds
    ///
    /// Negative means "use no expiry"; 0 means "do not record usages".
    #[serde(rename = "UsageTTL", default = "no_usage_ttl")]
    pub usage_ttl_ms: i64,

    /// Capacity; [`UNLIMITED`] disables the check
    #[serde(rename = "Limit")]
    pub limit: Decimal,

    #[serde(rename = "AllocationMessage", default)]
    pub allocation_message: String,

    /// Stop considering lower-weight resources once this one matches
    #[serde(rename = "Blocker", default)]
    pub blocker: bool,

    /// Usage changes must be persisted
    #[serde(rename = "Stored", default)]
    pub stored: bool,

    #[serde(rename = "Weights", default)]
    pub weights: Vec<DynamicWeight>,

    #[serde(rename = "ThresholdIDs", default)]
    pub threshold_ids: Vec<String>,
}

fn no_usage_ttl() -> i64 {
    -1
}

impl ResourceProfile {
    pub fn new(tenant: impl Into<String>, id: impl Into<String>, limit: Decimal) -> Self {
        Self {
            tenant: tenant.into(),
            id: id.into(),
            filter_ids: Vec::new(),
            usage_ttl_ms: no_usage_ttl(),
            limit,
            allocation_message: String::new(),
            blocker: false,
            stored: false,
            weights: Vec::new(),
            threshold_ids: Vec::new(),
        }
    }

    /// `tenant:id`
    pub fn tenant_id(&self) -> String {
        format!("{}:{}", self.tenant, self.id)
    }

    /// True when threshold notification was explicitly disabled
    pub fn thresholds_disabled(&self) -> bool {
        self.threshold_ids.len() == 1 && self.threshold_ids[0] == META_NONE
    }
}

/// A resource together with its profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceWithConfig {
    #[serde(rename = "Resource")]
    pub resource: Resource,

    #[serde(rename = "Config")]
    pub config: ResourceProfile,
}
