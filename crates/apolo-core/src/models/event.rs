//! Charging event model
//!
//! An event is a tenant-scoped bag of key/value fields plus API options. Both
//! engines read from it through [`ChargingEvent::field`] and
//! [`ChargingEvent::opt`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Event field holding the usage
pub const USAGE_FIELD: &str = "Usage";

/// API option overriding the usage
pub const OPT_USAGE: &str = "*usage";

/// API option restricting the matched account IDs
pub const OPT_ACCOUNT_IDS: &str = "*accountsProfileIDs";

/// Event passed to the charging engines
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChargingEvent {
    #[serde(rename = "Tenant")]
    pub tenant: String,

    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "Time", skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,

    #[serde(rename = "Event", default)]
    pub event: HashMap<String, Value>,

    #[serde(rename = "APIOpts", default)]
    pub api_opts: HashMap<String, Value>,
}

impl ChargingEvent {
    /// Create a new event with no fields
    pub fn new(tenant: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            id: id.into(),
            ..Default::default()
        }
    }

    /// Builder-style field setter
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.event.insert(key.into(), value.into());
        self
    }

    /// Builder-style option setter
    pub fn with_opt(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.api_opts.insert(key.into(), value.into());
        self
    }

    /// `tenant:id`
    pub fn tenant_id(&self) -> String {
        format!("{}:{}", self.tenant, self.id)
    }

    /// Event field lookup
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.event.get(key)
    }

    /// API option lookup
    pub fn opt(&self, key: &str) -> Option<&Value> {
        self.api_opts.get(key)
    }

    /// Event field rendered as a string (numbers and booleans included)
    pub fn field_as_string(&self, key: &str) -> Option<String> {
        self.field(key).and_then(value_as_string)
    }

    /// API option read as a list of strings
    pub fn opt_as_strings(&self, key: &str) -> Option<Vec<String>> {
        match self.opt(key)? {
            Value::Array(items) => Some(items.iter().filter_map(value_as_string).collect()),
            other => value_as_string(other).map(|s| vec![s]),
        }
    }
}

/// Renders scalar JSON values as strings
pub fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
