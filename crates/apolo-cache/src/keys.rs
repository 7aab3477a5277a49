//! Cache and lock key builders for the charging engine
//!
//! Provides standardized key naming patterns for cached entities and named
//! locks, ensuring consistency across both engines and preventing key
//! collisions.
//!
//! # Key Patterns
//!
//! - `resource:{tenant}:{id}` - Live resource state
//! - `event_resources:{event_id}` - Resource IDs matched for one event
//! - `lock:account:{tenant}:{id}` - Account lock
//! - `lock:resource:{tenant}:{id}` - Resource lock
//! - `lock:resource_profile:{tenant}:{id}` - Resource profile lock
//!
//! # Example
//!
//! ```
//! use apolo_cache::keys;
//!
//! let key = keys::resource_key("apolo.net", "RES1");
//! assert_eq!(key, "resource:apolo.net:RES1");
//!
//! let key = keys::event_resources_key("EV1");
//! assert_eq!(key, "event_resources:EV1");
//! ```

/// Prefix for live resource state
///
/// Format: `resource:{tenant}:{id}`
pub const RESOURCE_PREFIX: &str = "resource";

/// Prefix for the per-event matched resource IDs
///
/// Format: `event_resources:{event_id}`
pub const EVENT_RESOURCES_PREFIX: &str = "event_resources";

/// Prefix for every named lock
pub const LOCK_PREFIX: &str = "lock";

/// TTL for live resource state (never expires)
pub const RESOURCE_TTL_SECS: u64 = 0;

/// Build a cache key for a resource
///
/// # Example
///
/// ```
/// use apolo_cache::keys::resource_key;
///
/// assert_eq!(resource_key("apolo.net", "RES1"), "resource:apolo.net:RES1");
/// ```
pub fn resource_key(tenant: &str, id: &str) -> String {
    format!("{}:{}:{}", RESOURCE_PREFIX, tenant, id)
}

/// Build a cache key for the resources matched by an event
pub fn event_resources_key(event_id: &str) -> String {
    format!("{}:{}", EVENT_RESOURCES_PREFIX, event_id)
}

/// Lock key guarding one account
///
/// # Example
///
/// ```
/// use apolo_cache::keys::account_lock_key;
///
/// assert_eq!(account_lock_key("apolo.net", "1001"), "lock:account:apolo.net:1001");
/// ```
pub fn account_lock_key(tenant: &str, id: &str) -> String {
    format!("{}:account:{}:{}", LOCK_PREFIX, tenant, id)
}

/// Lock key guarding one resource's live state
pub fn resource_lock_key(tenant: &str, id: &str) -> String {
    format!("{}:resource:{}:{}", LOCK_PREFIX, tenant, id)
}

/// Lock key guarding one resource profile
pub fn resource_profile_lock_key(tenant: &str, id: &str) -> String {
    format!("{}:resource_profile:{}:{}", LOCK_PREFIX, tenant, id)
}
