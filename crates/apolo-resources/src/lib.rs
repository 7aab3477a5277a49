//! Resource admission engine
//!
//! Tracks finite shared capacities (concurrent calls, channels, licenses)
//! through usage records and decides whether a new usage fits.
//!
//! # Architecture
//!
//! - `resource` - one locked resource with its profile, TTL, and cached total
//! - `resources` - the weight-ordered set matched for an event
//! - `service` - `ResourceService`: matching, persistence, threshold
//!   notification, and the backup loop
//!
//! Matched resources hold their profile and resource locks until they are
//! dropped, so every exit path of a request releases what it acquired.

pub mod resource;
pub mod resources;
pub mod service;

pub use resource::{LockHandle, TrackedProfile, TrackedResource};
pub use resources::Resources;
pub use service::{ResourceService, UsageArgs};

/// Engine constants
pub mod constants {
    /// API option: ID of the usage to authorize, allocate, or release
    pub const OPT_USAGE_ID: &str = "*usageID";

    /// API option: TTL of the usage in milliseconds
    pub const OPT_USAGE_TTL: &str = "*usageTTL";

    /// API option: units requested (1 when absent)
    pub const OPT_UNITS: &str = "*units";

    /// API option: event type for threshold processing
    pub const OPT_EVENT_TYPE: &str = "*eventType";

    /// API option: threshold profiles to evaluate
    pub const OPT_THRESHOLD_IDS: &str = "*thresholdsProfileIDs";

    pub const RESOURCE_UPDATE: &str = "ResourceUpdate";

    pub const EVENT_TYPE_FIELD: &str = "EventType";
    pub const RESOURCE_ID_FIELD: &str = "ResourceID";

    /// Reply of a successful release
    pub const REPLY_OK: &str = "OK";
}
