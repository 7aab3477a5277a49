//! Wire types for the JSON-RPC API
//!
//! Request envelopes plus the replies the engines read back from the
//! attribute, rating, and threshold services.

use apolo_core::models::ChargingEvent;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ============================================================================
// JSON-RPC 2.0 Types
// ============================================================================

/// Request JSON-RPC 2.0
#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<T> {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<T>,
    pub id: u64,
}

/// Response JSON-RPC 2.0
#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse<T> {
    #[serde(default)]
    pub jsonrpc: String,
    pub result: Option<T>,
    pub error: Option<JsonRpcError>,
    #[serde(default)]
    pub id: u64,
}

/// Error JSON-RPC 2.0
///
/// Some servers answer with a bare string instead of an object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcError {
    Object { code: i32, message: String },
    Message(String),
}

impl JsonRpcError {
    pub fn message(&self) -> &str {
        match self {
            JsonRpcError::Object { message, .. } => message,
            JsonRpcError::Message(message) => message,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            JsonRpcError::Object { code, .. } => *code,
            JsonRpcError::Message(_) => 0,
        }
    }
}

// ============================================================================
// AttributeS Types
// ============================================================================

/// One attribute profile applied to an event
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldsAltered {
    #[serde(rename = "MatchedProfileID", default)]
    pub matched_profile_id: String,

    #[serde(rename = "Fields", default)]
    pub fields: Vec<String>,
}

/// Reply of AttributeSv1.ProcessEvent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttrProcessEventReply {
    #[serde(rename = "AlteredFields", default)]
    pub altered_fields: Vec<FieldsAltered>,

    #[serde(flatten)]
    pub event: ChargingEvent,
}

impl AttrProcessEventReply {
    /// IDs of the attribute profiles that changed the event
    pub fn matched_profile_ids(&self) -> Vec<String> {
        self.altered_fields
            .iter()
            .map(|f| f.matched_profile_id.clone())
            .collect()
    }
}

// ============================================================================
// RateS Types
// ============================================================================

/// Reply of RateSv1.CostForEvent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateProfileCost {
    #[serde(rename = "ID", default)]
    pub id: String,

    #[serde(rename = "Cost")]
    pub cost: Decimal,
}
