//! Unified error handling for the charging engine
//!
//! Every failure the engines can produce is a variant of [`AppError`]. Callers
//! match on the variant (or on its [`ErrorKind`]) instead of comparing strings,
//! so an API layer can pass business outcomes through unchanged while wrapping
//! everything else as a server error.

use std::fmt;
use thiserror::Error;

/// Main application error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AppError {
    // ==================== Applicability ====================
    #[error("FILTER_NOT_PASSING")]
    FilterNotPassing,

    // ==================== Business Outcomes ====================
    #[error("INSUFFICIENT_CREDIT")]
    InsufficientCredit,

    #[error("RESOURCE_UNAVAILABLE")]
    ResourceUnavailable,

    #[error("RESOURCE_UNAUTHORIZED")]
    ResourceUnauthorized,

    // ==================== Search Exhaustion ====================
    #[error("MAX_INCREMENTS_EXCEEDED")]
    MaxIncrementsExceeded,

    // ==================== Configuration / Data ====================
    #[error("NOT_FOUND:{0}")]
    NotFound(String),

    #[error("unsupported balance type: {0}")]
    UnsupportedBalanceType(String),

    #[error("unsupported *balanceLimit format: {0}")]
    InvalidBalanceLimit(String),

    #[error("empty configuration for resourceID: {0}")]
    MissingProfile(String),

    #[error("duplicate resource usage with id: {0}")]
    DuplicateUsage(String),

    #[error("cannot find usage record with id: {0}")]
    UsageNotFound(String),

    #[error("MANDATORY_IE_MISSING: [{0}]")]
    MandatoryIeMissing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ==================== Connectivity ====================
    #[error("NOT_CONNECTED: {0}")]
    NotConnected(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    // ==================== Concurrency / Storage ====================
    #[error("lock timeout for keys: {0}")]
    LockTimeout(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // ==================== Aggregates ====================
    #[error("PARTIALLY_EXECUTED")]
    PartiallyExecuted,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of an [`AppError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The entity's own filter rejected the event; skip it
    NotApplicable,
    /// Expected, user-facing outcome of the current state
    Business,
    /// The bisection search ran out of iterations
    Exhaustion,
    /// Broken configuration or data
    Configuration,
    /// A downstream service could not be reached
    Connectivity,
    /// Lock timeout or backing-store failure
    Concurrency,
    /// Some sub-steps failed after the main operation committed
    Partial,
    /// Anything else
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotApplicable => "not_applicable",
            ErrorKind::Business => "business",
            ErrorKind::Exhaustion => "exhaustion",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Connectivity => "connectivity",
            ErrorKind::Concurrency => "concurrency",
            ErrorKind::Partial => "partial",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl AppError {
    /// Returns the classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::FilterNotPassing => ErrorKind::NotApplicable,

            AppError::InsufficientCredit
            | AppError::ResourceUnavailable
            | AppError::ResourceUnauthorized => ErrorKind::Business,

            AppError::MaxIncrementsExceeded => ErrorKind::Exhaustion,

            AppError::NotFound(_)
            | AppError::UnsupportedBalanceType(_)
            | AppError::InvalidBalanceLimit(_)
            | AppError::MissingProfile(_)
            | AppError::DuplicateUsage(_)
            | AppError::UsageNotFound(_)
            | AppError::MandatoryIeMissing(_)
            | AppError::Config(_)
            | AppError::InvalidInput(_) => ErrorKind::Configuration,

            AppError::NotConnected(_) | AppError::Rpc(_) => ErrorKind::Connectivity,

            AppError::LockTimeout(_)
            | AppError::Storage(_)
            | AppError::Cache(_)
            | AppError::Serialization(_) => ErrorKind::Concurrency,

            AppError::PartiallyExecuted => ErrorKind::Partial,

            AppError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns the error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::FilterNotPassing => "filter_not_passing",
            AppError::InsufficientCredit => "insufficient_credit",
            AppError::ResourceUnavailable => "resource_unavailable",
            AppError::ResourceUnauthorized => "resource_unauthorized",
            AppError::MaxIncrementsExceeded => "max_increments_exceeded",
            AppError::NotFound(_) => "not_found",
            AppError::UnsupportedBalanceType(_) => "unsupported_balance_type",
            AppError::InvalidBalanceLimit(_) => "invalid_balance_limit",
            AppError::MissingProfile(_) => "missing_profile",
            AppError::DuplicateUsage(_) => "duplicate_usage",
            AppError::UsageNotFound(_) => "usage_not_found",
            AppError::MandatoryIeMissing(_) => "mandatory_ie_missing",
            AppError::Config(_) => "config_error",
            AppError::InvalidInput(_) => "invalid_input",
            AppError::NotConnected(_) => "not_connected",
            AppError::Rpc(_) => "rpc_error",
            AppError::LockTimeout(_) => "lock_timeout",
            AppError::Storage(_) => "storage_error",
            AppError::Cache(_) => "cache_error",
            AppError::Serialization(_) => "serialization_error",
            AppError::PartiallyExecuted => "partially_executed",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// True for the distinguished "not found" storage outcome
    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound(_))
    }

    /// Business outcomes and skipped entities are not defects
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::NotApplicable | ErrorKind::Business | ErrorKind::Partial
        )
    }

    /// Shorthand for a not-found error without detail
    pub fn not_found() -> Self {
        AppError::NotFound(String::new())
    }

    /// Builds a MANDATORY_IE_MISSING error out of the missing field names
    pub fn mandatory_ie_missing<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let fields: Vec<String> = fields.into_iter().map(|f| f.as_ref().to_string()).collect();
        AppError::MandatoryIeMissing(fields.join(" "))
    }
}

// ==================== From implementations ====================

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}
