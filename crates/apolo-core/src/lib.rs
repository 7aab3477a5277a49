//! Apolo charging core library
//!
//! This crate provides the foundational types, traits, and error handling
//! shared by the balance and resource engines. It includes:
//!
//! - Domain models (Account, Balance, Resource, EventCharges, etc.)
//! - Collaborator traits (filters, storage, RPC, cache)
//! - Decimal helpers and the capture/restore checkpoint
//! - Unified error handling and application configuration

pub mod checkpoint;
pub mod config;
pub mod decimal;
pub mod error;
pub mod filters;
pub mod models;
pub mod traits;
pub mod weights;

pub use checkpoint::{Checkpoint, Snapshot};
pub use config::AppConfig;
pub use error::{AppError, ErrorKind};

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
