//! Domain models for the charging engine
//!
//! This module contains the core domain models shared by both engines.

pub mod account;
pub mod charges;
pub mod event;
pub mod resource;

pub use account::{
    Account, Balance, BalanceType, BalancesBackup, CostIncrement, UnitFactor,
    OPT_BALANCE_LIMIT, OPT_BALANCE_UNLIMITED,
};
pub use charges::{AccountCharge, ChargeEntry, EventCharges};
pub use event::ChargingEvent;
pub use resource::{Resource, ResourceProfile, ResourceUsage, ResourceWithConfig};
