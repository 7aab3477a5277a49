//! Balance operators
//!
//! An operator owns one balance for the duration of a debit call and mutates
//! its stock in place. The orchestrator writes the stock back to the account
//! once the whole call has succeeded.

mod abstracts;
mod concrete;

pub use abstracts::AbstractBalance;
pub use concrete::ConcreteBalance;

use apolo_core::models::{Balance, ChargingEvent, EventCharges, UnitFactor};
use apolo_core::{AppError, AppResult};

use crate::chain::new_charging_id;
use crate::DebitContext;

/// `FilterNotPassing` unless the balance filters accept the event
pub(crate) async fn check_filters(
    ctx: &DebitContext<'_>,
    balance: &Balance,
    event: &ChargingEvent,
) -> AppResult<()> {
    if ctx
        .filters
        .pass(&event.tenant, &balance.filter_ids, event)
        .await?
    {
        Ok(())
    } else {
        Err(AppError::FilterNotPassing)
    }
}

/// Stores the unit factor under a fresh ID, empty when there is none
pub(crate) fn record_unit_factor(ec: &mut EventCharges, uf: Option<UnitFactor>) -> String {
    match uf {
        Some(uf) => {
            let id = new_charging_id();
            ec.unit_factors.insert(id.clone(), uf);
            id
        }
        None => String::new(),
    }
}
