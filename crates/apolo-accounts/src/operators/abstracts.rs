//! Abstract balance operator
//!
//! An abstract balance is a quota (free minutes, bundled SMS). Consuming it
//! costs whatever its cost increment says, paid for by the concrete balances
//! the orchestrator hands in.

use apolo_core::decimal::{round_to_increment, scale_units};
use apolo_core::models::{AccountCharge, Balance, ChargingEvent, EventCharges};
use apolo_core::AppResult;
use rust_decimal::Decimal;
use tracing::debug;

use super::{check_filters, record_unit_factor};
use crate::chain::{
    cost_increment, effective_factor, max_debit_abstracts_from_concretes, new_charging_id,
    unit_factor, CoveredUsage, Pricing,
};
use crate::operators::ConcreteBalance;
use crate::DebitContext;

/// Operator over a usage quota
#[derive(Debug, Clone, PartialEq)]
pub struct AbstractBalance {
    account_id: String,
    balance: Balance,
}

impl AbstractBalance {
    pub fn new(account_id: impl Into<String>, balance: Balance) -> Self {
        Self {
            account_id: account_id.into(),
            balance,
        }
    }

    pub fn id(&self) -> &str {
        &self.balance.id
    }

    pub fn units(&self) -> Decimal {
        self.balance.units
    }

    pub fn balance(&self) -> &Balance {
        &self.balance
    }

    pub fn into_balance(self) -> Balance {
        self.balance
    }

    /// Consumes up to `usage` from the quota, paying with `concretes`
    ///
    /// `abstracts` of the result holds the usage consumed in the caller's
    /// unit. Concrete charges end up joined under the abstract charge.
    pub async fn debit_abstracts(
        &mut self,
        ctx: &DebitContext<'_>,
        usage: Decimal,
        concretes: &mut [ConcreteBalance],
        event: &ChargingEvent,
    ) -> AppResult<EventCharges> {
        check_filters(ctx, &self.balance, event).await?;

        let ci = cost_increment(ctx, &event.tenant, &self.balance.cost_increments, event).await?;
        let limit = self.balance.balance_limit()?;
        let uf = unit_factor(ctx, &event.tenant, &self.balance.unit_factors, event).await?;
        let factor = effective_factor(uf.as_ref())?;

        let mut usage = match factor {
            Some(f) => scale_units(usage, f)?,
            None => usage,
        };
        if let Some(floor) = limit {
            let available = self.balance.units - floor;
            if available < usage {
                usage = round_to_increment(available.max(Decimal::ZERO), ci.increment_or_one());
            }
        }

        let covered = if usage.is_zero() || ci.is_free() {
            let mut charges = EventCharges::new();
            charges.abstracts = Some(usage);
            let mut rating_id = None;
            if !usage.is_zero() {
                let id = new_charging_id();
                charges.rating.insert(id.clone(), ci.clone());
                rating_id = Some(id);
            }
            CoveredUsage {
                charges,
                rating_id,
                attribute_ids: Vec::new(),
            }
        } else {
            let pricing = Pricing {
                cost_increment: ci,
                attribute_ids: self.balance.attribute_ids.clone(),
                rate_profile_ids: self.balance.rate_profile_ids.clone(),
            };
            max_debit_abstracts_from_concretes(ctx, usage, concretes, event, &pricing).await?
        };

        let paid = covered.covered();
        self.balance.units -= paid;

        let CoveredUsage {
            mut charges,
            rating_id,
            attribute_ids,
        } = covered;
        let joined: Vec<String> = charges
            .charges
            .drain(..)
            .map(|entry| entry.charging_id)
            .collect();

        let mut ec = charges;
        ec.abstracts = Some(match factor {
            Some(f) => paid / f,
            None => paid,
        });
        if paid.is_zero() {
            return Ok(ec);
        }

        let mut charge = AccountCharge::new(&self.account_id, &self.balance.id, paid);
        charge.balance_limit = limit;
        charge.attribute_ids = attribute_ids;
        charge.rating_id = rating_id.unwrap_or_default();
        charge.joined_charge_ids = joined;
        charge.unit_factor_id = record_unit_factor(&mut ec, uf);
        ec.add_charge(new_charging_id(), charge);
        debug!(
            "Consumed {} from abstract balance {} of account {}",
            paid, self.balance.id, self.account_id
        );
        Ok(ec)
    }
}
