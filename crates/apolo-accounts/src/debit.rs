//! Per-account debit orchestration
//!
//! Balances are resolved into operators once, ordered by their dynamic
//! weight, and then debited in that order until the usage is covered.

use apolo_core::models::{Account, Balance, BalanceType, ChargingEvent, EventCharges};
use apolo_core::weights::weight_from_dynamics;
use apolo_core::{AppError, AppResult};
use rust_decimal::Decimal;
use std::cmp::Ordering;
use tracing::{debug, instrument};

use crate::operators::{AbstractBalance, ConcreteBalance};
use crate::DebitContext;

/// A balance resolved into the operator matching its kind
#[derive(Debug, Clone, PartialEq)]
pub enum BalanceOperator {
    Abstract(AbstractBalance),
    Concrete(ConcreteBalance),
}

impl BalanceOperator {
    pub fn from_balance(account_id: &str, balance: Balance) -> Self {
        match balance.balance_type {
            BalanceType::Abstract => BalanceOperator::Abstract(AbstractBalance::new(account_id, balance)),
            BalanceType::Concrete => BalanceOperator::Concrete(ConcreteBalance::new(account_id, balance)),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            BalanceOperator::Abstract(op) => op.id(),
            BalanceOperator::Concrete(op) => op.id(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Abstract(usize),
    Concrete(usize),
}

/// Operators of one account in debit order
#[derive(Debug)]
struct AccountOperators {
    abstracts: Vec<AbstractBalance>,
    /// Weight ordered; abstract balances pay with them in this order
    concretes: Vec<ConcreteBalance>,
    order: Vec<Slot>,
}

impl AccountOperators {
    async fn load(
        ctx: &DebitContext<'_>,
        account: &Account,
        event: &ChargingEvent,
    ) -> AppResult<Self> {
        let mut weighted = Vec::with_capacity(account.balances.len());
        for balance in account.balances.values() {
            let weight =
                weight_from_dynamics(&balance.weights, ctx.filters, &account.tenant, event).await?;
            weighted.push((weight, balance));
        }
        // stable: equal weights keep balance ID order
        weighted.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        let mut ops = Self {
            abstracts: Vec::new(),
            concretes: Vec::new(),
            order: Vec::with_capacity(weighted.len()),
        };
        for (_, balance) in weighted {
            match BalanceOperator::from_balance(&account.id, balance.clone()) {
                BalanceOperator::Abstract(op) => {
                    ops.order.push(Slot::Abstract(ops.abstracts.len()));
                    ops.abstracts.push(op);
                }
                BalanceOperator::Concrete(op) => {
                    ops.order.push(Slot::Concrete(ops.concretes.len()));
                    ops.concretes.push(op);
                }
            }
        }
        Ok(ops)
    }

    async fn debit(
        &mut self,
        ctx: &DebitContext<'_>,
        usage: Decimal,
        event: &ChargingEvent,
        concretes_only: bool,
    ) -> AppResult<EventCharges> {
        let mut ec = EventCharges::new();
        let mut remaining = usage;
        for idx in 0..self.order.len() {
            if remaining <= Decimal::ZERO {
                break;
            }
            let result = match self.order[idx] {
                Slot::Abstract(_) if concretes_only => continue,
                Slot::Abstract(i) => {
                    self.abstracts[i]
                        .debit_abstracts(ctx, remaining, &mut self.concretes, event)
                        .await
                }
                Slot::Concrete(i) if concretes_only => {
                    self.concretes[i].debit_concretes(ctx, remaining, event).await
                }
                Slot::Concrete(i) => self.concretes[i].debit_abstracts(ctx, remaining, event).await,
            };
            let charged = match result {
                Ok(charged) => charged,
                Err(AppError::FilterNotPassing) => continue,
                Err(e) => return Err(e),
            };
            let used = if concretes_only {
                charged.concretes_or_zero()
            } else {
                charged.abstracts_or_zero()
            };
            remaining -= used;
            ec.merge(charged);
        }
        Ok(ec)
    }

    fn write_back(self, account: &mut Account) {
        let balances = self
            .abstracts
            .into_iter()
            .map(AbstractBalance::into_balance)
            .chain(self.concretes.into_iter().map(ConcreteBalance::into_balance));
        for balance in balances {
            if let Some(b) = account.balances.get_mut(&balance.id) {
                b.units = balance.units;
            }
        }
    }
}

/// Debits `usage` out of the account balances
///
/// With `concretes_only` the usage is a cost taken straight from the
/// concrete balances; otherwise it is usage priced through the abstract
/// layer. The account is only changed when the whole call succeeds. Usage
/// left uncovered is not an error: the returned charges tell how much was
/// taken.
#[instrument(skip(ctx, account, event), fields(account = %account.id))]
pub async fn debit_account(
    ctx: &DebitContext<'_>,
    account: &mut Account,
    usage: Decimal,
    event: &ChargingEvent,
    concretes_only: bool,
) -> AppResult<EventCharges> {
    let mut ops = AccountOperators::load(ctx, account, event).await?;
    let ec = ops.debit(ctx, usage, event, concretes_only).await?;
    ops.write_back(account);
    debug!(
        "Account {} charged abstracts={:?} concretes={:?}",
        account.id, ec.abstracts, ec.concretes
    );
    Ok(ec)
}
