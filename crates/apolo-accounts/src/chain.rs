//! Pricing helpers and concrete chain debit
//!
//! The bisection search in [`max_debit_abstracts_from_concretes`] finds the
//! largest increment-aligned usage the concrete balances can pay for. The true
//! boundary is only discovered by attempting real debits, so every trial is
//! rolled back to a checkpoint before the next one starts.

use apolo_core::decimal::{cost_for_usage, midpoint, round_to_increment};
use apolo_core::models::{ChargingEvent, CostIncrement, EventCharges, UnitFactor};
use apolo_core::traits::methods;
use apolo_core::{AppError, AppResult, Checkpoint};
use apolo_rpc::{AttrProcessEventReply, RateProfileCost};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::constants::{
    META_ACCOUNTS, OPT_ATTRIBUTES_PROFILE_IDS, OPT_CONTEXT, OPT_RATES_PROFILE_IDS,
    OPT_RATES_USAGE,
};
use crate::operators::ConcreteBalance;
use crate::DebitContext;

/// How the balance paying for usage prices it
#[derive(Debug, Clone, Default)]
pub struct Pricing {
    pub cost_increment: CostIncrement,
    pub attribute_ids: Vec<String>,
    pub rate_profile_ids: Vec<String>,
}

/// Outcome of [`max_debit_abstracts_from_concretes`]
#[derive(Debug, Clone, Default)]
pub struct CoveredUsage {
    /// Concrete charges; `abstracts` holds the covered usage
    pub charges: EventCharges,
    /// Entry in `charges.rating` describing the applied price
    pub rating_id: Option<String>,
    /// Attribute profiles that altered the priced event
    pub attribute_ids: Vec<String>,
}

impl CoveredUsage {
    pub fn covered(&self) -> Decimal {
        self.charges.abstracts_or_zero()
    }
}

pub(crate) fn new_charging_id() -> String {
    Uuid::new_v4().to_string()
}

/// First cost increment whose filters pass, else the default increment
pub async fn cost_increment(
    ctx: &DebitContext<'_>,
    tenant: &str,
    increments: &[CostIncrement],
    event: &ChargingEvent,
) -> AppResult<CostIncrement> {
    for ci in increments {
        if ctx.filters.pass(tenant, &ci.filter_ids, event).await? {
            return Ok(ci.clone());
        }
    }
    Ok(CostIncrement::default_increment())
}

/// First unit factor whose filters pass
pub async fn unit_factor(
    ctx: &DebitContext<'_>,
    tenant: &str,
    factors: &[UnitFactor],
    event: &ChargingEvent,
) -> AppResult<Option<UnitFactor>> {
    for uf in factors {
        if ctx.filters.pass(tenant, &uf.filter_ids, event).await? {
            return Ok(Some(uf.clone()));
        }
    }
    Ok(None)
}

/// Multiplier to apply, `None` when the factor is absent or 1
pub(crate) fn effective_factor(uf: Option<&UnitFactor>) -> AppResult<Option<Decimal>> {
    match uf.map(|u| u.factor) {
        None => Ok(None),
        Some(f) if f == Decimal::ONE => Ok(None),
        Some(f) if f.is_zero() => Err(AppError::Config("zero unit factor".to_string())),
        Some(f) => Ok(Some(f)),
    }
}

/// Runs the event through the attribute service
///
/// Returns the altered event and the matched profile IDs, or the original
/// event when nothing changed.
pub async fn process_attributes(
    ctx: &DebitContext<'_>,
    event: &ChargingEvent,
    attribute_ids: &[String],
) -> AppResult<(ChargingEvent, Vec<String>)> {
    let mut args = event.clone();
    args.api_opts
        .insert(OPT_ATTRIBUTES_PROFILE_IDS.to_string(), json!(attribute_ids));
    args.api_opts
        .entry(OPT_CONTEXT.to_string())
        .or_insert_with(|| json!(META_ACCOUNTS));

    let reply = ctx
        .conns
        .call(
            ctx.attributes_conns,
            methods::ATTRIBUTES_PROCESS_EVENT,
            serde_json::to_value(&args)?,
        )
        .await?;
    let reply: AttrProcessEventReply = serde_json::from_value(reply)?;
    if reply.altered_fields.is_empty() {
        return Ok((event.clone(), Vec::new()));
    }
    let matched = reply.matched_profile_ids();
    debug!("Event {} altered by attributes {:?}", event.id, matched);
    Ok((reply.event, matched))
}

/// Asks the rating service what `usage` costs
pub async fn rate_usage(
    ctx: &DebitContext<'_>,
    event: &ChargingEvent,
    rate_profile_ids: &[String],
    usage: Decimal,
) -> AppResult<RateProfileCost> {
    let mut args = event.clone();
    args.api_opts
        .insert(OPT_RATES_PROFILE_IDS.to_string(), json!(rate_profile_ids));
    args.api_opts
        .insert(OPT_RATES_USAGE.to_string(), json!(usage.to_string()));

    let reply = ctx
        .conns
        .call(
            ctx.rates_conns,
            methods::RATES_COST_FOR_EVENT,
            serde_json::to_value(&args)?,
        )
        .await?;
    Ok(serde_json::from_value(reply)?)
}

/// Debits `cost` across the concretes in order
///
/// Balances whose filters do not pass are skipped. When the whole cost cannot
/// be covered every balance is put back and `InsufficientCredit` returned.
pub async fn debit_concrete_units(
    ctx: &DebitContext<'_>,
    cost: Decimal,
    concretes: &mut [ConcreteBalance],
    event: &ChargingEvent,
) -> AppResult<EventCharges> {
    let mut charges = EventCharges::new();
    if cost <= Decimal::ZERO {
        return Ok(charges);
    }
    let checkpoint = Checkpoint::capture(&*concretes);
    let mut remaining = cost;
    for idx in 0..concretes.len() {
        match concretes[idx].debit_concretes(ctx, remaining, event).await {
            Ok(ec) => {
                remaining -= ec.concretes_or_zero();
                charges.merge(ec);
                if remaining <= Decimal::ZERO {
                    checkpoint.commit();
                    return Ok(charges);
                }
            }
            Err(AppError::FilterNotPassing) => continue,
            Err(e) => {
                checkpoint.rollback(concretes);
                return Err(e);
            }
        }
    }
    checkpoint.rollback(concretes);
    Err(AppError::InsufficientCredit)
}

struct Trial {
    usage: Decimal,
    cost: Decimal,
    snapshot: Checkpoint<Vec<Decimal>>,
    charges: EventCharges,
}

/// Debits as much of `usage` as the concretes can pay for
///
/// Never fails with `InsufficientCredit`: when nothing is affordable the
/// covered usage is zero. The concretes end in the state of the best
/// successful trial.
pub async fn max_debit_abstracts_from_concretes(
    ctx: &DebitContext<'_>,
    usage: Decimal,
    concretes: &mut [ConcreteBalance],
    event: &ChargingEvent,
    pricing: &Pricing,
) -> AppResult<CoveredUsage> {
    let ci = &pricing.cost_increment;
    let increment = ci.increment_or_one();
    let calculate_cost = ci.price_unknown() && ci.fixed_fee.is_none();
    let recurrent_fee = if ci.price_unknown() {
        Decimal::ZERO
    } else {
        ci.recurrent_fee_or_zero()
    };

    let mut attribute_ids = Vec::new();
    let processed;
    let event = if calculate_cost && !pricing.attribute_ids.is_empty() {
        let (ev, ids) = process_attributes(ctx, event, &pricing.attribute_ids).await?;
        attribute_ids = ids;
        processed = ev;
        &processed
    } else {
        event
    };

    let original = Checkpoint::capture(&*concretes);
    let mut best: Option<Trial> = None;
    let mut denied: Option<Decimal> = None;
    let mut tried: Vec<Decimal> = Vec::new();
    let mut candidate = usage;

    for i in 0.. {
        if i >= ctx.max_iterations {
            original.rollback(concretes);
            warn!(
                "No convergence debiting usage {} after {} iterations",
                usage, ctx.max_iterations
            );
            return Err(AppError::MaxIncrementsExceeded);
        }
        if i != 0 {
            original.restore_to(concretes);
        }
        tried.push(candidate);

        let cost = if calculate_cost {
            rate_usage(ctx, event, &pricing.rate_profile_ids, candidate)
                .await
                .map(|rc| rc.cost)
        } else {
            cost_for_usage(candidate, increment, ci.fixed_fee, recurrent_fee)
        };
        let cost = match cost {
            Ok(cost) => cost,
            Err(e) => {
                original.rollback(concretes);
                return Err(e);
            }
        };

        let attempt = if cost.is_zero() {
            Ok(EventCharges::new())
        } else {
            debit_concrete_units(ctx, cost, concretes, event).await
        };
        let next = match attempt {
            Ok(charges) => {
                debug!("Usage {} covered at cost {}", candidate, cost);
                best = Some(Trial {
                    usage: candidate,
                    cost,
                    snapshot: Checkpoint::capture(&*concretes),
                    charges,
                });
                if i == 0 {
                    break;
                }
                let Some(upper) = denied else { break };
                midpoint(candidate, upper)
            }
            Err(AppError::InsufficientCredit) => {
                debug!("Usage {} denied at cost {}", candidate, cost);
                denied = Some(candidate);
                match &best {
                    Some(t) => midpoint(t.usage, candidate),
                    None => candidate / Decimal::TWO,
                }
            }
            Err(e) => {
                original.rollback(concretes);
                return Err(e);
            }
        };

        let next = round_to_increment(next, increment);
        if next == candidate || next.is_zero() || tried.contains(&next) {
            break;
        }
        candidate = next;
    }

    let Some(trial) = best else {
        original.rollback(concretes);
        let mut charges = EventCharges::new();
        charges.abstracts = Some(Decimal::ZERO);
        return Ok(CoveredUsage {
            charges,
            rating_id: None,
            attribute_ids,
        });
    };
    trial.snapshot.rollback(concretes);
    original.commit();

    let mut charges = trial.charges;
    charges.abstracts = Some(trial.usage);
    let mut rating_id = None;
    if !trial.usage.is_zero() {
        let rating = if calculate_cost {
            CostIncrement {
                filter_ids: Vec::new(),
                increment: Some(increment),
                fixed_fee: Some(Decimal::ZERO),
                recurrent_fee: Some(trial.cost * increment / trial.usage),
            }
        } else {
            ci.clone()
        };
        let id = new_charging_id();
        charges.rating.insert(id.clone(), rating);
        rating_id = Some(id);
    }
    Ok(CoveredUsage {
        charges,
        rating_id,
        attribute_ids,
    })
}
