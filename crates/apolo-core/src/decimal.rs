//! Decimal arithmetic helpers
//!
//! Money and usage math is done in [`Decimal`] end to end. Durations travel as
//! nanoseconds so a usage of one minute is `60_000_000_000`.

use crate::error::AppError;
use crate::AppResult;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::Value;

/// Recurrent fee meaning "ask the rating service for the price"
pub const UNKNOWN_FEE: Decimal = Decimal::NEGATIVE_ONE;

/// Nanoseconds in one second
pub const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Rounds `value` down (toward zero) to a multiple of `increment`
///
/// A zero or missing increment leaves the value untouched.
pub fn round_to_increment(value: Decimal, increment: Decimal) -> Decimal {
    if increment.is_zero() {
        return value;
    }
    let steps = (value / increment).round_dp_with_strategy(0, RoundingStrategy::ToZero);
    steps * increment
}

/// Cost of `usage` under one cost increment
///
/// `cost = fixed_fee + (usage / increment) * recurrent_fee`
pub fn cost_for_usage(
    usage: Decimal,
    increment: Decimal,
    fixed_fee: Option<Decimal>,
    recurrent_fee: Decimal,
) -> AppResult<Decimal> {
    if increment.is_zero() {
        return Err(AppError::InvalidInput("zero cost increment".to_string()));
    }
    let mut cost = usage
        .checked_div(increment)
        .and_then(|steps| steps.checked_mul(recurrent_fee))
        .ok_or_else(|| AppError::InvalidInput(format!("cost overflow for usage {}", usage)))?;
    if let Some(fee) = fixed_fee {
        cost = cost
            .checked_add(fee)
            .ok_or_else(|| AppError::InvalidInput(format!("cost overflow for usage {}", usage)))?;
    }
    Ok(cost)
}

/// `units` converted by a unit factor
pub fn scale_units(units: Decimal, factor: Decimal) -> AppResult<Decimal> {
    units.checked_mul(factor).ok_or_else(|| {
        AppError::InvalidInput(format!("units {} overflow with factor {}", units, factor))
    })
}

/// Midpoint of two decimals
pub fn midpoint(a: Decimal, b: Decimal) -> Decimal {
    a + (b - a) / Decimal::TWO
}

/// Parses a JSON value (number or numeric string) as a decimal
pub fn decimal_from_value(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Decimal::from(i))
            } else if let Some(u) = n.as_u64() {
                Some(Decimal::from(u))
            } else {
                n.as_f64().and_then(Decimal::from_f64_retain)
            }
        }
        Value::String(s) => s.trim().parse::<Decimal>().ok(),
        _ => None,
    }
}

/// Converts seconds into the nanosecond usage unit
pub fn seconds(secs: i64) -> Decimal {
    Decimal::from(secs) * Decimal::from(NANOS_PER_SECOND)
}

/// Best-effort conversion of a decimal into f64 for reporting
pub fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or_default()
}
