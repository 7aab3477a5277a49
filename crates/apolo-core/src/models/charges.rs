//! Event charges
//!
//! Consolidated result of a debit: totals, an ordered (compressed) list of
//! charge references, and the accounting records they point to.

use crate::models::account::{CostIncrement, UnitFactor};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Reference towards one accounting record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeEntry {
    #[serde(rename = "ChargingID")]
    pub charging_id: String,

    #[serde(rename = "CompressFactor")]
    pub compress_factor: u32,
}

/// Units taken out of one balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountCharge {
    #[serde(rename = "AccountID")]
    pub account_id: String,

    #[serde(rename = "BalanceID")]
    pub balance_id: String,

    #[serde(rename = "Units")]
    pub units: Decimal,

    #[serde(rename = "BalanceLimit", skip_serializing_if = "Option::is_none")]
    pub balance_limit: Option<Decimal>,

    #[serde(rename = "UnitFactorID", default, skip_serializing_if = "String::is_empty")]
    pub unit_factor_id: String,

    #[serde(rename = "AttributeIDs", default, skip_serializing_if = "Vec::is_empty")]
    pub attribute_ids: Vec<String>,

    #[serde(rename = "RatingID", default, skip_serializing_if = "String::is_empty")]
    pub rating_id: String,

    #[serde(rename = "JoinedChargeIDs", default, skip_serializing_if = "Vec::is_empty")]
    pub joined_charge_ids: Vec<String>,
}

impl AccountCharge {
    pub fn new(account_id: &str, balance_id: &str, units: Decimal) -> Self {
        Self {
            account_id: account_id.to_string(),
            balance_id: balance_id.to_string(),
            units,
            balance_limit: None,
            unit_factor_id: String::new(),
            attribute_ids: Vec::new(),
            rating_id: String::new(),
            joined_charge_ids: Vec::new(),
        }
    }
}

/// Charges applied to an event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventCharges {
    /// Total abstract units charged
    #[serde(rename = "Abstracts", skip_serializing_if = "Option::is_none")]
    pub abstracts: Option<Decimal>,

    /// Total concrete units charged
    #[serde(rename = "Concretes", skip_serializing_if = "Option::is_none")]
    pub concretes: Option<Decimal>,

    #[serde(rename = "Charges", default)]
    pub charges: Vec<ChargeEntry>,

    #[serde(rename = "Accounting", default)]
    pub accounting: HashMap<String, AccountCharge>,

    #[serde(rename = "UnitFactors", default)]
    pub unit_factors: HashMap<String, UnitFactor>,

    #[serde(rename = "Rating", default)]
    pub rating: HashMap<String, CostIncrement>,
}

impl EventCharges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abstract total, zero when nothing was charged
    pub fn abstracts_or_zero(&self) -> Decimal {
        self.abstracts.unwrap_or(Decimal::ZERO)
    }

    /// Concrete total, zero when nothing was charged
    pub fn concretes_or_zero(&self) -> Decimal {
        self.concretes.unwrap_or(Decimal::ZERO)
    }

    /// Records one accounting entry and references it from the charges list
    pub fn add_charge(&mut self, charging_id: String, charge: AccountCharge) {
        self.accounting.insert(charging_id.clone(), charge);
        self.append_charge_entries(vec![ChargeEntry {
            charging_id,
            compress_factor: 1,
        }]);
    }

    /// Merges other charges into these ones
    pub fn merge(&mut self, other: EventCharges) {
        self.abstracts = sum_optional(self.abstracts, other.abstracts);
        self.concretes = sum_optional(self.concretes, other.concretes);
        self.append_charge_entries(other.charges);
        self.accounting.extend(other.accounting);
        self.unit_factors.extend(other.unit_factors);
        self.rating.extend(other.rating);
    }

    /// Appends charge entries, compressing into the last one when IDs match
    fn append_charge_entries(&mut self, entries: Vec<ChargeEntry>) {
        for entry in entries {
            match self.charges.last_mut() {
                Some(last) if last.charging_id == entry.charging_id => {
                    last.compress_factor += entry.compress_factor;
                }
                _ => self.charges.push(entry),
            }
        }
    }

    /// Units charged per balance, expanded through the compress factors
    ///
    /// Output is keyed by `(account_id, balance_id)`.
    pub fn units_per_balance(&self) -> HashMap<(String, String), Decimal> {
        let mut out: HashMap<(String, String), Decimal> = HashMap::new();
        for entry in &self.charges {
            let Some(acc) = self.accounting.get(&entry.charging_id) else {
                continue;
            };
            let total = acc.units * Decimal::from(entry.compress_factor);
            *out.entry((acc.account_id.clone(), acc.balance_id.clone()))
                .or_default() += total;
            for joined in &acc.joined_charge_ids {
                if let Some(j) = self.accounting.get(joined) {
                    *out.entry((j.account_id.clone(), j.balance_id.clone()))
                        .or_default() += j.units * Decimal::from(entry.compress_factor);
                }
            }
        }
        out
    }
}

fn sum_optional(a: Option<Decimal>, b: Option<Decimal>) -> Option<Decimal> {
    match (a, b) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or_default() + b.unwrap_or_default()),
    }
}
