//! Account and balance models
//!
//! An account owns balances keyed by balance ID. Balances are either abstract
//! (usage quotas such as free minutes) or concrete (real debitable stock).
//! Debit ordering is decided per request from the dynamic weights and is
//! never persisted.

use crate::checkpoint::Snapshot;
use crate::decimal::decimal_from_value;
use crate::error::AppError;
use crate::weights::DynamicWeight;
use crate::AppResult;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Balance option: numeric floor below which the stock is not debited
pub const OPT_BALANCE_LIMIT: &str = "*balanceLimit";

/// Balance option: no floor at all
pub const OPT_BALANCE_UNLIMITED: &str = "*balanceUnlimited";

/// Balance kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalanceType {
    /// Usage quota paid for by concrete balances
    #[serde(rename = "*abstract")]
    Abstract,
    /// Real stock
    #[serde(rename = "*concrete")]
    Concrete,
}

impl fmt::Display for BalanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalanceType::Abstract => write!(f, "*abstract"),
            BalanceType::Concrete => write!(f, "*concrete"),
        }
    }
}

impl BalanceType {
    /// Parse from the wire name
    pub fn parse(s: &str) -> AppResult<Self> {
        match s {
            "*abstract" => Ok(BalanceType::Abstract),
            "*concrete" => Ok(BalanceType::Concrete),
            other => Err(AppError::UnsupportedBalanceType(other.to_string())),
        }
    }
}

/// Pricing rule applied while debiting usage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostIncrement {
    #[serde(rename = "FilterIDs", default)]
    pub filter_ids: Vec<String>,

    #[serde(rename = "Increment", skip_serializing_if = "Option::is_none")]
    pub increment: Option<Decimal>,

    #[serde(rename = "FixedFee", skip_serializing_if = "Option::is_none")]
    pub fixed_fee: Option<Decimal>,

    #[serde(rename = "RecurrentFee", skip_serializing_if = "Option::is_none")]
    pub recurrent_fee: Option<Decimal>,
}

impl CostIncrement {
    /// Increment used when no configured one matches: size 1, price unknown
    pub fn default_increment() -> Self {
        Self {
            filter_ids: Vec::new(),
            increment: Some(Decimal::ONE),
            fixed_fee: None,
            recurrent_fee: Some(crate::decimal::UNKNOWN_FEE),
        }
    }

    /// Increment size, 1 when unset
    pub fn increment_or_one(&self) -> Decimal {
        self.increment.unwrap_or(Decimal::ONE)
    }

    /// Recurrent fee, 0 when unset
    pub fn recurrent_fee_or_zero(&self) -> Decimal {
        self.recurrent_fee.unwrap_or(Decimal::ZERO)
    }

    /// True when the price must be asked from the rating service
    pub fn price_unknown(&self) -> bool {
        self.recurrent_fee == Some(crate::decimal::UNKNOWN_FEE)
    }

    /// True when usage under this increment costs nothing
    pub fn is_free(&self) -> bool {
        self.recurrent_fee_or_zero().is_zero() && self.fixed_fee.map_or(true, |f| f.is_zero())
    }
}

/// Multiplier converting the caller's unit into the balance unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitFactor {
    #[serde(rename = "FilterIDs", default)]
    pub filter_ids: Vec<String>,

    #[serde(rename = "Factor")]
    pub factor: Decimal,
}

/// One balance inside an account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "FilterIDs", default)]
    pub filter_ids: Vec<String>,

    #[serde(rename = "Weights", default)]
    pub weights: Vec<DynamicWeight>,

    #[serde(rename = "Type")]
    pub balance_type: BalanceType,

    #[serde(rename = "Units")]
    pub units: Decimal,

    #[serde(rename = "UnitFactors", default)]
    pub unit_factors: Vec<UnitFactor>,

    #[serde(rename = "Opts", default)]
    pub opts: HashMap<String, Value>,

    #[serde(rename = "CostIncrements", default)]
    pub cost_increments: Vec<CostIncrement>,

    #[serde(rename = "AttributeIDs", default)]
    pub attribute_ids: Vec<String>,

    #[serde(rename = "RateProfileIDs", default)]
    pub rate_profile_ids: Vec<String>,
}

impl Balance {
    /// Minimal balance of the given kind
    pub fn new(id: impl Into<String>, balance_type: BalanceType, units: Decimal) -> Self {
        Self {
            id: id.into(),
            filter_ids: Vec::new(),
            weights: Vec::new(),
            balance_type,
            units,
            unit_factors: Vec::new(),
            opts: HashMap::new(),
            cost_increments: Vec::new(),
            attribute_ids: Vec::new(),
            rate_profile_ids: Vec::new(),
        }
    }

    /// Resolves the floor of this balance
    ///
    /// `None` means unlimited. Without options the floor is 0.
    pub fn balance_limit(&self) -> AppResult<Option<Decimal>> {
        if let Some(v) = self.opts.get(OPT_BALANCE_UNLIMITED) {
            if matches!(v, Value::Bool(true)) || v.as_str() == Some("true") {
                return Ok(None);
            }
        }
        match self.opts.get(OPT_BALANCE_LIMIT) {
            None => Ok(Some(Decimal::ZERO)),
            Some(v) => decimal_from_value(v)
                .map(Some)
                .ok_or_else(|| AppError::InvalidBalanceLimit(v.to_string())),
        }
    }
}

/// Account profile with its balances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    #[serde(rename = "Tenant")]
    pub tenant: String,

    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "FilterIDs", default)]
    pub filter_ids: Vec<String>,

    #[serde(rename = "Weights", default)]
    pub weights: Vec<DynamicWeight>,

    #[serde(rename = "Opts", default)]
    pub opts: HashMap<String, Value>,

    /// Ordered by balance ID, which breaks weight ties
    #[serde(rename = "Balances", default)]
    pub balances: BTreeMap<String, Balance>,
}

impl Account {
    pub fn new(tenant: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            id: id.into(),
            filter_ids: Vec::new(),
            weights: Vec::new(),
            opts: HashMap::new(),
            balances: BTreeMap::new(),
        }
    }

    /// `tenant:id`
    pub fn tenant_id(&self) -> String {
        format!("{}:{}", self.tenant, self.id)
    }

    /// Builder-style balance insert
    pub fn with_balance(mut self, balance: Balance) -> Self {
        self.balances.insert(balance.id.clone(), balance);
        self
    }

    /// True when any balance differs from the backup
    pub fn balances_altered(&self, backup: &BalancesBackup) -> bool {
        if self.balances.len() != backup.len() {
            return true;
        }
        self.balances
            .iter()
            .any(|(id, b)| backup.get(id) != Some(&b.units))
    }
}

/// Units of every balance of an account, by balance ID
pub type BalancesBackup = HashMap<String, Decimal>;

impl Snapshot for Account {
    type State = BalancesBackup;

    fn capture(&self) -> BalancesBackup {
        self.balances
            .iter()
            .map(|(id, b)| (id.clone(), b.units))
            .collect()
    }

    fn restore(&mut self, state: BalancesBackup) {
        for (id, units) in state {
            if let Some(b) = self.balances.get_mut(&id) {
                b.units = units;
            }
        }
    }
}
