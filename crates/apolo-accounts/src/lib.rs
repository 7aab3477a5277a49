//! Balance debiting engine
//!
//! Turns a usage event into debits across the weighted balances of one or
//! more accounts.
//!
//! # Architecture
//!
//! - `operators` - concrete and abstract balance operators
//! - `chain` - pricing helpers and the concrete chain debit with the
//!   bisection search over affordable usage
//! - `debit` - per-account orchestration (weight ordering, dispatch, merge)
//! - `service` - `AccountService`, the entry point used by an API layer
//!
//! Every mutation happens on owned copies of the balances. Risky trials are
//! wrapped in checkpoints so a failed debit leaves no trace.

pub mod chain;
pub mod debit;
pub mod operators;
pub mod service;

pub use debit::{debit_account, BalanceOperator};
pub use operators::{AbstractBalance, ConcreteBalance};
pub use service::AccountService;

use apolo_core::config::AccountsConfig;
use apolo_core::traits::{ConnManager, FilterEvaluator};

/// Engine constants
pub mod constants {
    /// API option: attribute profiles to apply
    pub const OPT_ATTRIBUTES_PROFILE_IDS: &str = "*attributesProfileIDs";

    /// API option: rate profiles to price with
    pub const OPT_RATES_PROFILE_IDS: &str = "*ratesProfileIDs";

    /// API option: usage to price
    pub const OPT_RATES_USAGE: &str = "*ratesUsage";

    /// API option: context of the attribute processing
    pub const OPT_CONTEXT: &str = "*context";

    /// Context value for requests made by the balance engine
    pub const META_ACCOUNTS: &str = "*accounts";
}

/// Collaborators and limits shared by one debit call
#[derive(Clone, Copy)]
pub struct DebitContext<'a> {
    pub filters: &'a dyn FilterEvaluator,
    pub conns: &'a dyn ConnManager,
    pub attributes_conns: &'a [String],
    pub rates_conns: &'a [String],
    pub max_iterations: usize,
}

impl<'a> DebitContext<'a> {
    pub fn new(
        filters: &'a dyn FilterEvaluator,
        conns: &'a dyn ConnManager,
        cfg: &'a AccountsConfig,
    ) -> Self {
        Self {
            filters,
            conns,
            attributes_conns: &cfg.attributes_conns,
            rates_conns: &cfg.rates_conns,
            max_iterations: cfg.max_iterations,
        }
    }
}
