//! Concrete balance operator

use apolo_core::decimal::scale_units;
use apolo_core::models::{AccountCharge, Balance, ChargingEvent, EventCharges, UnitFactor};
use apolo_core::{AppResult, Snapshot};
use rust_decimal::Decimal;
use tracing::debug;

use super::{check_filters, record_unit_factor};
use crate::chain::{
    cost_increment, effective_factor, max_debit_abstracts_from_concretes, new_charging_id,
    unit_factor, Pricing,
};
use crate::DebitContext;

/// Operator over real stock
#[derive(Debug, Clone, PartialEq)]
pub struct ConcreteBalance {
    account_id: String,
    balance: Balance,
}

impl ConcreteBalance {
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

    pub fn balance_mut(&mut self) -> &mut Balance {
        &mut self.balance
    }

    pub fn into_balance(self) -> Balance {
        self.balance
    }

    /// Takes up to `units` out of the stock, respecting the floor
    ///
    /// Returns the amount taken, expressed in the caller's unit, along with
    /// the unit factor that applied. Rolling back is up to the caller.
    pub async fn debit_units(
        &mut self,
        ctx: &DebitContext<'_>,
        units: Decimal,
        event: &ChargingEvent,
    ) -> AppResult<(Decimal, Option<UnitFactor>)> {
        check_filters(ctx, &self.balance, event).await?;

        let uf = unit_factor(ctx, &event.tenant, &self.balance.unit_factors, event).await?;
        let factor = effective_factor(uf.as_ref())?;
        let mut requested = match factor {
            Some(f) => scale_units(units, f)?,
            None => units,
        };

        if let Some(floor) = self.balance.balance_limit()? {
            let available = self.balance.units - floor;
            if available <= requested {
                requested = available.max(Decimal::ZERO);
            }
        }
        self.balance.units -= requested;

        let debited = match factor {
            Some(f) => requested / f,
            None => requested,
        };
        Ok((debited, uf))
    }

    /// Debits `units` of stock and reports it as concrete charges
    pub async fn debit_concretes(
        &mut self,
        ctx: &DebitContext<'_>,
        units: Decimal,
        event: &ChargingEvent,
    ) -> AppResult<EventCharges> {
        let before = self.balance.units;
        let (debited, uf) = self.debit_units(ctx, units, event).await?;

        let mut ec = EventCharges::new();
        ec.concretes = Some(debited);
        let taken = before - self.balance.units;
        if taken.is_zero() {
            return Ok(ec);
        }

        let mut charge = AccountCharge::new(&self.account_id, &self.balance.id, taken);
        charge.balance_limit = self.balance.balance_limit()?;
        charge.unit_factor_id = record_unit_factor(&mut ec, uf);
        ec.add_charge(new_charging_id(), charge);
        debug!(
            "Debited {} from concrete balance {} of account {}",
            taken, self.balance.id, self.account_id
        );
        Ok(ec)
    }

    /// Pays for usage priced by this balance's own cost increments
    pub async fn debit_abstracts(
        &mut self,
        ctx: &DebitContext<'_>,
        usage: Decimal,
        event: &ChargingEvent,
    ) -> AppResult<EventCharges> {
        check_filters(ctx, &self.balance, event).await?;

        let pricing = Pricing {
            cost_increment: cost_increment(
                ctx,
                &event.tenant,
                &self.balance.cost_increments,
                event,
            )
            .await?,
            attribute_ids: self.balance.attribute_ids.clone(),
            rate_profile_ids: self.balance.rate_profile_ids.clone(),
        };
        let covered = max_debit_abstracts_from_concretes(
            ctx,
            usage,
            std::slice::from_mut(self),
            event,
            &pricing,
        )
        .await?;
        Ok(covered.charges)
    }
}

impl Snapshot for ConcreteBalance {
    type State = Decimal;

    fn capture(&self) -> Decimal {
        self.balance.units
    }

    fn restore(&mut self, state: Decimal) {
        self.balance.units = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockConns;
    use apolo_core::config::AccountsConfig;
    use apolo_core::decimal::seconds;
    use apolo_core::filters::InlineFilterS;
    use apolo_core::models::{BalanceType, CostIncrement, OPT_BALANCE_LIMIT, OPT_BALANCE_UNLIMITED};
    use apolo_core::AppError;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn ev() -> ChargingEvent {
        ChargingEvent::new("apolo.net", "EV_CONCRETE").with_field("Account", "1001")
    }

    fn factored(units: Decimal, limit: Decimal, factor: Decimal) -> ConcreteBalance {
        let mut b = Balance::new("CB1", BalanceType::Concrete, units);
        b.opts.insert(OPT_BALANCE_LIMIT.to_string(), json!(limit.to_string()));
        b.unit_factors.push(UnitFactor {
            filter_ids: Vec::new(),
            factor,
        });
        ConcreteBalance::new("1001", b)
    }

    #[tokio::test]
    async fn test_debit_units_with_factor_and_limit() {
        let fltr = InlineFilterS::new();
        let conns = MockConns::new();
        let cfg = AccountsConfig::default();
        let ctx = DebitContext::new(&fltr, &conns, &cfg);

        let mut cb = factored(dec!(500), dec!(-200), dec!(100));
        let (debited, uf) = cb.debit_units(&ctx, dec!(6), &ev()).await.unwrap();
        assert_eq!(debited, dec!(6));
        assert_eq!(uf.unwrap().factor, dec!(100));
        assert_eq!(cb.units(), dec!(-100));

        // only 100 left above the floor
        let (debited, _) = cb.debit_units(&ctx, dec!(6), &ev()).await.unwrap();
        assert_eq!(debited, dec!(1));
        assert_eq!(cb.units(), dec!(-200));
    }

    #[tokio::test]
    async fn test_debit_units_overflowing_usage() {
        let fltr = InlineFilterS::new();
        let conns = MockConns::new();
        let cfg = AccountsConfig::default();
        let ctx = DebitContext::new(&fltr, &conns, &cfg);

        let mut cb = factored(dec!(500), dec!(-200), dec!(100));
        let huge = Decimal::from_str_exact("1000000000000000000000000000").unwrap();
        assert!(matches!(
            cb.debit_units(&ctx, huge, &ev()).await,
            Err(AppError::InvalidInput(_))
        ));
        assert_eq!(cb.units(), dec!(500));
    }

    #[tokio::test]
    async fn test_debit_units_unlimited() {
        let fltr = InlineFilterS::new();
        let conns = MockConns::new();
        let cfg = AccountsConfig::default();
        let ctx = DebitContext::new(&fltr, &conns, &cfg);

        let mut b = Balance::new("CB1", BalanceType::Concrete, dec!(1));
        b.opts.insert(OPT_BALANCE_UNLIMITED.to_string(), json!(true));
        let mut cb = ConcreteBalance::new("1001", b);
        let (debited, uf) = cb.debit_units(&ctx, dec!(5), &ev()).await.unwrap();
        assert_eq!(debited, dec!(5));
        assert!(uf.is_none());
        assert_eq!(cb.units(), dec!(-4));
    }

    #[tokio::test]
    async fn test_debit_units_errors() {
        let fltr = InlineFilterS::new();
        let conns = MockConns::new();
        let cfg = AccountsConfig::default();
        let ctx = DebitContext::new(&fltr, &conns, &cfg);

        let mut b = Balance::new("CB1", BalanceType::Concrete, dec!(10));
        b.filter_ids = vec!["*string:~*req.Account:1002".to_string()];
        let mut cb = ConcreteBalance::new("1001", b);
        assert_eq!(
            cb.debit_units(&ctx, dec!(1), &ev()).await.unwrap_err(),
            AppError::FilterNotPassing
        );

        cb.balance_mut().filter_ids.clear();
        cb.balance_mut()
            .opts
            .insert(OPT_BALANCE_LIMIT.to_string(), json!("invalid"));
        assert!(matches!(
            cb.debit_units(&ctx, dec!(1), &ev()).await,
            Err(AppError::InvalidBalanceLimit(_))
        ));

        cb.balance_mut()
            .filter_ids
            .push("invalid_filter_format".to_string());
        assert!(cb.debit_units(&ctx, dec!(1), &ev()).await.unwrap_err().is_not_found());
        assert_eq!(cb.units(), dec!(10));
    }

    #[tokio::test]
    async fn test_debit_concretes_records_charge() {
        let fltr = InlineFilterS::new();
        let conns = MockConns::new();
        let cfg = AccountsConfig::default();
        let ctx = DebitContext::new(&fltr, &conns, &cfg);

        let mut cb = factored(dec!(500), dec!(-200), dec!(100));
        let ec = cb.debit_concretes(&ctx, dec!(6), &ev()).await.unwrap();
        assert_eq!(ec.concretes, Some(dec!(6)));
        assert_eq!(ec.charges.len(), 1);
        let charge = &ec.accounting[&ec.charges[0].charging_id];
        assert_eq!(charge.units, dec!(600));
        assert_eq!(charge.balance_limit, Some(dec!(-200)));
        assert_eq!(ec.unit_factors[&charge.unit_factor_id].factor, dec!(100));
    }

    #[tokio::test]
    async fn test_debit_abstracts_own_pricing() {
        let fltr = InlineFilterS::new();
        let conns = MockConns::new();
        let cfg = AccountsConfig::default();
        let ctx = DebitContext::new(&fltr, &conns, &cfg);

        let mut b = Balance::new("CB1", BalanceType::Concrete, dec!(3));
        b.cost_increments.push(CostIncrement {
            increment: Some(seconds(1)),
            recurrent_fee: Some(dec!(0.1)),
            ..Default::default()
        });
        let mut cb = ConcreteBalance::new("1001", b);
        let ec = cb.debit_abstracts(&ctx, seconds(20), &ev()).await.unwrap();
        assert_eq!(ec.abstracts, Some(seconds(20)));
        assert_eq!(ec.concretes, Some(dec!(2)));
        assert_eq!(cb.units(), dec!(1));
    }

    #[test]
    fn test_zero_factor_is_config_error() {
        let uf = UnitFactor {
            filter_ids: Vec::new(),
            factor: dec!(0),
        };
        assert!(matches!(
            effective_factor(Some(&uf)),
            Err(AppError::Config(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_debit_never_crosses_floor(
            stock in -500i64..1_000,
            floor in -300i64..300,
            requested in 0i64..2_000,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let fltr = InlineFilterS::new();
                let conns = MockConns::new();
                let cfg = AccountsConfig::default();
                let ctx = DebitContext::new(&fltr, &conns, &cfg);

                let (stock, floor, requested) =
                    (Decimal::from(stock), Decimal::from(floor), Decimal::from(requested));
                let mut b = Balance::new("CB1", BalanceType::Concrete, stock);
                b.opts.insert(OPT_BALANCE_LIMIT.to_string(), json!(floor.to_string()));
                let mut cb = ConcreteBalance::new("1001", b);

                let (debited, _) = cb.debit_units(&ctx, requested, &ev()).await.unwrap();
                prop_assert!(debited >= Decimal::ZERO);
                prop_assert!(debited <= requested);
                prop_assert_eq!(cb.units(), stock - debited);
                if stock - floor > requested {
                    prop_assert_eq!(debited, requested);
                } else {
                    prop_assert!(cb.units() == floor || debited.is_zero());
                }
                Ok(())
            })?;
        }
    }
}
