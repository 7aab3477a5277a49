//! Account service
//!
//! Entry point of the balance engine. Resolves the accounts matching an
//! event, locks them, runs the debit across them in weight order and stores
//! the outcome.

use apolo_cache::keys::account_lock_key;
use apolo_cache::Guardian;
use apolo_core::config::{AccountsConfig, AppConfig};
use apolo_core::decimal::decimal_from_value;
use apolo_core::models::event::{OPT_ACCOUNT_IDS, OPT_USAGE, USAGE_FIELD};
use apolo_core::models::{Account, Balance, BalancesBackup, ChargingEvent, EventCharges};
use apolo_core::traits::{ConnManager, DataManager, FilterEvaluator};
use apolo_core::weights::weight_from_dynamics;
use apolo_core::{AppError, AppResult, Checkpoint};
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::debit::debit_account;
use crate::DebitContext;

/// Account locks held for one request, released on drop
struct AccountLocks {
    guardian: Arc<Guardian>,
    ref_ids: Vec<String>,
}

impl AccountLocks {
    fn new(guardian: Arc<Guardian>) -> Self {
        Self {
            guardian,
            ref_ids: Vec::new(),
        }
    }

    async fn lock(&mut self, tenant: &str, id: &str, timeout: Duration) -> AppResult<()> {
        let ref_id = self
            .guardian
            .guard_ids(&[account_lock_key(tenant, id)], timeout)
            .await?;
        self.ref_ids.push(ref_id);
        Ok(())
    }
}

impl Drop for AccountLocks {
    fn drop(&mut self) {
        for ref_id in self.ref_ids.drain(..) {
            self.guardian.unguard_ids(&ref_id);
        }
    }
}

/// Balance engine service
pub struct AccountService {
    dm: Arc<dyn DataManager>,
    filters: Arc<dyn FilterEvaluator>,
    conns: Arc<dyn ConnManager>,
    guardian: Arc<Guardian>,
    cfg: AccountsConfig,
    default_tenant: String,
    locking_timeout: Duration,
}

impl std::fmt::Debug for AccountService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountService")
            .field("cfg", &self.cfg)
            .field("default_tenant", &self.default_tenant)
            .finish()
    }
}

impl AccountService {
    pub fn new(
        dm: Arc<dyn DataManager>,
        filters: Arc<dyn FilterEvaluator>,
        conns: Arc<dyn ConnManager>,
        guardian: Arc<Guardian>,
        cfg: &AppConfig,
    ) -> Self {
        Self {
            dm,
            filters,
            conns,
            guardian,
            cfg: cfg.accounts.clone(),
            default_tenant: cfg.general.default_tenant.clone(),
            locking_timeout: cfg.general.locking_timeout(),
        }
    }

    fn ctx(&self) -> DebitContext<'_> {
        DebitContext::new(self.filters.as_ref(), self.conns.as_ref(), &self.cfg)
    }

    fn tenant<'a>(&'a self, tenant: &'a str) -> &'a str {
        if tenant.is_empty() {
            &self.default_tenant
        } else {
            tenant
        }
    }

    fn normalize(&self, event: &ChargingEvent) -> ChargingEvent {
        let mut event = event.clone();
        if event.tenant.is_empty() {
            event.tenant = self.default_tenant.clone();
        }
        event
    }

    /// Accounts passing their filters for `event`, highest weight first
    ///
    /// The returned locks must be kept for as long as the accounts are used.
    async fn matching_accounts(
        &self,
        event: &ChargingEvent,
    ) -> AppResult<(Vec<Account>, AccountLocks)> {
        let tenant = event.tenant.as_str();
        let mut ids = match event.opt_as_strings(OPT_ACCOUNT_IDS) {
            Some(ids) if !ids.is_empty() => ids,
            _ => self.dm.matching_account_ids(tenant, event).await?,
        };
        // account locks are not reentrant and must be taken in one global order
        ids.sort();
        ids.dedup();

        let mut locks = AccountLocks::new(self.guardian.clone());
        let mut weighted: Vec<(f64, Account)> = Vec::with_capacity(ids.len());
        for id in &ids {
            locks.lock(tenant, id, self.locking_timeout).await?;
            let account = match self.dm.get_account(tenant, id).await {
                Ok(account) => account,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            if !self.filters.pass(tenant, &account.filter_ids, event).await? {
                continue;
            }
            let weight =
                weight_from_dynamics(&account.weights, self.filters.as_ref(), tenant, event)
                    .await?;
            weighted.push((weight, account));
        }
        if weighted.is_empty() {
            return Err(AppError::not_found());
        }
        weighted.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
        debug!(
            "Matched {} account(s) for event {}",
            weighted.len(),
            event.tenant_id()
        );
        Ok((weighted.into_iter().map(|(_, a)| a).collect(), locks))
    }

    /// Usage carried by the event: the `*usage` option first, then the field
    fn usage_from_event(event: &ChargingEvent) -> AppResult<Option<Decimal>> {
        let Some(value) = event.opt(OPT_USAGE).or_else(|| event.field(USAGE_FIELD)) else {
            return Ok(None);
        };
        decimal_from_value(value)
            .map(Some)
            .ok_or_else(|| AppError::InvalidInput(format!("invalid usage: {}", value)))
    }

    async fn debit_accounts(
        &self,
        event: &ChargingEvent,
        usage: Decimal,
        concretes_only: bool,
        store: bool,
    ) -> AppResult<EventCharges> {
        let (mut accounts, _locks) = self.matching_accounts(event).await?;
        let ctx = self.ctx();
        let backups: Vec<Checkpoint<BalancesBackup>> =
            accounts.iter().map(Checkpoint::capture).collect();

        let mut ec = EventCharges::new();
        let mut remaining = usage;
        for account in accounts.iter_mut() {
            if remaining <= Decimal::ZERO {
                break;
            }
            let charged = debit_account(&ctx, account, remaining, event, concretes_only).await?;
            remaining -= if concretes_only {
                charged.concretes_or_zero()
            } else {
                charged.abstracts_or_zero()
            };
            ec.merge(charged);
        }

        if store {
            self.store_altered(&mut accounts, backups).await?;
        }
        Ok(ec)
    }

    /// Persists every altered account, putting back the stored ones on failure
    async fn store_altered(
        &self,
        accounts: &mut [Account],
        backups: Vec<Checkpoint<BalancesBackup>>,
    ) -> AppResult<()> {
        let mut stored: Vec<usize> = Vec::new();
        let mut failure = None;
        for idx in 0..accounts.len() {
            if !accounts[idx].balances_altered(backups[idx].state()) {
                continue;
            }
            match self.dm.set_account(&accounts[idx]).await {
                Ok(()) => stored.push(idx),
                Err(e) => {
                    warn!("Failed storing account {}: {}", accounts[idx].tenant_id(), e);
                    failure = Some(e);
                    break;
                }
            }
        }
        let Some(err) = failure else {
            return Ok(());
        };

        for (idx, backup) in backups.into_iter().enumerate() {
            if !stored.contains(&idx) {
                continue;
            }
            backup.rollback(&mut accounts[idx]);
            if let Err(e) = self.dm.set_account(&accounts[idx]).await {
                warn!(
                    "Failed restoring account {}: {}",
                    accounts[idx].tenant_id(),
                    e
                );
            }
        }
        Err(err)
    }

    /// Accounts matching the event, highest weight first
    #[instrument(skip(self, event), fields(event = %event.id))]
    pub async fn accounts_for_event(&self, event: &ChargingEvent) -> AppResult<Vec<Account>> {
        let event = self.normalize(event);
        let (accounts, _locks) = self.matching_accounts(&event).await?;
        Ok(accounts)
    }

    /// Usage the matching accounts could cover, without storing anything
    #[instrument(skip(self, event), fields(event = %event.id))]
    pub async fn max_abstracts(&self, event: &ChargingEvent) -> AppResult<EventCharges> {
        let event = self.normalize(event);
        let usage = Self::usage_from_event(&event)?
            .unwrap_or_else(|| Decimal::from(self.cfg.max_usage_ns));
        self.debit_accounts(&event, usage, false, false).await
    }

    /// Debits the event usage through the abstract balances
    #[instrument(skip(self, event), fields(event = %event.id))]
    pub async fn debit_abstracts(&self, event: &ChargingEvent) -> AppResult<EventCharges> {
        let event = self.normalize(event);
        let usage = Self::usage_from_event(&event)?
            .ok_or_else(|| AppError::mandatory_ie_missing([USAGE_FIELD]))?;
        self.debit_accounts(&event, usage, false, true).await
    }

    /// Units the concrete balances could cover, without storing anything
    #[instrument(skip(self, event), fields(event = %event.id))]
    pub async fn max_concretes(&self, event: &ChargingEvent) -> AppResult<EventCharges> {
        let event = self.normalize(event);
        let usage = Self::usage_from_event(&event)?
            .unwrap_or_else(|| Decimal::from(self.cfg.max_usage_ns));
        self.debit_accounts(&event, usage, true, false).await
    }

    /// Debits the event usage straight from the concrete balances
    #[instrument(skip(self, event), fields(event = %event.id))]
    pub async fn debit_concretes(&self, event: &ChargingEvent) -> AppResult<EventCharges> {
        let event = self.normalize(event);
        let usage = Self::usage_from_event(&event)?
            .ok_or_else(|| AppError::mandatory_ie_missing([USAGE_FIELD]))?;
        self.debit_accounts(&event, usage, true, true).await
    }

    pub async fn get_account(&self, tenant: &str, id: &str) -> AppResult<Account> {
        self.dm.get_account(self.tenant(tenant), id).await
    }

    /// Stores a whole account, replacing any previous version
    pub async fn set_account(&self, mut account: Account) -> AppResult<()> {
        if account.id.is_empty() {
            return Err(AppError::mandatory_ie_missing(["ID"]));
        }
        if account.tenant.is_empty() {
            account.tenant = self.default_tenant.clone();
        }
        let keys = [account_lock_key(&account.tenant, &account.id)];
        self.guardian
            .guard(&keys, self.locking_timeout, || self.dm.set_account(&account))
            .await?;
        info!("Account {} stored", account.tenant_id());
        Ok(())
    }

    pub async fn remove_account(&self, tenant: &str, id: &str) -> AppResult<()> {
        let tenant = self.tenant(tenant);
        let keys = [account_lock_key(tenant, id)];
        self.guardian
            .guard(&keys, self.locking_timeout, || self.dm.remove_account(tenant, id))
            .await?;
        info!("Account {}:{} removed", tenant, id);
        Ok(())
    }

    /// Adds or replaces one balance of an existing account
    pub async fn set_balance(&self, tenant: &str, account_id: &str, balance: Balance) -> AppResult<()> {
        if balance.id.is_empty() {
            return Err(AppError::mandatory_ie_missing(["Balance.ID"]));
        }
        let tenant = self.tenant(tenant);
        let keys = [account_lock_key(tenant, account_id)];
        self.guardian
            .guard(&keys, self.locking_timeout, || async move {
                let mut account = self.dm.get_account(tenant, account_id).await?;
                debug!("Setting balance {} on account {}", balance.id, account.tenant_id());
                account.balances.insert(balance.id.clone(), balance);
                self.dm.set_account(&account).await
            })
            .await
    }

    /// Removes one balance; `NotFound` when the account does not have it
    pub async fn remove_balance(&self, tenant: &str, account_id: &str, balance_id: &str) -> AppResult<()> {
        let tenant = self.tenant(tenant);
        let keys = [account_lock_key(tenant, account_id)];
        self.guardian
            .guard(&keys, self.locking_timeout, || async move {
                let mut account = self.dm.get_account(tenant, account_id).await?;
                if account.balances.remove(balance_id).is_none() {
                    return Err(AppError::NotFound(balance_id.to_string()));
                }
                self.dm.set_account(&account).await
            })
            .await
    }

    /// Gives back the units recorded in `charges`
    #[instrument(skip(self, charges))]
    pub async fn refund_charges(&self, tenant: &str, charges: &EventCharges) -> AppResult<()> {
        let tenant = self.tenant(tenant);
        let mut per_account: BTreeMap<String, Vec<(String, Decimal)>> = BTreeMap::new();
        for ((account_id, balance_id), units) in charges.units_per_balance() {
            per_account
                .entry(account_id)
                .or_default()
                .push((balance_id, units));
        }

        let mut locks = AccountLocks::new(self.guardian.clone());
        let mut accounts = Vec::with_capacity(per_account.len());
        let mut backups: Vec<Checkpoint<BalancesBackup>> = Vec::with_capacity(per_account.len());
        for (account_id, refunds) in per_account {
            locks.lock(tenant, &account_id, self.locking_timeout).await?;
            let mut account = self.dm.get_account(tenant, &account_id).await?;
            backups.push(Checkpoint::capture(&account));
            for (balance_id, units) in refunds {
                match account.balances.get_mut(&balance_id) {
                    Some(balance) => balance.units += units,
                    None => warn!(
                        "Refund skipped for missing balance {} of account {}",
                        balance_id,
                        account.tenant_id()
                    ),
                }
            }
            accounts.push(account);
        }
        self.store_altered(&mut accounts, backups).await?;
        debug!("Refunded charges on {} account(s)", accounts.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockConns;
    use apolo_cache::InMemoryDataManager;
    use apolo_core::decimal::seconds;
    use apolo_core::filters::InlineFilterS;
    use apolo_core::models::{
        BalanceType, CostIncrement, Resource, ResourceProfile, UnitFactor, OPT_BALANCE_LIMIT,
    };
    use apolo_core::weights::DynamicWeight;
    use rust_decimal_macros::dec;
    use serde_json::json;

    async fn service_with(accounts: Vec<Account>) -> (AccountService, Arc<InMemoryDataManager>) {
        let dm = Arc::new(InMemoryDataManager::new());
        for account in &accounts {
            dm.set_account(account).await.unwrap();
        }
        let svc = AccountService::new(
            dm.clone(),
            Arc::new(InlineFilterS::new()),
            Arc::new(MockConns::new()),
            Arc::new(Guardian::new()),
            &AppConfig::default(),
        );
        (svc, dm)
    }

    fn monetary(id: &str, units: Decimal) -> Balance {
        Balance::new(id, BalanceType::Concrete, units)
    }

    fn minutes(id: &str, units: Decimal, fee: Decimal) -> Balance {
        let mut b = Balance::new(id, BalanceType::Abstract, units);
        b.cost_increments.push(CostIncrement {
            increment: Some(seconds(1)),
            recurrent_fee: Some(fee),
            ..Default::default()
        });
        b.weights = vec![DynamicWeight::fixed(10.0)];
        b
    }

    #[tokio::test]
    async fn test_debit_concretes_stores_account() {
        let acc = Account::new("apolo.net", "1001").with_balance(monetary("CB1", dec!(10)));
        let (svc, dm) = service_with(vec![acc]).await;

        let ev = ChargingEvent::new("apolo.net", "EV1").with_field("Usage", 4);
        let ec = svc.debit_concretes(&ev).await.unwrap();
        assert_eq!(ec.concretes, Some(dec!(4)));
        let stored = dm.get_account("apolo.net", "1001").await.unwrap();
        assert_eq!(stored.balances["CB1"].units, dec!(6));
    }

    #[tokio::test]
    async fn test_max_concretes_never_stores() {
        let acc = Account::new("apolo.net", "1001").with_balance(monetary("CB1", dec!(10)));
        let (svc, dm) = service_with(vec![acc]).await;

        let ev = ChargingEvent::new("apolo.net", "EV1").with_field("Usage", 4);
        let ec = svc.max_concretes(&ev).await.unwrap();
        assert_eq!(ec.concretes, Some(dec!(4)));
        let stored = dm.get_account("apolo.net", "1001").await.unwrap();
        assert_eq!(stored.balances["CB1"].units, dec!(10));
    }

    #[tokio::test]
    async fn test_max_abstracts_defaults_usage() {
        let mut cb = monetary("CB1", dec!(5));
        cb.cost_increments.push(CostIncrement {
            increment: Some(seconds(1)),
            recurrent_fee: Some(dec!(0.1)),
            ..Default::default()
        });
        let acc = Account::new("apolo.net", "1001")
            .with_balance(minutes("AB1", seconds(60), dec!(0.1)))
            .with_balance(cb);
        let (svc, _) = service_with(vec![acc]).await;

        // CB1 is spent by the quota before its own turn comes
        let ev = ChargingEvent::new("apolo.net", "EV1");
        let ec = svc.max_abstracts(&ev).await.unwrap();
        assert_eq!(ec.abstracts, Some(seconds(50)));
    }

    #[tokio::test]
    async fn test_debit_requires_usage() {
        let (svc, _) = service_with(vec![Account::new("apolo.net", "1001")]).await;
        let ev = ChargingEvent::new("apolo.net", "EV1");
        assert_eq!(
            svc.debit_abstracts(&ev).await.unwrap_err(),
            AppError::MandatoryIeMissing("Usage".to_string())
        );

        let ev = ev.with_opt(OPT_USAGE, "sixty");
        assert!(matches!(
            svc.debit_concretes(&ev).await,
            Err(AppError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_accounts_sorted_and_filtered() {
        let mut low = Account::new("apolo.net", "ACC_LOW");
        low.weights = vec![DynamicWeight::fixed(10.0)];
        let mut high = Account::new("apolo.net", "ACC_HIGH");
        high.weights = vec![DynamicWeight::fixed(20.0)];
        let mut other = Account::new("apolo.net", "ACC_OTHER");
        other.filter_ids = vec!["*string:~*req.Account:1002".to_string()];
        let (svc, _) = service_with(vec![low, high, other]).await;

        let ev = ChargingEvent::new("", "EV1").with_field("Account", "1001");
        let ids: Vec<String> = svc
            .accounts_for_event(&ev)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec!["ACC_HIGH", "ACC_LOW"]);
    }

    #[tokio::test]
    async fn test_account_ids_option_restricts_matching() {
        let (svc, _) = service_with(vec![
            Account::new("apolo.net", "1001"),
            Account::new("apolo.net", "1002"),
        ])
        .await;
        let ev = ChargingEvent::new("apolo.net", "EV1")
            .with_opt(OPT_ACCOUNT_IDS, json!(["1002", "1003"]));
        let accounts = svc.accounts_for_event(&ev).await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].id, "1002");

        let ev = ChargingEvent::new("apolo.net", "EV2")
            .with_opt(OPT_ACCOUNT_IDS, json!(["1003"]));
        assert!(svc.accounts_for_event(&ev).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_repeated_account_ids_lock_once() {
        let acc = Account::new("apolo.net", "1001").with_balance(monetary("CB1", dec!(10)));
        let (svc, dm) = service_with(vec![acc]).await;

        let ev = ChargingEvent::new("apolo.net", "EV1")
            .with_field("Usage", 4)
            .with_opt(OPT_ACCOUNT_IDS, json!(["1001", "1001"]));
        let ec = tokio::time::timeout(Duration::from_secs(1), svc.debit_concretes(&ev))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ec.concretes, Some(dec!(4)));
        let stored = dm.get_account("apolo.net", "1001").await.unwrap();
        assert_eq!(stored.balances["CB1"].units, dec!(6));
        assert_eq!(svc.guardian.held_count(), 0);
    }

    #[tokio::test]
    async fn test_crossed_account_order_does_not_deadlock() {
        let (svc, _) = service_with(vec![
            Account::new("apolo.net", "ACC1").with_balance(monetary("CB1", dec!(100))),
            Account::new("apolo.net", "ACC2").with_balance(monetary("CB1", dec!(100))),
        ])
        .await;
        let svc = Arc::new(svc);

        let mut handles = Vec::new();
        for i in 0..20 {
            let svc = svc.clone();
            let ids = if i % 2 == 0 {
                json!(["ACC1", "ACC2"])
            } else {
                json!(["ACC2", "ACC1"])
            };
            handles.push(tokio::spawn(async move {
                let ev = ChargingEvent::new("apolo.net", format!("EV{}", i))
                    .with_field("Usage", 1)
                    .with_opt(OPT_ACCOUNT_IDS, ids);
                svc.debit_concretes(&ev).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(svc.guardian.held_count(), 0);
    }

    #[tokio::test]
    async fn test_overflowing_usage_is_rejected() {
        let mut cb = monetary("CB1", dec!(500));
        cb.unit_factors.push(UnitFactor {
            filter_ids: Vec::new(),
            factor: dec!(100),
        });
        let (svc, dm) = service_with(vec![Account::new("apolo.net", "1001").with_balance(cb)]).await;

        let ev = ChargingEvent::new("apolo.net", "EV1")
            .with_opt(OPT_USAGE, "1000000000000000000000000000");
        assert!(matches!(
            svc.max_concretes(&ev).await,
            Err(AppError::InvalidInput(_))
        ));
        assert_eq!(svc.guardian.held_count(), 0);
        let stored = dm.get_account("apolo.net", "1001").await.unwrap();
        assert_eq!(stored.balances["CB1"].units, dec!(500));
    }

    #[tokio::test]
    async fn test_debit_spans_accounts() {
        let mut first = Account::new("apolo.net", "ACC1").with_balance(monetary("CB1", dec!(3)));
        first.weights = vec![DynamicWeight::fixed(20.0)];
        let second = Account::new("apolo.net", "ACC2").with_balance(monetary("CB1", dec!(10)));
        let (svc, dm) = service_with(vec![first, second]).await;

        let ev = ChargingEvent::new("apolo.net", "EV1").with_field("Usage", 5);
        let ec = svc.debit_concretes(&ev).await.unwrap();
        assert_eq!(ec.concretes, Some(dec!(5)));
        let acc1 = dm.get_account("apolo.net", "ACC1").await.unwrap();
        let acc2 = dm.get_account("apolo.net", "ACC2").await.unwrap();
        assert_eq!(acc1.balances["CB1"].units, dec!(0));
        assert_eq!(acc2.balances["CB1"].units, dec!(8));
    }

    #[tokio::test]
    async fn test_failed_account_keeps_store_untouched() {
        let mut first = Account::new("apolo.net", "ACC1").with_balance(monetary("CB1", dec!(3)));
        first.weights = vec![DynamicWeight::fixed(20.0)];
        let mut broken = monetary("CB1", dec!(10));
        broken
            .opts
            .insert(OPT_BALANCE_LIMIT.to_string(), json!("invalid"));
        let second = Account::new("apolo.net", "ACC2").with_balance(broken);
        let (svc, dm) = service_with(vec![first, second]).await;

        let ev = ChargingEvent::new("apolo.net", "EV1").with_field("Usage", 5);
        assert!(svc.debit_concretes(&ev).await.is_err());
        let acc1 = dm.get_account("apolo.net", "ACC1").await.unwrap();
        assert_eq!(acc1.balances["CB1"].units, dec!(3));
    }

    #[tokio::test]
    async fn test_balance_actions() {
        let (svc, _) = service_with(vec![Account::new("apolo.net", "1001")]).await;
        svc.set_balance("", "1001", monetary("CB1", dec!(7)))
            .await
            .unwrap();
        let acc = svc.get_account("apolo.net", "1001").await.unwrap();
        assert_eq!(acc.balances["CB1"].units, dec!(7));

        svc.remove_balance("apolo.net", "1001", "CB1").await.unwrap();
        assert!(svc
            .remove_balance("apolo.net", "1001", "CB1")
            .await
            .unwrap_err()
            .is_not_found());
        assert!(svc
            .set_balance("apolo.net", "1002", monetary("CB1", dec!(1)))
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_refund_charges() {
        let acc = Account::new("apolo.net", "1001")
            .with_balance(minutes("AB1", seconds(60), dec!(0.1)))
            .with_balance(monetary("CB1", dec!(5)));
        let (svc, dm) = service_with(vec![acc]).await;

        let ev = ChargingEvent::new("apolo.net", "EV1").with_field("Usage", seconds(20).to_string());
        let ec = svc.debit_abstracts(&ev).await.unwrap();
        let acc = dm.get_account("apolo.net", "1001").await.unwrap();
        assert_eq!(acc.balances["AB1"].units, seconds(40));
        assert_eq!(acc.balances["CB1"].units, dec!(3));

        svc.refund_charges("apolo.net", &ec).await.unwrap();
        let acc = dm.get_account("apolo.net", "1001").await.unwrap();
        assert_eq!(acc.balances["AB1"].units, seconds(60));
        assert_eq!(acc.balances["CB1"].units, dec!(5));
    }

    /// Storage refusing writes of one account
    struct RefusingDm {
        inner: Arc<InMemoryDataManager>,
        refused: &'static str,
    }

    #[async_trait::async_trait]
    impl DataManager for RefusingDm {
        async fn get_account(&self, tenant: &str, id: &str) -> AppResult<Account> {
            self.inner.get_account(tenant, id).await
        }

        async fn set_account(&self, account: &Account) -> AppResult<()> {
            if account.id == self.refused {
                return Err(AppError::Storage(format!("write refused for {}", account.id)));
            }
            self.inner.set_account(account).await
        }

        async fn remove_account(&self, tenant: &str, id: &str) -> AppResult<()> {
            self.inner.remove_account(tenant, id).await
        }

        async fn matching_account_ids(
            &self,
            tenant: &str,
            event: &ChargingEvent,
        ) -> AppResult<Vec<String>> {
            self.inner.matching_account_ids(tenant, event).await
        }

        async fn get_resource(&self, tenant: &str, id: &str) -> AppResult<Resource> {
            self.inner.get_resource(tenant, id).await
        }

        async fn set_resource(&self, resource: &Resource) -> AppResult<()> {
            self.inner.set_resource(resource).await
        }

        async fn remove_resource(&self, tenant: &str, id: &str) -> AppResult<()> {
            self.inner.remove_resource(tenant, id).await
        }

        async fn get_resource_profile(&self, tenant: &str, id: &str) -> AppResult<ResourceProfile> {
            self.inner.get_resource_profile(tenant, id).await
        }

        async fn set_resource_profile(&self, profile: &ResourceProfile) -> AppResult<()> {
            self.inner.set_resource_profile(profile).await
        }

        async fn remove_resource_profile(&self, tenant: &str, id: &str) -> AppResult<()> {
            self.inner.remove_resource_profile(tenant, id).await
        }

        async fn matching_resource_profile_ids(
            &self,
            tenant: &str,
            event: &ChargingEvent,
        ) -> AppResult<Vec<String>> {
            self.inner.matching_resource_profile_ids(tenant, event).await
        }
    }

    #[tokio::test]
    async fn test_refund_is_all_or_nothing() {
        let mut first = Account::new("apolo.net", "ACC1").with_balance(monetary("CB1", dec!(3)));
        first.weights = vec![DynamicWeight::fixed(20.0)];
        let second = Account::new("apolo.net", "ACC2").with_balance(monetary("CB1", dec!(10)));
        let (svc, dm) = service_with(vec![first, second]).await;

        let ev = ChargingEvent::new("apolo.net", "EV1").with_field("Usage", 5);
        let ec = svc.debit_concretes(&ev).await.unwrap();

        let refusing = AccountService::new(
            Arc::new(RefusingDm {
                inner: dm.clone(),
                refused: "ACC2",
            }),
            Arc::new(InlineFilterS::new()),
            Arc::new(MockConns::new()),
            Arc::new(Guardian::new()),
            &AppConfig::default(),
        );
        assert!(matches!(
            refusing.refund_charges("apolo.net", &ec).await,
            Err(AppError::Storage(_))
        ));
        let acc1 = dm.get_account("apolo.net", "ACC1").await.unwrap();
        let acc2 = dm.get_account("apolo.net", "ACC2").await.unwrap();
        assert_eq!(acc1.balances["CB1"].units, dec!(0));
        assert_eq!(acc2.balances["CB1"].units, dec!(8));

        svc.refund_charges("apolo.net", &ec).await.unwrap();
        let acc1 = dm.get_account("apolo.net", "ACC1").await.unwrap();
        assert_eq!(acc1.balances["CB1"].units, dec!(3));
    }

    #[tokio::test]
    async fn test_set_and_remove_account() {
        let (svc, _) = service_with(Vec::new()).await;
        assert_eq!(
            svc.set_account(Account::new("apolo.net", "")).await.unwrap_err(),
            AppError::MandatoryIeMissing("ID".to_string())
        );
        svc.set_account(Account::new("", "1001")).await.unwrap();
        assert!(svc.get_account("apolo.net", "1001").await.is_ok());
        svc.remove_account("apolo.net", "1001").await.unwrap();
        assert!(svc
            .get_account("apolo.net", "1001")
            .await
            .unwrap_err()
            .is_not_found());
    }
}
