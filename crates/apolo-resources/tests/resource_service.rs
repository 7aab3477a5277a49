//! Resource admission through ResourceService

use apolo_cache::keys::resource_profile_lock_key;
use apolo_cache::{Guardian, InMemoryDataManager, MemoryCache};
use apolo_core::config::AppConfig;
use apolo_core::filters::InlineFilterS;
use apolo_core::models::{ChargingEvent, ResourceProfile};
use apolo_core::traits::ConnManager;
use apolo_core::{AppError, AppResult};
use apolo_resources::constants::{OPT_UNITS, OPT_USAGE_ID, REPLY_OK};
use apolo_resources::ResourceService;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// No downstream services
struct NoConns;

#[async_trait]
impl ConnManager for NoConns {
    async fn call(&self, conn_ids: &[String], _method: &str, _args: Value) -> AppResult<Value> {
        Err(AppError::NotConnected(conn_ids.join(",")))
    }
}

async fn setup(cfg: AppConfig, profiles: Vec<ResourceProfile>) -> (Arc<ResourceService>, Arc<Guardian>) {
    let guardian = Arc::new(Guardian::new());
    let svc = Arc::new(ResourceService::new(
        Arc::new(InMemoryDataManager::new()),
        Arc::new(InlineFilterS::new()),
        Arc::new(NoConns),
        Arc::new(MemoryCache::new()),
        guardian.clone(),
        &cfg,
    ));
    for profile in profiles {
        svc.set_resource_profile(profile).await.unwrap();
    }
    (svc, guardian)
}

fn channels(limit: Decimal) -> ResourceProfile {
    let mut p = ResourceProfile::new("apolo.net", "RES_CHANNELS", limit);
    p.allocation_message = "Approved".to_string();
    p.filter_ids = vec!["*string:~*req.Account:1001".to_string()];
    p
}

fn call(ev_id: &str, usage_id: &str, units: i64) -> ChargingEvent {
    ChargingEvent::new("apolo.net", ev_id)
        .with_field("Account", "1001")
        .with_opt(OPT_USAGE_ID, usage_id)
        .with_opt(OPT_UNITS, units)
}

#[tokio::test]
async fn test_allocate_then_release() {
    let (svc, guardian) = setup(AppConfig::default(), vec![channels(dec!(10))]).await;

    let ev = call("EV1", "RU1", 5);
    assert_eq!(svc.authorize_resources(&ev).await.unwrap(), "Approved");
    assert_eq!(svc.allocate_resources(&ev).await.unwrap(), "Approved");
    let res = svc.get_resource("apolo.net", "RES_CHANNELS").await.unwrap();
    assert_eq!(res.total_usage(), dec!(5));

    assert_eq!(svc.release_resources(&ev).await.unwrap(), REPLY_OK);
    let res = svc.get_resource("apolo.net", "RES_CHANNELS").await.unwrap();
    assert_eq!(res.total_usage(), dec!(0));
    assert!(res.usages.is_empty());
    assert_eq!(guardian.held_count(), 0);
}

#[tokio::test]
async fn test_unmatched_account() {
    let (svc, _) = setup(AppConfig::default(), vec![channels(dec!(10))]).await;

    let ev = call("EV1", "RU1", 1).with_field("Account", "1002");
    assert!(svc.allocate_resources(&ev).await.unwrap_err().is_not_found());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_allocations_respect_limit() {
    let (svc, guardian) = setup(AppConfig::default(), vec![channels(dec!(10))]).await;

    let mut handles = Vec::new();
    for i in 0..20 {
        let svc = svc.clone();
        handles.push(tokio::spawn(async move {
            let ev = call(&format!("EV{}", i), &format!("RU{}", i), 1);
            svc.allocate_resources(&ev).await
        }));
    }
    let mut admitted = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(message) => {
                assert_eq!(message, "Approved");
                admitted += 1;
            }
            Err(e) => assert_eq!(e, AppError::ResourceUnavailable),
        }
    }
    assert_eq!(admitted, 10);
    let res = svc.get_resource("apolo.net", "RES_CHANNELS").await.unwrap();
    assert_eq!(res.total_usage(), dec!(10));
    assert_eq!(guardian.held_count(), 0);
}

#[tokio::test]
async fn test_expired_usage_frees_capacity() {
    let mut p = channels(dec!(1));
    p.usage_ttl_ms = 50;
    let (svc, _) = setup(AppConfig::default(), vec![p]).await;

    svc.allocate_resources(&call("EV1", "RU1", 1)).await.unwrap();
    assert_eq!(
        svc.authorize_resources(&call("EV2", "RU2", 1))
            .await
            .unwrap_err(),
        AppError::ResourceUnauthorized
    );

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(
        svc.allocate_resources(&call("EV2", "RU2", 1)).await.unwrap(),
        "Approved"
    );
    let res = svc.get_resource("apolo.net", "RES_CHANNELS").await.unwrap();
    assert_eq!(res.ttl_idx, vec!["RU2"]);
}

#[tokio::test]
async fn test_lock_timeout_fails_closed() {
    let mut cfg = AppConfig::default();
    cfg.general.locking_timeout_ms = 20;
    let (svc, guardian) = setup(cfg, vec![channels(dec!(10))]).await;

    let held = guardian
        .guard_ids(
            &[resource_profile_lock_key("apolo.net", "RES_CHANNELS")],
            Duration::from_millis(20),
        )
        .await
        .unwrap();
    let ev = call("EV1", "RU1", 1);
    assert!(matches!(
        svc.allocate_resources(&ev).await,
        Err(AppError::LockTimeout(_))
    ));
    assert_eq!(guardian.held_count(), 1);

    guardian.unguard_ids(&held);
    assert_eq!(svc.allocate_resources(&ev).await.unwrap(), "Approved");
    assert_eq!(guardian.held_count(), 0);
}
