//! Apolo charging engine
//!
//! Composition root: loads the configuration, builds the shared cache,
//! lock service, storage and RPC connections, and wires them into the
//! balance and resource engines. Runs until interrupted, then stores any
//! pending resource state.

use anyhow::Context;
use apolo_accounts::AccountService;
use apolo_cache::{Guardian, InMemoryDataManager, MemoryCache};
use apolo_core::config::{AppConfig, LoggingConfig};
use apolo_core::filters::InlineFilterS;
use apolo_resources::ResourceService;
use apolo_rpc::JsonRpcConnManager;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging
fn init_tracing(cfg: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "apolo_charging={lvl},apolo_accounts={lvl},apolo_resources={lvl},apolo_cache={lvl},apolo_rpc={lvl}",
            lvl = cfg.level
        ))
    });

    let registry = tracing_subscriber::registry().with(env_filter);
    if cfg.json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let cfg = AppConfig::load().context("failed to load configuration")?;
    init_tracing(&cfg.logging);

    info!(
        "Starting Apolo charging engine v{}",
        env!("CARGO_PKG_VERSION")
    );

    let cache = Arc::new(MemoryCache::new());
    let guardian = Arc::new(Guardian::new());
    let dm = Arc::new(InMemoryDataManager::new());
    let filters = Arc::new(InlineFilterS::new());
    let conns = Arc::new(
        JsonRpcConnManager::from_config(&cfg.rpc).context("failed to set up RPC connections")?,
    );

    let accounts = AccountService::new(
        dm.clone(),
        filters.clone(),
        conns.clone(),
        guardian.clone(),
        &cfg,
    );
    info!("Balance engine ready: {:?}", accounts);

    let resources = Arc::new(ResourceService::new(
        dm,
        filters,
        conns,
        cache.clone(),
        guardian,
        &cfg,
    ));
    resources.start_loop().await;
    info!("Resource engine ready: {:?}", resources);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    resources.shutdown().await;
    let purged = cache.purge_expired();
    info!("Stopped, {} expired cache entries dropped", purged);
    Ok(())
}
