#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use crate::{
    chain::{ChainGateway, LcdChainGateway},
    config::Config,
    db::RoleSyncDb,
    executor::ReconciliationExecutor,
    fetcher::BalanceFetcher,
    platform::{DiscordRoleApi, PlatformRoleApi},
    poller::BalancePoller,
    scheduler::Scheduler,
    server::{AppState, build_router},
    store::RoleSyncStores,
    validator::AntiGamingValidator,
};

pub mod chain;
pub mod config;
pub mod db;
pub mod executor;
pub mod fetcher;
pub mod platform;
pub mod poller;
pub mod resolver;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod types;
pub mod validator;

#[cfg(test)]
mod test_support;
#[cfg(test)]
mod tests;

/// Every long-lived engine component, built once at startup and shared by
/// reference.
#[derive(Clone)]
pub struct RoleSyncContext {
    pub config: Config,
    pub stores: RoleSyncStores,
    pub validator: Arc<AntiGamingValidator>,
    pub poller: Arc<BalancePoller>,
    pub executor: Arc<ReconciliationExecutor>,
    pub scheduler: Arc<Scheduler>,
}

impl RoleSyncContext {
    pub fn assemble(
        config: Config,
        stores: RoleSyncStores,
        chain: Arc<dyn ChainGateway>,
        platform: Arc<dyn PlatformRoleApi>,
    ) -> Self {
        let validator = Arc::new(AntiGamingValidator::new(
            chain.clone(),
            stores.history.clone(),
            config.validator.clone(),
        ));
        let poller = Arc::new(BalancePoller::new(
            stores.directory.clone(),
            stores.history.clone(),
            BalanceFetcher::new(chain, config.poller.fetch_timeout()),
            config.poller.clone(),
        ));
        let executor = Arc::new(ReconciliationExecutor::new(
            stores.roles.clone(),
            stores.audit.clone(),
            platform,
            validator.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            poller.clone(),
            executor.clone(),
            config.scheduler.clone(),
        ));
        Self {
            config,
            stores,
            validator,
            poller,
            executor,
            scheduler,
        }
    }

    pub fn router(&self) -> axum::Router {
        build_router(AppState::new(
            self.config.service_name.clone(),
            self.scheduler.clone(),
            self.validator.clone(),
        ))
    }
}

/// Resolves stores, the chain gateway and the platform client from config.
/// A missing platform token fails here rather than on the first reconcile.
pub async fn build_context(config: Config) -> Result<RoleSyncContext> {
    let stores = match config.db_url.as_deref() {
        Some(url) => {
            let db = Arc::new(RoleSyncDb::connect(url).await?);
            db.migrate().await?;
            store::postgres(db)
        }
        None => {
            tracing::warn!("DB_URL not set; using in-memory stores");
            store::memory()
        }
    };
    let chain: Arc<dyn ChainGateway> = Arc::new(LcdChainGateway::new(
        config.chain_base_url.as_str(),
        config.poller.fetch_timeout(),
    ));
    let platform: Arc<dyn PlatformRoleApi> = Arc::new(
        DiscordRoleApi::from_config(&config.discord, config.poller.fetch_timeout())
            .context("discord platform client")?,
    );
    Ok(RoleSyncContext::assemble(config, stores, chain, platform))
}

/// Runs the scheduler in the background and serves the status surface until
/// `shutdown` resolves.
pub async fn serve(
    config: Config,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let context = build_context(config).await?;
    let listener = TcpListener::bind(context.config.bind_addr).await?;
    info!(
        service = %context.config.service_name,
        bind_addr = %context.config.bind_addr,
        chain_base_url = %context.config.chain_base_url,
        "role sync service listening"
    );

    let scheduler_task = context.scheduler.start()?;
    let served = axum::serve(listener, context.router())
        .with_graceful_shutdown(shutdown)
        .await;

    context.scheduler.stop();
    scheduler_task.await.context("join scheduler task")?;
    served?;
    Ok(())
}
