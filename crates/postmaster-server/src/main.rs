//! GoatFlow postmaster - polls mailboxes and routes messages

mod sink;

use anyhow::Result;
use postmaster_common::config::{Config, LoggingConfig};
use postmaster_core::{
    DbSourceFilter, FilterChain, MailPoller, Pop3Connector, PostmasterFilterStore,
    TrustedHeadersFilter,
};
use postmaster_storage::{DatabasePool, DbMailAccountRepository, DbPostmasterFilterRepository};
use sink::LoggingTicketSink;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;
    config.validate()?;

    // Initialize logging
    init_logging(&config.logging);

    info!("Starting GoatFlow postmaster...");

    // Initialize database when rules or accounts live there
    let db_pool = if config.filters.database_rules || config.inbound.accounts_from_database {
        let pool = DatabasePool::new(&config.database).await?;
        if config.database.run_migrations {
            pool.migrate().await?;
        }
        Some(pool)
    } else {
        info!("Database disabled, using static accounts only");
        None
    };

    // Build the filter chain
    let mut chain = FilterChain::new();
    if let (true, Some(pool)) = (config.filters.database_rules, &db_pool) {
        let store: Arc<dyn PostmasterFilterStore> =
            Arc::new(DbPostmasterFilterRepository::new(pool.clone()));
        chain.push(Arc::new(
            DbSourceFilter::new(store).with_body_match_limit(config.filters.body_match_limit),
        ));
    }
    chain.push(Arc::new(TrustedHeadersFilter::new(
        &config.filters.trusted_extra_headers,
    )));
    info!(filters = ?chain.ids(), "Filter chain ready");

    // Initialize poller
    let connector = Arc::new(Pop3Connector::from_config(&config.inbound));
    let mut poller = MailPoller::new(
        connector,
        chain,
        Arc::new(LoggingTicketSink),
        config.inbound.clone(),
    )
    .with_accounts(config.accounts.clone());

    if config.inbound.accounts_from_database {
        if let Some(pool) = &db_pool {
            poller = poller.with_account_repository(Arc::new(DbMailAccountRepository::new(
                pool.clone(),
            )));
        }
    }

    if config.accounts.is_empty() && !config.inbound.accounts_from_database {
        warn!("No mail accounts configured");
    }

    let cancel = CancellationToken::new();
    let poller_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            poller.run(cancel).await;
        })
    };

    info!("GoatFlow postmaster started successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    cancel.cancel();
    if let Err(e) = poller_handle.await {
        tracing::error!("Poller task error: {}", e);
    }

    info!("GoatFlow postmaster shutdown complete");

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_target(true).with_level(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
