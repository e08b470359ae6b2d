//! Boost Runner - automated club boost donations
//!
//! Startup sequence:
//! 1. Load configuration from the environment
//! 2. Log in and snapshot the daily quotas
//! 3. Fetch and persist the account inventory
//! 4. Load the current boost target
//! 5. Hand off to the orchestration loop

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use boost_runner::runner::{App, Shutdown};
use boost_runner::session::HttpAuthenticator;
use boost_runner::throttle::Throttle;
use boost_runner::{Authenticator, BotConfig, InventoryStore, QuotaTracker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = BotConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_max_level(parse_level(&cfg.log_level))
        .init();

    info!("Starting Boost Runner");
    info!(
        "Service: {} | user {} | dry-run: {} | {} req/min",
        cfg.base_url, cfg.user_id, cfg.dry_run, cfg.requests_per_minute
    );

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, finishing up");
                shutdown.trigger();
            }
        });
    }

    let throttle = Arc::new(Throttle::new(cfg.requests_per_minute));
    let auth: Arc<dyn Authenticator> = Arc::new(HttpAuthenticator::new(&cfg, throttle));

    let session = auth.login().await.context("login failed")?;

    let mut quota = QuotaTracker::new(session.clone(), cfg.reset_utc_offset_hours);
    match (
        quota.donations_remaining(true).await,
        quota.replacements_remaining(false).await,
    ) {
        (Ok(donations), Ok(replacements)) => info!(
            "Quota today: {} donations, {} replacements left",
            donations, replacements
        ),
        _ => warn!("Could not read quotas at startup"),
    }

    let mut store = InventoryStore::open(&cfg.data_dir, cfg.cache_validity_hours).await?;
    match session.fetch_inventory().await {
        Ok(inventory) => {
            info!("Loaded {} inventory instances", inventory.len());
            store.replace_instances(inventory);
            store.save_instances().await?;
        }
        Err(e) => {
            warn!(
                "Inventory fetch failed, continuing with {} persisted instances: {}",
                store.instances().len(),
                e
            );
        }
    }

    let target = session
        .fetch_target()
        .await
        .context("could not load the boost target")?;
    info!(
        "Boost target: {} ({}, tier {}, {} owners, {} wanters)",
        target.item_id, target.display_name, target.tier, target.owners_count, target.wanters_count
    );
    store.save_target(&target).await?;

    let mut app = App::new(cfg, auth, session, store, target, shutdown);
    app.run().await
}

fn parse_level(level: &str) -> tracing::Level {
    match level.to_ascii_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}
