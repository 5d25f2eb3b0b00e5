use std::sync::Arc;

use anyhow::Result;
use price_tracker::config::{DealsConfig, Settings};
use price_tracker::database::Database;
use price_tracker::deals::DealsBot;
use price_tracker::fetcher::HttpFetcher;
use price_tracker::scheduler::Scheduler;
use price_tracker::tracker::PriceTracker;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting amazon.sa price tracker");

    let settings = Settings::from_env()?;
    let database = Database::new(&settings.database_url)
        .await?
        .with_history_cap(settings.history_cap);
    info!("Database ready at {}", settings.database_url);

    let fetcher = Arc::new(HttpFetcher::new(settings.fetcher_config()));
    let tracker = PriceTracker::new(fetcher, database, settings.tracker_config());

    let deals_config = DealsConfig::load(&settings.deals_config_path).await?;
    let bot = Arc::new(DealsBot::new(
        tracker.clone(),
        settings.deals_config_path.clone(),
        deals_config,
    )?);

    let scheduler = Scheduler::start(tracker, bot, &settings).await?;

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C");
    scheduler.shutdown().await?;

    info!("Stopped");
    Ok(())
}
