use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ats_crawler::config::CrawlerConfig;
use ats_crawler::daemon::CrawlDaemon;
use ats_crawler::fetcher::{PoliteFetcher, ReqwestTransport};
use ats_crawler::host_state::InMemoryHostState;
use ats_crawler::pipeline::CompanyCrawler;
use ats_crawler::queue::{PostgresWorkQueue, WorkQueue};
use ats_crawler::robots::RobotsCache;
use ats_crawler::sitemap::SitemapDiscovery;
use ats_crawler::storage::PostgresCrawlStorage;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Arc::new(CrawlerConfig::from_env()?);
    let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = PgPool::connect(&database_url)
        .await
        .context("Failed to connect to database")?;
    info!("connected to database");

    let queue = Arc::new(PostgresWorkQueue::new(pool.clone(), config.daemon.clone()));
    let bootstrapped = queue.bootstrap().await?;
    info!(new_entries = bootstrapped, "crawl queue bootstrapped");

    let transport = Arc::new(ReqwestTransport::new()?);
    let host_state = Arc::new(InMemoryHostState::new());
    let fetcher = Arc::new(PoliteFetcher::new(config.clone(), transport, host_state));
    let robots = Arc::new(RobotsCache::new(config.clone(), fetcher.clone()));
    let sitemaps = Arc::new(SitemapDiscovery::new(fetcher.clone(), robots.clone()));
    let storage = Arc::new(PostgresCrawlStorage::new(pool));
    let crawler = Arc::new(CompanyCrawler::new(
        config.clone(),
        fetcher,
        robots,
        sitemaps,
        storage.clone(),
    ));

    let daemon = Arc::new(CrawlDaemon::new(
        queue,
        storage,
        crawler,
        config.daemon.clone(),
    ));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    daemon.run(shutdown).await
}
