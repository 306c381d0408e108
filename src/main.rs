//! Command-line entry point
//!
//! One run is single-shot with one compensation: attempt fare extraction,
//! and on any failure authenticate once and retry extraction exactly once
//! more. A second consecutive failure terminates the run.

use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use fare_scraper::auth::{AuthFlow, StdinOtp};
use fare_scraper::browser::{ChromeSessionConfig, ChromeSessionFactory};
use fare_scraper::cookies::CookieStore;
use fare_scraper::extract::{Coordinates, FareFlow};
use fare_scraper::identity::RealIp;
use fare_scraper::output::CsvSink;
use fare_scraper::proxy::ProxyPool;
use fare_scraper::retry::RetryPolicy;
use fare_scraper::session::SessionManager;
use fare_scraper::ScraperConfig;

/// Output directory for extracted quotes
const CSV_DIR: &str = "csv/uber";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _guard = fare_scraper::init_logging();

    info!("starting fare scraper");
    if let Some(dir) = fare_scraper::log_dir() {
        info!("log files saved to: {}", dir.display());
    }

    let config = ScraperConfig::from_env()?;
    let pool = ProxyPool::new(config.proxies().context("invalid proxy list")?);
    let real_ip = RealIp::resolve(&RetryPolicy::default()).await;

    let factory =
        ChromeSessionFactory::new(ChromeSessionConfig::default().headless(config.headless));
    let cookies = CookieStore::new(&config.cookies_path);
    let manager = SessionManager::connect(
        factory,
        pool,
        real_ip,
        cookies,
        config.rotation_threshold,
    )
    .await?;

    let pickup = Coordinates {
        latitude: config.pickup_latitude,
        longitude: config.pickup_longitude,
    };
    let drop = Coordinates {
        latitude: config.drop_latitude,
        longitude: config.drop_longitude,
    };

    let sink = CsvSink::new(CSV_DIR);
    let flow = FareFlow::new();

    if let Err(err) = flow.collect(&manager, &sink, pickup, drop).await {
        warn!("fare collection failed ({}), re-authenticating once", err);
        let otp = StdinOtp;
        let auth = AuthFlow::new(&otp)
            .challenge_wait(Duration::from_secs(config.challenge_wait_secs));
        auth.authenticate(&manager, &config.phone_number, &config.password)
            .await?;
        flow.collect(&manager, &sink, pickup, drop).await?;
    }

    info!("fare collection complete");
    manager.shutdown().await;
    Ok(())
}
