//! Uber fare scraper
//!
//! Browser automation for retrieving dynamically rendered ride fare data.
//! The session/proxy lifecycle manager owns the live browser session,
//! rotates egress IPs on a schedule, detects IP leakage and CAPTCHA
//! interception, persists authentication state via cookies, and drives the
//! login and fare-extraction flows with bounded retries.

pub mod auth;
pub mod browser;
pub mod cookies;
pub mod extract;
pub mod identity;
pub mod output;
pub mod page;
pub mod proxy;
pub mod retry;
pub mod session;

use std::path::PathBuf;

use anyhow::Context;

use proxy::{ProxyCredential, ProxyError};

/// Application configuration, loaded from the environment
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScraperConfig {
    /// Login identifier (phone number or email)
    pub phone_number: String,
    /// Account password
    pub password: String,
    /// Proxy entries, `host:port` or `host:port:username:password`
    #[serde(default)]
    pub proxy_list: Vec<String>,
    /// Replace the browser session every N navigations
    #[serde(default = "default_rotation_threshold")]
    pub rotation_threshold: u64,
    /// Where session cookies are persisted
    #[serde(default = "default_cookies_path")]
    pub cookies_path: PathBuf,
    /// Run the browser headless
    #[serde(default = "default_headless")]
    pub headless: bool,
    /// Seconds to wait for login challenge markers
    #[serde(default = "default_challenge_wait")]
    pub challenge_wait_secs: u64,
    #[serde(default = "default_pickup_latitude")]
    pub pickup_latitude: f64,
    #[serde(default = "default_pickup_longitude")]
    pub pickup_longitude: f64,
    #[serde(default = "default_drop_latitude")]
    pub drop_latitude: f64,
    #[serde(default = "default_drop_longitude")]
    pub drop_longitude: f64,
}

fn default_rotation_threshold() -> u64 {
    6
}
fn default_cookies_path() -> PathBuf {
    PathBuf::from("uber_cookies.json")
}
fn default_headless() -> bool {
    true
}
fn default_challenge_wait() -> u64 {
    5
}
fn default_pickup_latitude() -> f64 {
    30.0272027
}
fn default_pickup_longitude() -> f64 {
    31.1384884
}
fn default_drop_latitude() -> f64 {
    30.0249469
}
fn default_drop_longitude() -> f64 {
    30.8969389
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            phone_number: String::new(),
            password: String::new(),
            proxy_list: vec![],
            rotation_threshold: default_rotation_threshold(),
            cookies_path: default_cookies_path(),
            headless: default_headless(),
            challenge_wait_secs: default_challenge_wait(),
            pickup_latitude: default_pickup_latitude(),
            pickup_longitude: default_pickup_longitude(),
            drop_latitude: default_drop_latitude(),
            drop_longitude: default_drop_longitude(),
        }
    }
}

impl ScraperConfig {
    /// Load configuration from `UBER_*` environment variables. Credentials
    /// are required; everything else falls back to defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let phone_number =
            std::env::var("UBER_PHONE_NUMBER").context("UBER_PHONE_NUMBER is not set")?;
        let password = std::env::var("UBER_PASSWORD").context("UBER_PASSWORD is not set")?;

        let proxy_list = std::env::var("UBER_PROXY_LIST")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|entry| !entry.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            phone_number,
            password,
            proxy_list,
            rotation_threshold: env_parsed("UBER_ROTATION_THRESHOLD", default_rotation_threshold())?,
            cookies_path: std::env::var("UBER_COOKIES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_cookies_path()),
            headless: env_parsed("UBER_HEADLESS", default_headless())?,
            challenge_wait_secs: env_parsed("UBER_CHALLENGE_WAIT_SECS", default_challenge_wait())?,
            pickup_latitude: env_parsed("UBER_PICKUP_LAT", default_pickup_latitude())?,
            pickup_longitude: env_parsed("UBER_PICKUP_LONG", default_pickup_longitude())?,
            drop_latitude: env_parsed("UBER_DROP_LAT", default_drop_latitude())?,
            drop_longitude: env_parsed("UBER_DROP_LONG", default_drop_longitude())?,
        })
    }

    /// Parse the configured proxy entries
    pub fn proxies(&self) -> Result<Vec<ProxyCredential>, ProxyError> {
        self.proxy_list
            .iter()
            .map(|entry| ProxyCredential::parse(entry))
            .collect()
    }
}

fn env_parsed<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}

/// Log directory (shared between console banner and file appender)
pub fn log_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("fare-scraper").join("logs"))
}

/// Initialize logging: console layer plus a daily rolling file when a log
/// directory is available. Keep the returned guard alive for the process
/// lifetime so buffered file output gets flushed.
pub fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    if let Some(log_dir) = log_dir() {
        let _ = std::fs::create_dir_all(&log_dir);
        let file_appender = tracing_appender::rolling::daily(&log_dir, "fare-scraper.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ScraperConfig::default();
        assert_eq!(config.rotation_threshold, 6);
        assert_eq!(config.cookies_path, PathBuf::from("uber_cookies.json"));
        assert!(config.headless);
        assert!(config.proxies().unwrap().is_empty());
    }

    #[test]
    fn test_proxies_parse_and_fail() {
        let config = ScraperConfig {
            proxy_list: vec![
                "10.0.0.1:8080".to_string(),
                "10.0.0.2:8080:user:pass".to_string(),
            ],
            ..Default::default()
        };
        let proxies = config.proxies().unwrap();
        assert_eq!(proxies.len(), 2);
        assert!(proxies[1].has_auth());

        let bad = ScraperConfig {
            proxy_list: vec!["10.0.0.1:8080:user".to_string()],
            ..Default::default()
        };
        assert!(bad.proxies().is_err());
    }
}
