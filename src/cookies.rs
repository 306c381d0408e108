//! Cookie persistence
//!
//! Saves the session's cookie set as JSON at a configured path and restores
//! it after navigation. Loading is best-effort: a missing or unreadable file
//! never fails the surrounding flow. Expiry attributes are stripped on
//! reload so restored sessions are treated as non-expiring.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::page::{Cookie, PageError, PageSession};

#[derive(Error, Debug)]
pub enum CookieError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cookie serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Page(#[from] PageError),
}

/// Durable store for one session's cookies
pub struct CookieStore {
    path: PathBuf,
}

impl CookieStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize the session's current cookies to the store path,
    /// creating parent directories and overwriting any previous file.
    pub async fn save<P: PageSession>(&self, session: &P) -> Result<(), CookieError> {
        let cookies = session.cookies().await?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&cookies)?)?;

        info!("saved {} cookies to {}", cookies.len(), self.path.display());
        Ok(())
    }

    /// Apply stored cookies to the session, stripping expiry from each, then
    /// refresh the page. Best-effort: every failure is logged and absorbed.
    pub async fn load_into<P: PageSession>(&self, session: &P) {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(
                    "no cookie file at {}, proceeding without cookies",
                    self.path.display()
                );
                return;
            }
            Err(err) => {
                warn!("failed to read cookie file {}: {}", self.path.display(), err);
                return;
            }
        };

        let cookies: Vec<Cookie> = match serde_json::from_str(&data) {
            Ok(cookies) => cookies,
            Err(err) => {
                warn!(
                    "failed to parse cookie file {}: {}",
                    self.path.display(),
                    err
                );
                return;
            }
        };

        let total = cookies.len();
        let mut applied = 0;
        for mut cookie in cookies {
            cookie.expiry = None;
            match session.set_cookie(cookie).await {
                Ok(()) => applied += 1,
                Err(err) => warn!("failed to apply stored cookie: {}", err),
            }
        }

        if let Err(err) = session.refresh().await {
            warn!("page refresh after cookie restore failed: {}", err);
        }
        debug!(
            "restored {}/{} cookies from {}",
            applied,
            total,
            self.path.display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::testing::FakePage;

    fn cookie(name: &str, expiry: Option<f64>) -> Cookie {
        Cookie {
            name: name.to_string(),
            value: format!("{}-value", name),
            domain: ".uber.com".to_string(),
            path: "/".to_string(),
            secure: true,
            http_only: false,
            same_site: Some("Lax".to_string()),
            expiry,
        }
    }

    #[tokio::test]
    async fn test_round_trip_strips_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let store = CookieStore::new(dir.path().join("cookies.json"));

        let source = FakePage::with_state(|state| {
            state.cookies = vec![cookie("sid", Some(1_900_000_000.0)), cookie("csrf", None)];
        });
        store.save(&source).await.unwrap();

        let target = FakePage::new();
        store.load_into(&target).await;

        let state = target.state.lock().unwrap();
        assert_eq!(state.applied_cookies.len(), 2);
        // The applied set equals the original minus every expiry attribute
        assert!(state.applied_cookies.iter().all(|c| c.expiry.is_none()));
        assert_eq!(state.applied_cookies[0].name, "sid");
        assert_eq!(state.applied_cookies[0].value, "sid-value");
        assert_eq!(state.refreshes, 1);
    }

    #[tokio::test]
    async fn test_save_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("state").join("uber").join("cookies.json");
        let store = CookieStore::new(&nested);

        let source = FakePage::with_state(|state| {
            state.cookies = vec![cookie("sid", None)];
        });
        store.save(&source).await.unwrap();

        assert!(nested.exists());
    }

    #[tokio::test]
    async fn test_missing_file_is_non_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = CookieStore::new(dir.path().join("never-written.json"));

        let target = FakePage::new();
        store.load_into(&target).await;

        let state = target.state.lock().unwrap();
        assert!(state.applied_cookies.is_empty());
        // Load did not get far enough to refresh
        assert_eq!(state.refreshes, 0);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_absorbed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");
        std::fs::write(&path, "not json at all").unwrap();

        let target = FakePage::new();
        CookieStore::new(&path).load_into(&target).await;

        assert!(target.state.lock().unwrap().applied_cookies.is_empty());
    }
}
