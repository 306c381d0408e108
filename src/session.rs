//! Session lifecycle management
//!
//! Owns the single live page session and everything about its identity:
//! which proxy it egresses through, whether that proxy actually took effect,
//! and when the session is old enough to be replaced. Navigation goes
//! through here so every page load gets the same treatment: pre-emptive
//! rotation at the configured call threshold, cookie restore, and
//! soft-block classification.

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use crate::cookies::CookieStore;
use crate::identity::{RealIp, IP_ECHO_URL};
use crate::page::{PageError, PageSession, SessionFactory};
use crate::proxy::{ProxyError, ProxyPool};
use crate::retry::RetryPolicy;

/// URL fragments identifying CAPTCHA/interstitial pages
const BLOCK_URL_PATTERNS: &[&str] = &["google.com/sorry", "google.com/recaptcha", "/captcha"];

/// Element holding the plain-text body on the IP echo page
const ECHO_BODY: &str = "pre";

/// Outcome of one rate-limited navigation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavOutcome {
    Success,
    /// The page did not load in time; non-fatal, not retried
    Timeout,
    /// A CAPTCHA or "sorry" interstitial was served instead of the page
    SoftBlocked,
    /// The driver failed in some other way
    DriverError,
}

impl NavOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, NavOutcome::Success)
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to launch session: {0}")]
    Launch(#[source] PageError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("navigation failed: {0}")]
    Navigation(#[source] PageError),

    #[error("blocked by interstitial at {0}")]
    SoftBlocked(String),
}

impl SessionError {
    /// Transient failures worth another attempt. Exhausted pools and
    /// configuration errors are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Launch(_)
            | SessionError::Navigation(_)
            | SessionError::SoftBlocked(_) => true,
            SessionError::Proxy(ProxyError::LeakDetected { .. }) => true,
            SessionError::Proxy(_) => false,
        }
    }
}

/// Owner of the one current page session.
///
/// Rotation is replace-and-discard: a fresh session is built and verified
/// first, then swapped in, and the old handle is quit. Two sessions never
/// serve requests at the same time.
pub struct SessionManager<F: SessionFactory> {
    factory: F,
    pool: ProxyPool,
    real_ip: RealIp,
    cookies: CookieStore,
    session: RwLock<F::Session>,
    calls: AtomicU64,
    rotation_threshold: u64,
    retry: RetryPolicy,
}

impl<F: SessionFactory> SessionManager<F> {
    /// Build the first leak-verified session and wrap it in a manager
    pub async fn connect(
        factory: F,
        pool: ProxyPool,
        real_ip: RealIp,
        cookies: CookieStore,
        rotation_threshold: u64,
    ) -> Result<Self, SessionError> {
        Self::connect_with(
            factory,
            pool,
            real_ip,
            cookies,
            rotation_threshold,
            RetryPolicy::default(),
        )
        .await
    }

    pub async fn connect_with(
        factory: F,
        pool: ProxyPool,
        real_ip: RealIp,
        cookies: CookieStore,
        rotation_threshold: u64,
        retry: RetryPolicy,
    ) -> Result<Self, SessionError> {
        let session = Self::build_verified(&factory, &pool, &real_ip, &retry).await?;
        Ok(Self {
            factory,
            pool,
            real_ip,
            cookies,
            session: RwLock::new(session),
            calls: AtomicU64::new(0),
            rotation_threshold,
            retry,
        })
    }

    /// Read access to the current session for flow-level page interaction.
    /// Drop the guard before calling [`navigate`](Self::navigate) again.
    pub async fn page(&self) -> RwLockReadGuard<'_, F::Session> {
        self.session.read().await
    }

    pub fn cookie_store(&self) -> &CookieStore {
        &self.cookies
    }

    /// Persist the current session's cookies to the store
    pub async fn save_cookies(&self) -> Result<(), crate::cookies::CookieError> {
        let session = self.session.read().await;
        self.cookies.save(&*session).await
    }

    /// Navigate the current session to `url`.
    ///
    /// Each attempt counts toward the rotation threshold; when the counter
    /// hits a multiple of it the session is replaced before the page load.
    /// Cookies are restored (and the page refreshed) after navigation.
    /// Soft-blocks and driver errors are retried up to the policy's budget
    /// and then degrade to their non-success outcome; a timeout returns
    /// immediately as [`NavOutcome::Timeout`]. Only fatal proxy conditions
    /// surface as errors.
    pub async fn navigate(&self, url: &str) -> Result<NavOutcome, SessionError> {
        let result = self
            .retry
            .run(
                |attempt| self.navigate_attempt(url, attempt),
                SessionError::is_retryable,
            )
            .await;

        match result {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.is_retryable() => {
                warn!("navigation to {} gave up: {}", url, err);
                Ok(match err {
                    SessionError::SoftBlocked(_) => NavOutcome::SoftBlocked,
                    _ => NavOutcome::DriverError,
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn navigate_attempt(&self, url: &str, attempt: u32) -> Result<NavOutcome, SessionError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if self.rotation_threshold > 0 && call % self.rotation_threshold == 0 {
            info!(
                "navigation call #{} hit rotation threshold {}, replacing session",
                call, self.rotation_threshold
            );
            self.replace_session().await?;
        }

        let session = self.session.read().await;
        debug!("navigating to {} (attempt {})", url, attempt);
        match session.navigate(url).await {
            Ok(()) => {}
            Err(PageError::Timeout(msg)) => {
                warn!("timeout while loading {}: {}", url, msg);
                return Ok(NavOutcome::Timeout);
            }
            Err(err) => return Err(SessionError::Navigation(err)),
        }

        self.cookies.load_into(&*session).await;

        let landed = session.current_url().await.unwrap_or_default();
        if BLOCK_URL_PATTERNS.iter().any(|p| landed.contains(p)) {
            return Err(SessionError::SoftBlocked(landed));
        }

        Ok(NavOutcome::Success)
    }

    /// Build a fresh session and swap it in for the current one
    async fn replace_session(&self) -> Result<(), SessionError> {
        let fresh =
            Self::build_verified(&self.factory, &self.pool, &self.real_ip, &self.retry).await?;

        let mut guard = self.session.write().await;
        let old = std::mem::replace(&mut *guard, fresh);
        drop(guard);

        if let Err(err) = old.quit().await {
            warn!("failed to quit replaced session: {}", err);
        }
        Ok(())
    }

    /// Create a session through the factory and, when a proxy is assigned,
    /// verify the proxy actually carries the traffic before handing the
    /// session out. Leak detections rotate to the next proxy via the retry
    /// policy until the pool-size ceiling trips.
    async fn build_verified(
        factory: &F,
        pool: &ProxyPool,
        real_ip: &RealIp,
        retry: &RetryPolicy,
    ) -> Result<F::Session, SessionError> {
        retry
            .run(
                |attempt| Self::build_attempt(factory, pool, real_ip, attempt),
                SessionError::is_retryable,
            )
            .await
    }

    async fn build_attempt(
        factory: &F,
        pool: &ProxyPool,
        real_ip: &RealIp,
        attempt: u32,
    ) -> Result<F::Session, SessionError> {
        let proxy = pool.next_proxy();
        match &proxy {
            Some(proxy) => info!("creating session via proxy {} (attempt {})", proxy, attempt),
            None => debug!("creating direct session (attempt {})", attempt),
        }

        let session = factory
            .create(proxy.as_ref())
            .await
            .map_err(SessionError::Launch)?;

        if proxy.is_some() {
            let observed = Self::observed_ip(&session).await;
            match &observed {
                Some(ip) => debug!("proxied session egress IP: {}", ip),
                None => warn!("could not resolve proxied egress IP"),
            }
            if let Err(err) = pool.verify_no_leak(observed.as_deref(), real_ip) {
                if let Err(quit_err) = session.quit().await {
                    warn!("failed to quit leaking session: {}", quit_err);
                }
                return Err(SessionError::Proxy(err));
            }
        }

        Ok(session)
    }

    /// Ask the echo endpoint what IP this session's traffic egresses from
    async fn observed_ip(session: &F::Session) -> Option<String> {
        if let Err(err) = session.navigate(IP_ECHO_URL).await {
            warn!("could not load IP echo page: {}", err);
            return None;
        }
        match session.text(ECHO_BODY).await {
            Ok(body) => Some(body.trim().to_string()),
            Err(err) => {
                warn!("could not read IP echo body: {}", err);
                None
            }
        }
    }

    /// Quit the current session. The manager is unusable afterwards.
    pub async fn shutdown(self) {
        let session = self.session.into_inner();
        if let Err(err) = session.quit().await {
            warn!("failed to quit session on shutdown: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::testing::{FakeFactory, FakePage};
    use crate::page::Cookie;
    use crate::proxy::ProxyPool;
    use std::collections::VecDeque;

    const TARGET: &str = "https://m.uber.com/looking";

    fn temp_store() -> (tempfile::TempDir, CookieStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CookieStore::new(dir.path().join("cookies.json"));
        (dir, store)
    }

    async fn direct_manager(pages: Vec<FakePage>, threshold: u64) -> (tempfile::TempDir, SessionManager<FakeFactory>) {
        let (dir, store) = temp_store();
        let manager = SessionManager::connect(
            FakeFactory::new(pages),
            ProxyPool::new(vec![]),
            RealIp::Unknown,
            store,
            threshold,
        )
        .await
        .unwrap();
        (dir, manager)
    }

    #[tokio::test]
    async fn test_direct_mode_skips_leak_probe() {
        let page = FakePage::new();
        let (_dir, manager) = direct_manager(vec![page.clone()], 100).await;

        // No echo navigation happened and no proxy was assigned
        assert!(page.state.lock().unwrap().nav_log.is_empty());
        drop(manager);
    }

    #[tokio::test]
    async fn test_rotation_threshold_replaces_session() {
        let (_dir, manager) = direct_manager(vec![], 3).await;

        for _ in 0..2 {
            assert!(manager.navigate(TARGET).await.unwrap().is_success());
        }
        // Calls 1 and 2: only the initial session exists
        assert_eq!(manager.factory.create_count(), 1);

        assert!(manager.navigate(TARGET).await.unwrap().is_success());
        // Call 3 is a multiple of the threshold: one replacement
        assert_eq!(manager.factory.create_count(), 2);

        for _ in 0..4 {
            assert!(manager.navigate(TARGET).await.unwrap().is_success());
        }
        // Calls 4..7: exactly one more replacement, at call 6
        assert_eq!(manager.factory.create_count(), 3);
    }

    #[tokio::test]
    async fn test_navigate_restores_cookies() {
        let (_dir, store) = temp_store();
        let seeded = FakePage::with_state(|state| {
            state.cookies = vec![Cookie {
                name: "sid".to_string(),
                value: "abc".to_string(),
                domain: ".uber.com".to_string(),
                path: "/".to_string(),
                secure: true,
                http_only: false,
                same_site: None,
                expiry: Some(1_900_000_000.0),
            }];
        });
        store.save(&seeded).await.unwrap();

        let page = FakePage::new();
        let manager = SessionManager::connect(
            FakeFactory::new(vec![page.clone()]),
            ProxyPool::new(vec![]),
            RealIp::Unknown,
            store,
            100,
        )
        .await
        .unwrap();

        assert!(manager.navigate(TARGET).await.unwrap().is_success());

        let state = page.state.lock().unwrap();
        assert_eq!(state.applied_cookies.len(), 1);
        assert!(state.applied_cookies[0].expiry.is_none());
        assert_eq!(state.refreshes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_block_retries_then_degrades() {
        let page = FakePage::with_state(|state| {
            state.url_map.insert(
                TARGET.to_string(),
                "https://www.google.com/sorry/index?continue=1".to_string(),
            );
        });
        let (_dir, manager) = direct_manager(vec![page.clone()], 100).await;

        let outcome = manager.navigate(TARGET).await.unwrap();
        assert_eq!(outcome, NavOutcome::SoftBlocked);
        assert!(!outcome.is_success());
        // The whole operation went through the three-attempt retry budget
        assert_eq!(page.state.lock().unwrap().nav_log.len(), 3);
    }

    #[tokio::test]
    async fn test_timeout_is_not_retried() {
        let page = FakePage::with_state(|state| {
            state.nav_failures =
                VecDeque::from([PageError::Timeout("page load".to_string())]);
        });
        let (_dir, manager) = direct_manager(vec![page.clone()], 100).await;

        let outcome = manager.navigate(TARGET).await.unwrap();
        assert_eq!(outcome, NavOutcome::Timeout);
        assert_eq!(page.state.lock().unwrap().nav_log.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_errors_degrade_after_retries() {
        let page = FakePage::with_state(|state| {
            state.nav_failures = VecDeque::from([
                PageError::Driver("net::ERR_PROXY_CONNECTION_FAILED".to_string()),
                PageError::Driver("net::ERR_PROXY_CONNECTION_FAILED".to_string()),
                PageError::Driver("net::ERR_PROXY_CONNECTION_FAILED".to_string()),
            ]);
        });
        let (_dir, manager) = direct_manager(vec![page.clone()], 100).await;

        let outcome = manager.navigate(TARGET).await.unwrap();
        assert_eq!(outcome, NavOutcome::DriverError);
        assert_eq!(page.state.lock().unwrap().nav_log.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leak_rotates_to_next_proxy() {
        let real = RealIp::Known("198.51.100.7".to_string());
        let leaky = FakePage::with_state(|state| {
            state.texts.insert("pre".to_string(), "198.51.100.7".to_string());
        });
        let clean = FakePage::with_state(|state| {
            state.texts.insert("pre".to_string(), "203.0.113.9".to_string());
        });

        let (_dir, store) = temp_store();
        let pool = ProxyPool::from_raw(&[
            "10.0.0.1:8080".to_string(),
            "10.0.0.2:8080".to_string(),
        ])
        .unwrap();

        let manager = SessionManager::connect(
            FakeFactory::new(vec![leaky.clone(), clean.clone()]),
            pool,
            real,
            store,
            100,
        )
        .await
        .unwrap();

        // Both proxies were drawn, the leaking session was discarded
        let created = manager.factory.created_with.lock().unwrap().clone();
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].as_ref().unwrap().host, "10.0.0.1");
        assert_eq!(created[1].as_ref().unwrap().host, "10.0.0.2");
        assert!(leaky.state.lock().unwrap().quit_called);

        // The surviving session serves navigation
        assert!(manager.navigate(TARGET).await.unwrap().is_success());
        assert!(clean
            .state
            .lock()
            .unwrap()
            .nav_log
            .contains(&TARGET.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_proxy_leaking_is_fatal() {
        let real = RealIp::Known("198.51.100.7".to_string());
        let leaky = || {
            FakePage::with_state(|state| {
                state.texts.insert("pre".to_string(), "198.51.100.7".to_string());
            })
        };

        let (_dir, store) = temp_store();
        let pool = ProxyPool::from_raw(&[
            "10.0.0.1:8080".to_string(),
            "10.0.0.2:8080".to_string(),
        ])
        .unwrap();

        let result = SessionManager::connect(
            FakeFactory::new(vec![leaky(), leaky(), leaky()]),
            pool,
            real,
            store,
            100,
        )
        .await;

        assert!(matches!(
            result,
            Err(SessionError::Proxy(ProxyError::AllProxiesExhausted { .. }))
        ));
    }
}
