//! Round-robin proxy pool with leak accounting
//!
//! The pool hands out credentials in fixed order, wrapping around, and keeps
//! the running count of IP-leak detections. Rotation stays bounded: once the
//! leak count exceeds the pool size (one full pass over every proxy) the
//! pool reports all proxies exhausted instead of rotating forever.

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use crate::identity::RealIp;

use super::ProxyCredential;

/// Errors raised by proxy parsing and leak verification
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("proxy configuration error: {0}")]
    Config(String),

    #[error("egress IP leak detected (observed {observed})")]
    LeakDetected { observed: String },

    #[error("all proxies exhausted after {leaks} leak detections")]
    AllProxiesExhausted { leaks: u32 },
}

/// Ordered pool of proxy credentials, fixed at construction.
///
/// An empty pool means direct-connection mode: `next_proxy` yields `None`
/// and leak verification is never invoked by the session manager.
pub struct ProxyPool {
    proxies: Vec<ProxyCredential>,
    state: Mutex<PoolState>,
}

struct PoolState {
    cursor: usize,
    leak_count: u32,
}

impl ProxyPool {
    pub fn new(proxies: Vec<ProxyCredential>) -> Self {
        if proxies.is_empty() {
            info!("no proxies configured, running in direct-connection mode");
        } else {
            info!("proxy pool initialized with {} entries", proxies.len());
        }
        Self {
            proxies,
            state: Mutex::new(PoolState {
                cursor: 0,
                leak_count: 0,
            }),
        }
    }

    /// Parse a list of raw credential strings into a pool
    pub fn from_raw(raw: &[String]) -> Result<Self, ProxyError> {
        let proxies = raw
            .iter()
            .map(|entry| ProxyCredential::parse(entry))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(proxies))
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// Next credential in round-robin order, `None` in direct mode.
    ///
    /// Call at most once per session creation so the rotation stays fair.
    pub fn next_proxy(&self) -> Option<ProxyCredential> {
        if self.proxies.is_empty() {
            return None;
        }
        let mut state = self.state.lock();
        let proxy = self.proxies[state.cursor].clone();
        state.cursor = (state.cursor + 1) % self.proxies.len();
        Some(proxy)
    }

    /// Compare the observed egress IP against the real one.
    ///
    /// `observed` is `None` when the echo page could not be read; that case
    /// counts as a leak, matching the conservative side of the check. A
    /// [`RealIp::Unknown`] real IP disables the check entirely (fail-open;
    /// flagged at resolve time).
    pub fn verify_no_leak(&self, observed: Option<&str>, real: &RealIp) -> Result<(), ProxyError> {
        let real_ip = match real {
            RealIp::Known(ip) => ip,
            RealIp::Unknown => return Ok(()),
        };

        let leaked = match observed {
            Some(ip) => ip == real_ip,
            None => true,
        };
        if !leaked {
            return Ok(());
        }

        let mut state = self.state.lock();
        state.leak_count += 1;
        let leaks = state.leak_count;
        drop(state);

        if leaks <= self.proxies.len() as u32 {
            warn!(
                "IP leak detected ({} of {} allowed), forcing proxy rotation",
                leaks,
                self.proxies.len()
            );
            Err(ProxyError::LeakDetected {
                observed: observed.unwrap_or("unresolved").to_string(),
            })
        } else {
            Err(ProxyError::AllProxiesExhausted { leaks })
        }
    }
}
