//! Proxy rotation
//!
//! Round-robin selection from a configured credential pool, with egress-IP
//! leak detection bounded to one full pass over the pool.

mod credential;
mod pool;

pub use credential::ProxyCredential;
pub use pool::{ProxyError, ProxyPool};
