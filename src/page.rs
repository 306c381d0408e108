//! Page-session capability boundary
//!
//! The core depends only on this surface, never on a concrete automation
//! engine. Operations are selector-keyed; waiting is a bounded poll.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proxy::ProxyCredential;

/// Errors surfaced by a page session
#[derive(Error, Debug)]
pub enum PageError {
    #[error("Failed to launch browser: {0}")]
    LaunchFailed(String),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),
}

fn default_cookie_path() -> String {
    "/".to_string()
}

/// One browser cookie, also the on-disk persistence record.
///
/// `expiry` is written when known and always dropped on reload so replayed
/// sessions never expire client-side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<f64>,
}

/// One live browser page, selector-addressed.
#[async_trait]
pub trait PageSession: Send + Sync {
    /// Navigate to `url` and wait for the main frame to load
    async fn navigate(&self, url: &str) -> Result<(), PageError>;

    /// URL the page ended up on
    async fn current_url(&self) -> Result<String, PageError>;

    /// Reload the current page
    async fn refresh(&self) -> Result<(), PageError>;

    /// Click the first element matching `selector`
    async fn click(&self, selector: &str) -> Result<(), PageError>;

    /// Focus the first element matching `selector` and type `text` into it
    async fn type_text(&self, selector: &str, text: &str) -> Result<(), PageError>;

    /// Inner text of the first element matching `selector`
    async fn text(&self, selector: &str) -> Result<String, PageError>;

    /// Number of elements matching `selector`
    async fn count(&self, selector: &str) -> Result<usize, PageError>;

    /// Poll for an element matching `selector`, up to `timeout`. Driver
    /// errors during the poll count as absence.
    async fn wait_for(&self, selector: &str, timeout: Duration) -> bool;

    /// All cookies visible to the session
    async fn cookies(&self) -> Result<Vec<Cookie>, PageError>;

    /// Apply one cookie to the session
    async fn set_cookie(&self, cookie: Cookie) -> Result<(), PageError>;

    /// Tear the session down, releasing the underlying browser
    async fn quit(&self) -> Result<(), PageError>;
}

/// Builds page sessions. The factory only constructs and configures; proxy
/// verification is the session manager's responsibility.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    type Session: PageSession;

    async fn create(&self, proxy: Option<&ProxyCredential>) -> Result<Self::Session, PageError>;
}
