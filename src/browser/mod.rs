//! Chrome-backed page sessions
//!
//! Concrete implementation of the page-session capability over the Chrome
//! DevTools Protocol, with anti-fingerprinting configuration baked in.

mod session;

pub use session::{ChromeSession, ChromeSessionConfig, ChromeSessionFactory};
