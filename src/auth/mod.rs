//! Authentication
//!
//! Drives the login flow against the auth frontend: identifier entry, a
//! branch on password-vs-OTP challenge, credential submission, and
//! logged-in detection, with bounded attempts. Successful logins persist
//! the session cookies for later runs.

mod flow;
mod otp;
mod types;

pub use flow::{AuthFlow, LOGIN_URL, SEARCH_URL};
pub use otp::{OtpProvider, StdinOtp};
pub use types::{AuthError, AuthState, Challenge};
