//! Authentication types

use thiserror::Error;

use crate::cookies::CookieError;
use crate::page::PageError;
use crate::session::SessionError;

/// Which second step the login frontend asked for after identifier entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Challenge {
    /// The password-option marker appeared and was selected
    Password,
    /// No password option: a one-time code sent out of band
    Otp,
}

/// Progress of a single authentication attempt. Transient; only lives for
/// logging and never crosses an `authenticate` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Start,
    PhoneEntered,
    ChallengeDetected(Challenge),
    CredentialSubmitted,
    LoggedIn,
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("authentication failed after {attempts} attempts")]
    AuthenticationFailed { attempts: u32 },

    #[error("OTP input unavailable: {0}")]
    OtpUnavailable(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Page(#[from] PageError),

    #[error(transparent)]
    Cookies(#[from] CookieError),
}
