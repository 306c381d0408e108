//! External OTP input
//!
//! The login flow blocks on a one-time code it cannot produce itself. The
//! provider trait makes that an explicit suspension point: the state
//! machine requests a code and resumes once one is supplied, which keeps
//! the OTP branch drivable from tests and headless harnesses.

use async_trait::async_trait;

use super::AuthError;

/// Source of one-time codes for the OTP login branch
#[async_trait]
pub trait OtpProvider: Send + Sync {
    async fn request_otp(&self) -> Result<String, AuthError>;
}

/// Prompts for the code on the controlling terminal
pub struct StdinOtp;

#[async_trait]
impl OtpProvider for StdinOtp {
    async fn request_otp(&self) -> Result<String, AuthError> {
        let line = tokio::task::spawn_blocking(|| {
            use std::io::{BufRead, Write};

            print!("Enter OTP: ");
            std::io::stdout().flush()?;
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            Ok::<_, std::io::Error>(line)
        })
        .await
        .map_err(|e| AuthError::OtpUnavailable(e.to_string()))?
        .map_err(|e| AuthError::OtpUnavailable(e.to_string()))?;

        let code = line.trim().to_string();
        if code.is_empty() {
            return Err(AuthError::OtpUnavailable("empty OTP entered".to_string()));
        }
        Ok(code)
    }
}
