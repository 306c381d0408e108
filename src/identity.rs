//! Real egress IP resolution
//!
//! The leak check needs to know what the machine's own IP looks like before
//! any proxy is involved. Resolution goes straight to an IP-echo endpoint
//! with proxying disabled on the client.

use std::time::Duration;

use tracing::{info, warn};

use crate::retry::RetryPolicy;

/// IP-echo endpoint returning the caller's address as plain text
pub const IP_ECHO_URL: &str = "http://api64.ipify.org";

/// The caller's real (non-proxied) egress IP.
///
/// `Unknown` means resolution failed after retries. An unknown real IP never
/// matches an observed proxy IP, so leak detection degrades to always-pass.
/// That fail-open behavior is deliberate and logged loudly when it happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealIp {
    Known(String),
    Unknown,
}

impl RealIp {
    /// Resolve against the default echo endpoint
    pub async fn resolve(policy: &RetryPolicy) -> Self {
        Self::resolve_from(IP_ECHO_URL, policy).await
    }

    /// Resolve against a specific echo endpoint. Network failures are
    /// retried per `policy`; the final failure yields `Unknown` instead of
    /// an error.
    pub async fn resolve_from(echo_url: &str, policy: &RetryPolicy) -> Self {
        let client = match reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(10))
            .build()
        {
            Ok(client) => client,
            Err(err) => {
                warn!("failed to build HTTP client for IP resolution: {}", err);
                return RealIp::Unknown;
            }
        };

        let result = policy
            .run(
                |_attempt| {
                    let client = client.clone();
                    let url = echo_url.to_string();
                    async move {
                        let response = client.get(&url).send().await?;
                        let response = response.error_for_status()?;
                        let body = response.text().await?;
                        Ok::<_, reqwest::Error>(body.trim().to_string())
                    }
                },
                |_| true,
            )
            .await;

        match result {
            Ok(ip) if !ip.is_empty() => {
                info!("real egress IP resolved: {}", ip);
                RealIp::Known(ip)
            }
            Ok(_) => {
                warn!("IP echo endpoint returned an empty body, leak detection disabled");
                RealIp::Unknown
            }
            Err(err) => {
                warn!(
                    "could not resolve real IP ({}), leak detection disabled",
                    err
                );
                RealIp::Unknown
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_resolves_trimmed_ip() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("  203.0.113.9\n"))
            .mount(&server)
            .await;

        let policy = RetryPolicy::new(3, Duration::ZERO);
        let real = RealIp::resolve_from(&server.uri(), &policy).await;
        assert_eq!(real, RealIp::Known("203.0.113.9".to_string()));
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let server = MockServer::start().await;
        // Two failures, then a success within the three-attempt budget
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("203.0.113.9"))
            .mount(&server)
            .await;

        let policy = RetryPolicy::new(3, Duration::ZERO);
        let real = RealIp::resolve_from(&server.uri(), &policy).await;
        assert_eq!(real, RealIp::Known("203.0.113.9".to_string()));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_degrades_to_unknown() {
        // Nothing listens on the discard port
        let policy = RetryPolicy::new(2, Duration::ZERO);
        let real = RealIp::resolve_from("http://127.0.0.1:9/", &policy).await;
        assert_eq!(real, RealIp::Unknown);
    }

    #[tokio::test]
    async fn test_http_error_degrades_to_unknown() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let policy = RetryPolicy::new(2, Duration::ZERO);
        let real = RealIp::resolve_from(&server.uri(), &policy).await;
        assert_eq!(real, RealIp::Unknown);
    }
}
