//! Proxy credential parsing
//!
//! Credentials come from configuration as colon-delimited strings, either
//! `host:port` or `host:port:username:password`.

use serde::{Deserialize, Serialize};

use super::ProxyError;

/// A single upstream proxy, immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyCredential {
    pub host: String,
    pub port: u16,
    /// Present only for authenticated proxies (4-field form)
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyCredential {
    /// Parse a colon-delimited credential. Exactly 2 fields (`host:port`) or
    /// 4 fields (`host:port:username:password`) are accepted; anything else
    /// is a configuration error.
    pub fn parse(raw: &str) -> Result<Self, ProxyError> {
        let fields: Vec<&str> = raw.split(':').collect();

        let (host, port, username, password) = match fields.as_slice() {
            [host, port] => (*host, *port, None, None),
            [host, port, username, password] => {
                (*host, *port, Some((*username).to_string()), Some((*password).to_string()))
            }
            _ => {
                return Err(ProxyError::Config(format!(
                    "invalid proxy '{}': expected host:port or host:port:username:password",
                    raw
                )))
            }
        };

        let port: u16 = port.parse().map_err(|_| {
            ProxyError::Config(format!("invalid proxy '{}': port '{}' is not a number", raw, port))
        })?;

        Ok(Self {
            host: host.to_string(),
            port,
            username,
            password,
        })
    }

    /// Value for Chrome's `--proxy-server` flag. Chrome does not accept
    /// inline credentials, so this is always bare `host:port`; auth is
    /// supplied separately over CDP.
    pub fn server(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether this proxy carries username/password auth
    pub fn has_auth(&self) -> bool {
        self.username.is_some()
    }
}

// Display never includes credentials so proxies are safe to log
impl std::fmt::Display for ProxyCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
