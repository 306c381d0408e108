//! Chrome session management
//!
//! Launches and drives individual Chrome instances over CDP. Sessions are
//! configured to look like an ordinary desktop browser: automation switches
//! suppressed, spoofed user agent, patched navigator/WebGL properties, and
//! image loading disabled to keep proxied traffic small.

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::fetch::{
    self, AuthChallengeResponse, AuthChallengeResponseResponse, ContinueRequestParams,
    ContinueWithAuthParams, EventAuthRequired, EventRequestPaused,
};
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, CookieSameSite, SetCookiesParams,
};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::page::{Cookie, PageError, PageSession, SessionFactory};
use crate::proxy::ProxyCredential;

/// How often `wait_for` re-checks the DOM
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Patches applied before any page script runs. Chrome's automation flag
/// removal is handled by command-line switches; these cover the properties
/// that JavaScript fingerprinting probes directly.
const STEALTH_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
Object.defineProperty(navigator, 'platform', { get: () => 'Win32' });
Object.defineProperty(navigator, 'vendor', { get: () => 'Google Inc.' });
window.chrome = window.chrome || { runtime: {} };
const getParameter = WebGLRenderingContext.prototype.getParameter;
WebGLRenderingContext.prototype.getParameter = function (parameter) {
    if (parameter === 37445) return 'Intel Inc.';
    if (parameter === 37446) return 'Intel Iris OpenGL Engine';
    return getParameter.call(this, parameter);
};
"#;

/// Configuration for launching Chrome sessions
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChromeSessionConfig {
    /// Run in headless mode
    pub headless: bool,
    /// Window width
    pub window_width: u32,
    /// Window height
    pub window_height: u32,
    /// Navigation timeout in seconds
    pub nav_timeout_secs: u64,
    /// Spoofed user agent
    pub user_agent: String,
}

impl Default for ChromeSessionConfig {
    fn default() -> Self {
        Self {
            headless: true,
            window_width: 1920,
            window_height: 1080,
            nav_timeout_secs: 60,
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
                         Chrome/102.0.5005.61 Safari/537.36"
                .to_string(),
        }
    }
}

impl ChromeSessionConfig {
    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn nav_timeout(mut self, secs: u64) -> Self {
        self.nav_timeout_secs = secs;
        self
    }
}

/// One live Chrome instance with a single page
pub struct ChromeSession {
    browser: Mutex<Option<Browser>>,
    page: Page,
    nav_timeout: Duration,
}

#[async_trait]
impl PageSession for ChromeSession {
    async fn navigate(&self, url: &str) -> Result<(), PageError> {
        match tokio::time::timeout(self.nav_timeout, self.page.goto(url)).await {
            Err(_) => Err(PageError::Timeout(format!(
                "navigation to {} did not finish within {:?}",
                url, self.nav_timeout
            ))),
            Ok(Err(err)) => Err(PageError::NavigationFailed(err.to_string())),
            Ok(Ok(_)) => Ok(()),
        }
    }

    async fn current_url(&self) -> Result<String, PageError> {
        self.page
            .url()
            .await
            .map_err(|e| PageError::ConnectionLost(e.to_string()))?
            .ok_or_else(|| PageError::ConnectionLost("no current URL".to_string()))
    }

    async fn refresh(&self) -> Result<(), PageError> {
        self.page
            .reload()
            .await
            .map(|_| ())
            .map_err(|e| PageError::Driver(e.to_string()))
    }

    async fn click(&self, selector: &str) -> Result<(), PageError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|e| PageError::ElementNotFound(format!("{}: {}", selector, e)))?;
        element
            .click()
            .await
            .map_err(|e| PageError::Driver(format!("click {}: {}", selector, e)))?;
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), PageError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|e| PageError::ElementNotFound(format!("{}: {}", selector, e)))?;
        element
            .click()
            .await
            .map_err(|e| PageError::Driver(format!("focus {}: {}", selector, e)))?;
        element
            .type_str(text)
            .await
            .map_err(|e| PageError::Driver(format!("type into {}: {}", selector, e)))?;
        Ok(())
    }

    async fn text(&self, selector: &str) -> Result<String, PageError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|e| PageError::ElementNotFound(format!("{}: {}", selector, e)))?;
        let text = element
            .inner_text()
            .await
            .map_err(|e| PageError::Driver(format!("read {}: {}", selector, e)))?;
        Ok(text.unwrap_or_default().trim().to_string())
    }

    async fn count(&self, selector: &str) -> Result<usize, PageError> {
        match self.page.find_elements(selector).await {
            Ok(elements) => Ok(elements.len()),
            // Zero matches surfaces as a lookup error on some targets
            Err(err) if err.to_string().contains("Could not find node") => Ok(0),
            Err(err) => Err(PageError::Driver(err.to_string())),
        }
    }

    async fn wait_for(&self, selector: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.page.find_element(selector).await.is_ok() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn cookies(&self) -> Result<Vec<Cookie>, PageError> {
        let raw = self
            .page
            .get_cookies()
            .await
            .map_err(|e| PageError::Driver(e.to_string()))?;

        let mut cookies = Vec::with_capacity(raw.len());
        for record in raw {
            let value =
                serde_json::to_value(&record).map_err(|e| PageError::Driver(e.to_string()))?;
            cookies.push(Cookie {
                name: value["name"].as_str().unwrap_or_default().to_string(),
                value: value["value"].as_str().unwrap_or_default().to_string(),
                domain: value["domain"].as_str().unwrap_or_default().to_string(),
                path: value["path"].as_str().unwrap_or("/").to_string(),
                secure: value["secure"].as_bool().unwrap_or(false),
                http_only: value["httpOnly"].as_bool().unwrap_or(false),
                same_site: value["sameSite"].as_str().map(str::to_string),
                // -1 marks a session cookie in CDP
                expiry: value["expires"].as_f64().filter(|e| *e > 0.0),
            });
        }
        Ok(cookies)
    }

    async fn set_cookie(&self, cookie: Cookie) -> Result<(), PageError> {
        let mut builder = CookieParam::builder()
            .name(cookie.name)
            .value(cookie.value)
            .path(cookie.path)
            .secure(cookie.secure)
            .http_only(cookie.http_only);
        if !cookie.domain.is_empty() {
            builder = builder.domain(cookie.domain);
        }
        if let Some(same_site) = cookie.same_site.as_deref() {
            let mapped = match same_site {
                "Strict" | "strict" => Some(CookieSameSite::Strict),
                "Lax" | "lax" => Some(CookieSameSite::Lax),
                "None" | "none" => Some(CookieSameSite::None),
                _ => None,
            };
            if let Some(same_site) = mapped {
                builder = builder.same_site(same_site);
            }
        }
        // expiry is intentionally not forwarded: restored cookies must not
        // expire client-side, and live cookies keep their own

        let param = builder
            .build()
            .map_err(PageError::Driver)?;
        self.page
            .execute(SetCookiesParams::new(vec![param]))
            .await
            .map_err(|e| PageError::Driver(e.to_string()))?;
        Ok(())
    }

    async fn quit(&self) -> Result<(), PageError> {
        let mut browser = self.browser.lock().await;
        if let Some(mut browser) = browser.take() {
            if let Err(err) = browser.close().await {
                warn!("graceful browser close failed: {}", err);
            }
            // Grace period for Chrome child processes, then make sure
            tokio::time::sleep(Duration::from_millis(500)).await;
            let _ = browser.kill().await;
            info!("browser session closed");
        }
        Ok(())
    }
}

/// Builds [`ChromeSession`]s with stealth configuration and an optional
/// assigned proxy
pub struct ChromeSessionFactory {
    config: ChromeSessionConfig,
}

impl ChromeSessionFactory {
    pub fn new(config: ChromeSessionConfig) -> Self {
        Self { config }
    }

    /// Answer proxy auth challenges over CDP. Chrome dropped support for
    /// inline credentials in `--proxy-server`, so authenticated proxies get
    /// their credentials through `Fetch.continueWithAuth` instead.
    async fn enable_proxy_auth(page: &Page, proxy: &ProxyCredential) -> Result<(), PageError> {
        let username = proxy.username.clone().unwrap_or_default();
        let password = proxy.password.clone().unwrap_or_default();

        let enable = fetch::EnableParams::builder()
            .handle_auth_requests(true)
            .build();
        page.execute(enable)
            .await
            .map_err(|e| PageError::LaunchFailed(format!("failed to enable auth handling: {}", e)))?;

        let mut auth_events = page
            .event_listener::<EventAuthRequired>()
            .await
            .map_err(|e| PageError::LaunchFailed(e.to_string()))?;
        let auth_page = page.clone();
        tokio::spawn(async move {
            while let Some(event) = auth_events.next().await {
                let response = AuthChallengeResponse::builder()
                    .response(AuthChallengeResponseResponse::ProvideCredentials)
                    .username(username.clone())
                    .password(password.clone())
                    .build();
                let response = match response {
                    Ok(response) => response,
                    Err(err) => {
                        warn!("could not build auth challenge response: {}", err);
                        continue;
                    }
                };
                let params = ContinueWithAuthParams::builder()
                    .request_id(event.request_id.clone())
                    .auth_challenge_response(response)
                    .build();
                match params {
                    Ok(params) => {
                        if let Err(err) = auth_page.execute(params).await {
                            warn!("proxy auth continuation failed: {}", err);
                        }
                    }
                    Err(err) => warn!("could not build auth continuation: {}", err),
                }
            }
        });

        // With auth handling enabled every request pauses at the Fetch
        // stage and must be explicitly continued
        let mut paused_events = page
            .event_listener::<EventRequestPaused>()
            .await
            .map_err(|e| PageError::LaunchFailed(e.to_string()))?;
        let paused_page = page.clone();
        tokio::spawn(async move {
            while let Some(event) = paused_events.next().await {
                let params = ContinueRequestParams::builder()
                    .request_id(event.request_id.clone())
                    .build();
                match params {
                    Ok(params) => {
                        if let Err(err) = paused_page.execute(params).await {
                            debug!("request continuation failed: {}", err);
                        }
                    }
                    Err(err) => debug!("could not build request continuation: {}", err),
                }
            }
        });

        Ok(())
    }
}

#[async_trait]
impl SessionFactory for ChromeSessionFactory {
    type Session = ChromeSession;

    async fn create(&self, proxy: Option<&ProxyCredential>) -> Result<ChromeSession, PageError> {
        let data_dir = std::env::temp_dir()
            .join("fare-scraper")
            .join("browser-data")
            .join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&data_dir)
            .map_err(|e| PageError::LaunchFailed(format!("user data dir: {}", e)))?;

        let mut builder = BrowserConfig::builder()
            .window_size(self.config.window_width, self.config.window_height)
            .user_data_dir(&data_dir)
            .arg("--blink-settings=imagesEnabled=false")
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--exclude-switches=enable-automation")
            .arg("--disable-automation")
            .arg("--disable-infobars")
            .arg("--no-default-browser-check")
            .arg("--start-maximized")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-browser-side-navigation")
            .arg("--disable-gpu")
            .arg(format!("--user-agent={}", self.config.user_agent));

        if self.config.headless {
            builder = builder.arg("--headless=new");
        } else {
            builder = builder.with_head();
        }

        if let Some(proxy) = proxy {
            builder = builder.arg(format!("--proxy-server={}", proxy.server()));
        }

        let browser_config = builder.build().map_err(PageError::LaunchFailed)?;

        info!("launching browser (headless: {})", self.config.headless);
        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| PageError::LaunchFailed(e.to_string()))?;

        // The handler must be polled for the browser connection to make
        // progress; it ends when Chrome disconnects
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                debug!("browser event: {:?}", event);
            }
            debug!("browser event handler ended");
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| PageError::LaunchFailed(e.to_string()))?;

        let stealth = AddScriptToEvaluateOnNewDocumentParams::builder()
            .source(STEALTH_SCRIPT)
            .build()
            .map_err(PageError::LaunchFailed)?;
        page.execute(stealth)
            .await
            .map_err(|e| PageError::LaunchFailed(format!("stealth injection: {}", e)))?;

        if let Some(proxy) = proxy {
            if proxy.has_auth() {
                Self::enable_proxy_auth(&page, proxy).await?;
            }
        }

        Ok(ChromeSession {
            browser: Mutex::new(Some(browser)),
            page,
            nav_timeout: Duration::from_secs(self.config.nav_timeout_secs),
        })
    }
}
