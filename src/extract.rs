//! Fare extraction
//!
//! Opens a deep link for a pickup/drop pair, walks the ride-type list, and
//! pulls the fare breakdown out of the detail panel entry by entry. A field
//! that cannot be read degrades to a sentinel value instead of sinking the
//! whole record; a missing list or a logged-out session is fatal.

use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cookies::CookieError;
use crate::output::{QuoteSink, SinkError};
use crate::page::{PageError, PageSession, SessionFactory};
use crate::session::{SessionError, SessionManager};

/// Placeholder recorded for any field that could not be extracted
pub const SENTINEL: &str = "N/A";

mod selectors {
    pub const LOGGED_IN_MARKER: &str = "._css-ipKQbc";
    pub const RIDE_LIST: &str = "ul[class*='css-']";
    pub const RIDE_ITEM: &str = "ul[class*='css-'] li";
    pub const RIDE_NAME: &str = "h6._css-eMXiub:nth-child(1)";
    pub const RIDE_ESTIMATE: &str = "h6._css-eMXiub:nth-child(2)";
    pub const BASE_FARE: &str = "div._css-kROmvp:nth-child(2) > p:nth-child(2)";
    pub const MINIMUM_FARE: &str = "div._css-kROmvp:nth-child(3) > p:nth-child(2)";
    pub const PLUS_PER_MINUTE: &str = "div._css-kROmvp:nth-child(4) > p:nth-child(2)";
    pub const PLUS_PER_KILOMETER: &str = "div._css-kROmvp:nth-child(5) > p:nth-child(2)";
    pub const WAIT_CHARGE: &str = "._css-lcvSVT";
}

/// Geographic point for the deep link
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// One extracted fare record. Produced fresh per ride type and handed to
/// the sink immediately.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RideQuote {
    pub ride_name: String,
    pub estimate: String,
    pub base_fare: String,
    pub minimum_fare: String,
    pub per_minute: String,
    pub per_kilometer: String,
    pub wait_charge: String,
    pub date: String,
    pub time: String,
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("not logged in, authenticate first")]
    NotAuthenticated,

    #[error("no ride types found")]
    NoRideTypes,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Page(#[from] PageError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Cookies(#[from] CookieError),
}

/// Walks the ride list and extracts fare breakdowns
pub struct FareFlow {
    wait_charge_pattern: Regex,
    list_wait: Duration,
    login_wait: Duration,
    /// Pause after selecting a ride type so the detail panel re-renders
    settle_delay: Duration,
}

impl Default for FareFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl FareFlow {
    pub fn new() -> Self {
        Self {
            wait_charge_pattern: Regex::new(r"EGP (\d+\.\d+)")
                .expect("wait-charge pattern is valid"),
            list_wait: Duration::from_secs(5),
            login_wait: Duration::from_secs(10),
            settle_delay: Duration::from_secs(1),
        }
    }

    /// Deep link with pickup/drop coordinates embedded as URL-encoded
    /// JSON-like structures
    pub fn deep_link(pickup: Coordinates, drop: Coordinates) -> String {
        let drop_json = format!(
            r#"{{"latitude":{},"longitude":{}}}"#,
            drop.latitude, drop.longitude
        );
        let pickup_json = format!(
            r#"{{"latitude":{},"longitude":{}}}"#,
            pickup.latitude, pickup.longitude
        );
        format!(
            "https://m.uber.com/looking?drop[0]={}&pickup={}",
            urlencoding::encode(&drop_json),
            urlencoding::encode(&pickup_json)
        )
    }

    /// Extract one quote per ride type and hand each to `sink`.
    ///
    /// Never re-authenticates: a logged-out session is reported as
    /// [`ExtractError::NotAuthenticated`] and compensation is the caller's
    /// decision.
    pub async fn collect<F: SessionFactory, S: QuoteSink>(
        &self,
        manager: &SessionManager<F>,
        sink: &S,
        pickup: Coordinates,
        drop: Coordinates,
    ) -> Result<Vec<RideQuote>, ExtractError> {
        info!(
            "collecting fares: pickup ({}, {}) -> drop ({}, {})",
            pickup.latitude, pickup.longitude, drop.latitude, drop.longitude
        );

        let link = Self::deep_link(pickup, drop);
        manager.navigate(&link).await?;

        let quotes = {
            let page = manager.page().await;

            if !page
                .wait_for(selectors::LOGGED_IN_MARKER, self.login_wait)
                .await
            {
                return Err(ExtractError::NotAuthenticated);
            }
            if !page.wait_for(selectors::RIDE_LIST, self.list_wait).await {
                return Err(ExtractError::NoRideTypes);
            }

            let entries = page.count(selectors::RIDE_ITEM).await?;
            if entries == 0 {
                return Err(ExtractError::NoRideTypes);
            }
            info!("found {} ride types", entries);

            let mut quotes = Vec::with_capacity(entries);
            for index in 1..=entries {
                let quote = self.extract_entry(&*page, index).await;
                info!("extracted quote for {}", quote.ride_name);
                sink.record(&quote).await?;
                quotes.push(quote);
            }
            quotes
        };

        manager.save_cookies().await?;
        Ok(quotes)
    }

    async fn extract_entry<P: PageSession>(&self, page: &P, index: usize) -> RideQuote {
        let item = format!("{}:nth-of-type({})", selectors::RIDE_ITEM, index);
        if let Err(err) = page.click(&item).await {
            warn!("could not select ride type {}: {}", index, err);
        }
        // Let the detail panel re-render before reading from it
        tokio::time::sleep(self.settle_delay).await;

        let now = chrono::Local::now();
        RideQuote {
            ride_name: self.field(page, "ride_name", selectors::RIDE_NAME).await,
            estimate: self.field(page, "estimate", selectors::RIDE_ESTIMATE).await,
            base_fare: self.field(page, "base_fare", selectors::BASE_FARE).await,
            minimum_fare: self
                .field(page, "minimum_fare", selectors::MINIMUM_FARE)
                .await,
            per_minute: self
                .field(page, "per_minute", selectors::PLUS_PER_MINUTE)
                .await,
            per_kilometer: self
                .field(page, "per_kilometer", selectors::PLUS_PER_KILOMETER)
                .await,
            wait_charge: self.wait_charge(page).await,
            date: now.format("%Y-%m-%d").to_string(),
            time: now.format("%H:%M:%S").to_string(),
        }
    }

    async fn field<P: PageSession>(&self, page: &P, name: &str, selector: &str) -> String {
        match page.text(selector).await {
            Ok(text) => text,
            Err(err) => {
                warn!("could not extract {} ({}): {}", name, selector, err);
                SENTINEL.to_string()
            }
        }
    }

    /// The wait charge sits inside a free-text element; anything that does
    /// not contain a recognizable amount degrades to the sentinel
    async fn wait_charge<P: PageSession>(&self, page: &P) -> String {
        match page.text(selectors::WAIT_CHARGE).await {
            Ok(text) => match self.wait_charge_pattern.find(&text) {
                Some(found) => found.as_str().to_string(),
                None => {
                    debug!("no wait charge amount in {:?}", text);
                    SENTINEL.to_string()
                }
            },
            Err(err) => {
                warn!("could not extract wait_charge: {}", err);
                SENTINEL.to_string()
            }
        }
    }
}
