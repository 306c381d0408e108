//! Quote persistence
//!
//! Extracted quotes leave the core through the [`QuoteSink`] trait. The
//! shipped implementation appends to one CSV file per ride name under a
//! fixed directory, writing the header the first time a file is created.

use std::borrow::Cow;
use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::extract::RideQuote;

/// Header row written once per file
pub const CSV_HEADER: &str =
    "date,time,trip_estimate,base_fare,minimum_fare,plus_per_minute,plus_per_kilometer,wait_charge";

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Receives each completed quote, keyed by ride name
#[async_trait]
pub trait QuoteSink: Send + Sync {
    async fn record(&self, quote: &RideQuote) -> Result<(), SinkError>;
}

/// Append-only CSV files, one per ride name
pub struct CsvSink {
    dir: PathBuf,
}

impl CsvSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_for(&self, ride_name: &str) -> PathBuf {
        // Ride names come off the page; keep them path-safe
        let safe: String = ride_name
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == ' ' || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let safe = safe.trim();
        let name = if safe.is_empty() { "unnamed" } else { safe };
        self.dir.join(format!("{}.csv", name))
    }

    fn escape(field: &str) -> Cow<'_, str> {
        if field.contains([',', '"', '\n', '\r']) {
            Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
        } else {
            Cow::Borrowed(field)
        }
    }
}

#[async_trait]
impl QuoteSink for CsvSink {
    async fn record(&self, quote: &RideQuote) -> Result<(), SinkError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.file_for(&quote.ride_name);

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        if file.metadata()?.len() == 0 {
            writeln!(file, "{}", CSV_HEADER)?;
        }
        writeln!(
            file,
            "{},{},{},{},{},{},{},{}",
            Self::escape(&quote.date),
            Self::escape(&quote.time),
            Self::escape(&quote.estimate),
            Self::escape(&quote.base_fare),
            Self::escape(&quote.minimum_fare),
            Self::escape(&quote.per_minute),
            Self::escape(&quote.per_kilometer),
            Self::escape(&quote.wait_charge),
        )?;

        debug!("recorded {} quote to {}", quote.ride_name, path.display());
        Ok(())
    }
}
