//! Historical bitcoin price lookups for report generation.
//!
//! A process-wide [`PriceCache`] resolves arbitrary timestamps to the
//! closest known BTC price. Prices come from one of several backends: two
//! public HTTP APIs with different historical resolutions, or a
//! user-supplied set of custom price points. Backend queries are retried
//! with exponential backoff and observe a shutdown signal.

use rust_decimal::Decimal;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use time::Duration;
use time::OffsetDateTime;

mod backend;
mod cache;
mod coincap;
mod coindesk;
mod custom;
mod granularity;

pub use backend::PriceSource;
pub use cache::msat_to_fiat;
pub use cache::PriceCache;
pub use cache::PriceRequest;
pub use cache::PriceSeries;
pub use coincap::CoinCap;
pub use coindesk::CoinDesk;
pub use custom::parse_price_csv;
pub use custom::CustomPrices;
pub use granularity::Granularity;

/// A single BTC price sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    #[serde(with = "time::serde::timestamp")]
    pub timestamp: OffsetDateTime,
    pub price: Decimal,
    /// Quote currency, e.g. `USD`.
    pub currency: String,
}

/// The price backends we can query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FiatBackend {
    #[default]
    CoinCap,
    CoinDesk,
    /// Price points supplied by the caller, e.g. parsed from a CSV file.
    Custom,
}

impl FiatBackend {
    /// The finest granularity whose historical horizon covers `duration`.
    ///
    /// The aggregator backend limits how far back each resolution reaches;
    /// the daily index has no such limit and neither do custom prices.
    pub fn best_granularity(&self, duration: Duration) -> Granularity {
        match self {
            FiatBackend::CoinCap => coincap::best_granularity(duration),
            FiatBackend::CoinDesk | FiatBackend::Custom => Granularity::Day,
        }
    }
}

impl fmt::Display for FiatBackend {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            FiatBackend::CoinCap => "coincap",
            FiatBackend::CoinDesk => "coindesk",
            FiatBackend::Custom => "custom",
        };
        s.fmt(f)
    }
}

impl FromStr for FiatBackend {
    type Err = FiatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" | "coincap" => Ok(FiatBackend::CoinCap),
            "coindesk" => Ok(FiatBackend::CoinDesk),
            "custom" => Ok(FiatBackend::Custom),
            other => Err(FiatError::InvalidRequest(format!(
                "unknown fiat backend: {other}"
            ))),
        }
    }
}

/// Errors surfaced by the price subsystem.
///
/// Cloneable so that coalesced cache queries can share one outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FiatError {
    #[error("invalid price request: {0}")]
    InvalidRequest(String),
    #[error("custom prices must include a sample at or before the report start")]
    MissingEarliestPrice,
    #[error("backend returned no price data for the requested window")]
    NoPriceData,
    #[error("granularity {granularity} is not supported by {backend}")]
    UnsupportedGranularity {
        backend: FiatBackend,
        granularity: Granularity,
    },
    #[error("price query failed: {0}")]
    Http(String),
    #[error("failed to parse backend response: {0}")]
    Parse(String),
    #[error("price backend query failed after {attempts} attempts: {last}")]
    RetriesFailed { attempts: u32, last: String },
    #[error("shutting down")]
    ShuttingDown,
}
