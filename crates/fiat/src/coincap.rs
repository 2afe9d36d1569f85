use crate::backend::PriceSource;
use crate::granularity::GRANULARITIES;
use crate::FiatBackend;
use crate::FiatError;
use crate::Granularity;
use crate::Price;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use time::Duration;
use time::OffsetDateTime;

const API_URL: &str = "https://api.coincap.io/v2/assets/bitcoin/history";

/// The aggregator serves all prices quoted in USD.
const CURRENCY: &str = "USD";

/// Client for the aggregator API, which serves bitcoin price history at
/// every supported granularity, each with a limited historical horizon.
pub struct CoinCap {
    client: reqwest::Client,
}

/// How far back the aggregator keeps samples at the given resolution.
/// `None` means unbounded.
fn horizon(granularity: Granularity) -> Option<Duration> {
    match granularity {
        Granularity::Minute => Some(Duration::days(1)),
        Granularity::FiveMinutes => Some(Duration::days(5)),
        Granularity::FifteenMinutes => Some(Duration::days(15)),
        Granularity::HalfHour => Some(Duration::days(30)),
        Granularity::Hour => Some(Duration::days(60)),
        Granularity::SixHours => Some(Duration::days(183)),
        Granularity::TwelveHours => Some(Duration::days(365)),
        Granularity::Day => None,
    }
}

/// The finest granularity whose horizon covers `duration`.
pub(crate) fn best_granularity(duration: Duration) -> Granularity {
    for granularity in GRANULARITIES {
        match horizon(granularity) {
            Some(horizon) if duration <= horizon => return granularity,
            Some(_) => continue,
            None => return granularity,
        }
    }

    Granularity::Day
}

#[derive(Deserialize)]
struct HistoryResponse {
    data: Vec<HistoryPoint>,
}

#[derive(Deserialize)]
struct HistoryPoint {
    #[serde(rename = "priceUsd")]
    price_usd: String,
    /// Sample time in milliseconds since the epoch.
    time: i64,
}

impl CoinCap {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl HistoryPoint {
    fn into_price(self) -> Result<Price, FiatError> {
        let timestamp = OffsetDateTime::from_unix_timestamp(self.time / 1000)
            .map_err(|e| FiatError::Parse(format!("bad sample timestamp {}: {e}", self.time)))?;
        let price = Decimal::from_str(&self.price_usd)
            .map_err(|e| FiatError::Parse(format!("bad price {}: {e}", self.price_usd)))?;

        Ok(Price {
            timestamp,
            price,
            currency: CURRENCY.to_string(),
        })
    }
}

#[async_trait]
impl PriceSource for CoinCap {
    async fn query(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
        granularity: Granularity,
    ) -> Result<Vec<Price>, FiatError> {
        if let Some(horizon) = horizon(granularity) {
            if end - start > horizon {
                return Err(FiatError::UnsupportedGranularity {
                    backend: FiatBackend::CoinCap,
                    granularity,
                });
            }
        }

        let start_ms = start.unix_timestamp() * 1000;
        let end_ms = end.unix_timestamp() * 1000;
        let url = format!(
            "{API_URL}?interval={}&start={start_ms}&end={end_ms}",
            granularity.label()
        );

        tracing::debug!(%url, "Querying aggregator price history");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| FiatError::Http(e.to_string()))?;

        let body: HistoryResponse = response
            .json()
            .await
            .map_err(|e| FiatError::Http(e.to_string()))?;

        body.data
            .into_iter()
            .map(HistoryPoint::into_price)
            .collect()
    }
}
