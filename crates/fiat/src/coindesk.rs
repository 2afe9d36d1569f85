use crate::backend::PriceSource;
use crate::FiatBackend;
use crate::FiatError;
use crate::Granularity;
use crate::Price;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::Date;
use time::OffsetDateTime;

const API_URL: &str = "https://api.coindesk.com/v1/bpi/historical/close.json";

const CURRENCY: &str = "USD";

const DATE_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");

/// Client for the daily price index API. It serves one closing price per
/// day with no limit on how far back the series reaches.
pub struct CoinDesk {
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct IndexResponse {
    /// Closing price per `YYYY-MM-DD` date. A BTreeMap keeps the series
    /// ordered by date without an extra sort.
    bpi: BTreeMap<String, Decimal>,
}

impl CoinDesk {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn parse_sample(date: &str, price: Decimal) -> Result<Price, FiatError> {
    let date = Date::parse(date, DATE_FORMAT)
        .map_err(|e| FiatError::Parse(format!("bad sample date {date}: {e}")))?;

    Ok(Price {
        timestamp: date.midnight().assume_utc(),
        price,
        currency: CURRENCY.to_string(),
    })
}

#[async_trait]
impl PriceSource for CoinDesk {
    async fn query(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
        granularity: Granularity,
    ) -> Result<Vec<Price>, FiatError> {
        if granularity != Granularity::Day {
            return Err(FiatError::UnsupportedGranularity {
                backend: FiatBackend::CoinDesk,
                granularity,
            });
        }

        // Widen the window by a day on each side so that the series always
        // brackets the report window even when it starts mid-day.
        let query_start = start.date().previous_day().unwrap_or_else(|| start.date());
        let query_end = end.date().next_day().unwrap_or_else(|| end.date());

        let url = format!(
            "{API_URL}?start={}&end={}",
            query_start
                .format(DATE_FORMAT)
                .expect("well-formed date format"),
            query_end
                .format(DATE_FORMAT)
                .expect("well-formed date format"),
        );

        tracing::debug!(%url, "Querying daily price index");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| FiatError::Http(e.to_string()))?;

        let body: IndexResponse = response
            .json()
            .await
            .map_err(|e| FiatError::Http(e.to_string()))?;

        body.bpi
            .into_iter()
            .map(|(date, price)| parse_sample(&date, price))
            .collect()
    }
}
