use crate::backend::PriceSource;
use crate::FiatError;
use crate::Granularity;
use crate::Price;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::io::Read;
use std::str::FromStr;
use time::OffsetDateTime;

/// Price points supplied by the user instead of fetched from an API.
pub struct CustomPrices {
    prices: Vec<Price>,
}

impl CustomPrices {
    pub fn new(prices: Vec<Price>) -> Self {
        Self { prices }
    }
}

#[async_trait]
impl PriceSource for CustomPrices {
    /// Filter the supplied prices down to the report window.
    ///
    /// The caller must provide at least one sample at or before the window
    /// start so that every entry timestamp has a bracketing price. Samples
    /// after the window end are dropped.
    async fn query(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
        _granularity: Granularity,
    ) -> Result<Vec<Price>, FiatError> {
        if !self.prices.iter().any(|price| price.timestamp <= start) {
            return Err(FiatError::MissingEarliestPrice);
        }

        let mut prices: Vec<Price> = self
            .prices
            .iter()
            .filter(|price| price.timestamp <= end)
            .cloned()
            .collect();
        prices.sort_by_key(|price| price.timestamp);

        Ok(prices)
    }
}

/// Parse a `timestamp,price` CSV into price points.
///
/// Timestamps are unix seconds; the quote currency is supplied out-of-band
/// because the file format does not carry it.
pub fn parse_price_csv(input: impl Read, currency: &str) -> Result<Vec<Price>, FiatError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_reader(input);

    let mut prices = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| FiatError::Parse(format!("bad csv record: {e}")))?;
        if record.len() != 2 {
            return Err(FiatError::Parse(format!(
                "expected timestamp,price but got {} fields",
                record.len()
            )));
        }

        let timestamp = i64::from_str(&record[0])
            .ok()
            .and_then(|unix| OffsetDateTime::from_unix_timestamp(unix).ok())
            .ok_or_else(|| FiatError::Parse(format!("bad timestamp: {}", &record[0])))?;
        let price = Decimal::from_str(&record[1])
            .map_err(|e| FiatError::Parse(format!("bad price {}: {e}", &record[1])))?;

        prices.push(Price {
            timestamp,
            price,
            currency: currency.to_string(),
        });
    }

    if prices.is_empty() {
        return Err(FiatError::InvalidRequest(
            "custom price file contains no samples".to_string(),
        ));
    }

    Ok(prices)
}
