use crate::backend::query_with_retry;
use crate::backend::PriceSource;
use crate::custom::CustomPrices;
use crate::CoinCap;
use crate::CoinDesk;
use crate::FiatBackend;
use crate::FiatError;
use crate::Granularity;
use crate::Price;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal::RoundingStrategy;
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

/// Millisatoshis per bitcoin, the divisor for msat-to-fiat conversion.
const MSAT_PER_BTC: u64 = 100_000_000_000;

/// A request to make prices available for a report window.
#[derive(Debug, Clone)]
pub struct PriceRequest {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
    pub backend: FiatBackend,
    /// Overrides the automatic granularity selection when set.
    pub granularity: Option<Granularity>,
    /// Price points for [`FiatBackend::Custom`]; ignored otherwise.
    pub custom_prices: Vec<Price>,
}

type SeriesCell = Arc<OnceCell<Result<Arc<PriceSeries>, FiatError>>>;

/// Process-wide price store, shared across report requests.
///
/// Identical concurrent population requests coalesce: one backend fetch is
/// issued per (backend, granularity, window) key and every waiter observes
/// the same outcome. Failed fetches are evicted so a later report can try
/// again.
pub struct PriceCache {
    client: reqwest::Client,
    series: Mutex<HashMap<CacheKey, SeriesCell>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    backend: FiatBackend,
    granularity: Granularity,
    start: i64,
    end: i64,
}

impl Default for PriceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PriceCache {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            series: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch (or reuse) the price series covering the request window.
    pub async fn populate(
        &self,
        request: &PriceRequest,
        cancel: &CancellationToken,
    ) -> Result<Arc<PriceSeries>, FiatError> {
        if request.start > request.end {
            return Err(FiatError::InvalidRequest(
                "price window start is after its end".to_string(),
            ));
        }

        let granularity = request
            .granularity
            .unwrap_or_else(|| request.backend.best_granularity(request.end - request.start));

        match request.backend {
            FiatBackend::CoinCap => {
                let source = CoinCap::new(self.client.clone());
                self.populate_with_source(request, granularity, &source, cancel)
                    .await
            }
            FiatBackend::CoinDesk => {
                let source = CoinDesk::new(self.client.clone());
                self.populate_with_source(request, granularity, &source, cancel)
                    .await
            }
            // Custom prices are request-scoped data, not shared state, so
            // they bypass the cross-report cache entirely.
            FiatBackend::Custom => {
                let source = CustomPrices::new(request.custom_prices.clone());
                let prices = source.query(request.start, request.end, granularity).await?;

                Ok(Arc::new(PriceSeries::new(prices, granularity)?))
            }
        }
    }

    pub(crate) async fn populate_with_source(
        &self,
        request: &PriceRequest,
        granularity: Granularity,
        source: &(dyn PriceSource + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<Arc<PriceSeries>, FiatError> {
        let key = CacheKey {
            backend: request.backend,
            granularity,
            start: request.start.unix_timestamp(),
            end: request.end.unix_timestamp(),
        };

        let cell = self
            .series
            .lock()
            .entry(key.clone())
            .or_default()
            .clone();

        let outcome = cell
            .get_or_init(|| async {
                tracing::info!(
                    backend = %request.backend,
                    %granularity,
                    start = key.start,
                    end = key.end,
                    "Fetching price series"
                );

                let prices =
                    query_with_retry(source, request.start, request.end, granularity, cancel)
                        .await?;

                Ok(Arc::new(PriceSeries::new(prices, granularity)?))
            })
            .await
            .clone();

        if outcome.is_err() {
            let mut series = self.series.lock();
            if series
                .get(&key)
                .map(|stored| Arc::ptr_eq(stored, &cell))
                .unwrap_or(false)
            {
                series.remove(&key);
            }
        }

        outcome
    }
}

/// An ascending, non-empty run of price samples at one granularity.
#[derive(Debug)]
pub struct PriceSeries {
    granularity: Granularity,
    prices: Vec<Price>,
}

impl PriceSeries {
    pub fn new(mut prices: Vec<Price>, granularity: Granularity) -> Result<Self, FiatError> {
        if prices.is_empty() {
            return Err(FiatError::NoPriceData);
        }
        prices.sort_by_key(|price| price.timestamp);

        Ok(Self {
            granularity,
            prices,
        })
    }

    /// The greatest sample at or before `ts`.
    ///
    /// Returns `None` when there is no such sample or when the nearest one
    /// is more than one granularity period old; interpolating across a
    /// bigger gap would be extrapolation, not lookup.
    pub fn price_at(&self, ts: OffsetDateTime) -> Option<&Price> {
        let before = self.prices.partition_point(|price| price.timestamp <= ts);
        let candidate = self.prices[..before].last()?;

        if ts - candidate.timestamp > self.granularity.period() {
            return None;
        }

        Some(candidate)
    }
}

/// Convert a millisatoshi amount at a given BTC price, rounding half-even
/// to the quote currency's minor unit. The result always carries exactly
/// that many decimal places.
pub fn msat_to_fiat(amount_msat: u64, price: &Price) -> Decimal {
    let units = minor_units(&price.currency);
    let mut value = (Decimal::from(amount_msat) * price.price / Decimal::from(MSAT_PER_BTC))
        .round_dp_with_strategy(units, RoundingStrategy::MidpointNearestEven);
    value.rescale(units);

    value
}

fn minor_units(currency: &str) -> u32 {
    match currency {
        "JPY" => 0,
        "BHD" | "KWD" | "OMR" => 3,
        _ => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PriceSource;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    fn price_at(unix: i64, price: Decimal) -> Price {
        Price {
            timestamp: OffsetDateTime::from_unix_timestamp(unix).unwrap(),
            price,
            currency: "USD".to_string(),
        }
    }

    #[test]
    fn price_lookup_selects_the_bracketing_sample() {
        let series = PriceSeries::new(
            vec![
                price_at(3600, dec!(41000)),
                price_at(0, dec!(40000)),
                price_at(7200, dec!(42000)),
            ],
            Granularity::Hour,
        )
        .unwrap();

        let found = series
            .price_at(OffsetDateTime::from_unix_timestamp(3_601).unwrap())
            .unwrap();

        assert_eq!(found.price, dec!(41000));
    }

    #[test]
    fn price_lookup_fails_instead_of_extrapolating() {
        let series =
            PriceSeries::new(vec![price_at(0, dec!(40000))], Granularity::Hour).unwrap();

        // One period past the only sample is still fine.
        assert!(series
            .price_at(OffsetDateTime::from_unix_timestamp(3_600).unwrap())
            .is_some());
        // Beyond that the sample no longer brackets the query.
        assert!(series
            .price_at(OffsetDateTime::from_unix_timestamp(3_601).unwrap())
            .is_none());
        // Queries before the first sample have no bracketing sample at all.
        assert!(series
            .price_at(OffsetDateTime::from_unix_timestamp(-1).unwrap())
            .is_none());
    }

    #[test]
    fn empty_series_are_rejected() {
        assert!(matches!(
            PriceSeries::new(vec![], Granularity::Hour),
            Err(FiatError::NoPriceData)
        ));
    }

    #[test]
    fn msat_conversion_uses_decimal_arithmetic() {
        let price = price_at(0, dec!(40000));

        // 100_000 sat = 0.001 BTC = 40 USD, rendered with two decimals.
        assert_eq!(msat_to_fiat(100_000_000, &price).to_string(), "40.00");

        // Half-even rounding: 0.125 USD rounds down to 0.12.
        let price = price_at(0, dec!(12500));
        assert_eq!(msat_to_fiat(1_000_000, &price), dec!(0.12));
    }

    struct CountingSource {
        calls: AtomicU32,
    }

    #[async_trait]
    impl PriceSource for CountingSource {
        async fn query(
            &self,
            start: OffsetDateTime,
            _end: OffsetDateTime,
            _granularity: Granularity,
        ) -> Result<Vec<Price>, FiatError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;

            Ok(vec![Price {
                timestamp: start,
                price: dec!(40000),
                currency: "USD".to_string(),
            }])
        }
    }

    #[tokio::test]
    async fn identical_concurrent_queries_coalesce() {
        let cache = PriceCache::new();
        let source = CountingSource {
            calls: AtomicU32::new(0),
        };
        let request = PriceRequest {
            start: OffsetDateTime::from_unix_timestamp(0).unwrap(),
            end: OffsetDateTime::from_unix_timestamp(3_600).unwrap(),
            backend: FiatBackend::CoinCap,
            granularity: None,
            custom_prices: vec![],
        };
        let cancel = CancellationToken::new();

        let (first, second) = tokio::join!(
            cache.populate_with_source(&request, Granularity::Hour, &source, &cancel),
            cache.populate_with_source(&request, Granularity::Hour, &source, &cancel),
        );

        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_population_is_evicted_for_retry() {
        struct FailingSource;

        #[async_trait]
        impl PriceSource for FailingSource {
            async fn query(
                &self,
                _start: OffsetDateTime,
                _end: OffsetDateTime,
                _granularity: Granularity,
            ) -> Result<Vec<Price>, FiatError> {
                Err(FiatError::NoPriceData)
            }
        }

        let cache = PriceCache::new();
        let request = PriceRequest {
            start: OffsetDateTime::from_unix_timestamp(0).unwrap(),
            end: OffsetDateTime::from_unix_timestamp(3_600).unwrap(),
            backend: FiatBackend::CoinCap,
            granularity: None,
            custom_prices: vec![],
        };
        let cancel = CancellationToken::new();

        let error = cache
            .populate_with_source(&request, Granularity::Hour, &FailingSource, &cancel)
            .await
            .unwrap_err();
        assert_eq!(error, FiatError::NoPriceData);

        // The failure was not pinned; a healthy source succeeds afterwards.
        let source = CountingSource {
            calls: AtomicU32::new(0),
        };
        let series = cache
            .populate_with_source(&request, Granularity::Hour, &source, &cancel)
            .await;
        assert!(series.is_ok());
    }
}
