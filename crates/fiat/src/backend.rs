use crate::FiatError;
use crate::Granularity;
use crate::Price;
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

/// Number of times a failing backend query is attempted before giving up.
const MAX_ATTEMPTS: u32 = 3;

/// Backoff before the second attempt; doubled for every further attempt.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Jitter applied to every backoff interval, in percent.
const BACKOFF_JITTER_PERCENT: u64 = 20;

/// A source of historical BTC price samples.
#[async_trait]
pub trait PriceSource {
    /// Fetch the price samples covering `[start, end]` at `granularity`,
    /// sorted ascending by timestamp.
    async fn query(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
        granularity: Granularity,
    ) -> Result<Vec<Price>, FiatError>;
}

/// Run a backend query, retrying network failures with exponential backoff.
///
/// Only [`FiatError::Http`] is considered retryable; anything else fails the
/// first time it occurs. The backoff wait races against `cancel` so that a
/// shutdown interrupts the retry loop immediately.
pub(crate) async fn query_with_retry(
    source: &(dyn PriceSource + Send + Sync),
    start: OffsetDateTime,
    end: OffsetDateTime,
    granularity: Granularity,
    cancel: &CancellationToken,
) -> Result<Vec<Price>, FiatError> {
    let mut backoff = INITIAL_BACKOFF;
    let mut last = String::new();

    for attempt in 1..=MAX_ATTEMPTS {
        if cancel.is_cancelled() {
            return Err(FiatError::ShuttingDown);
        }

        match source.query(start, end, granularity).await {
            Ok(prices) => return Ok(prices),
            Err(FiatError::Http(error)) => {
                tracing::warn!(attempt, %error, "Price backend query failed");
                last = error;
            }
            Err(error) => return Err(error),
        }

        if attempt < MAX_ATTEMPTS {
            tokio::select! {
                _ = cancel.cancelled() => return Err(FiatError::ShuttingDown),
                _ = tokio::time::sleep(jittered(backoff)) => {}
            }
            backoff *= 2;
        }
    }

    Err(FiatError::RetriesFailed {
        attempts: MAX_ATTEMPTS,
        last,
    })
}

/// Spread a backoff interval by +-20% so that concurrent reports do not
/// hammer a recovering backend in lockstep.
fn jittered(backoff: Duration) -> Duration {
    let millis = backoff.as_millis() as u64;
    let spread = millis * BACKOFF_JITTER_PERCENT / 100;
    let jittered = millis - spread + rand::thread_rng().gen_range(0..=spread * 2);

    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    /// Fails with an HTTP error `failures` times, then succeeds.
    struct FlakySource {
        failures: Mutex<u32>,
        calls: Mutex<u32>,
    }

    impl FlakySource {
        fn new(failures: u32) -> Self {
            Self {
                failures: Mutex::new(failures),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl PriceSource for FlakySource {
        async fn query(
            &self,
            start: OffsetDateTime,
            _end: OffsetDateTime,
            _granularity: Granularity,
        ) -> Result<Vec<Price>, FiatError> {
            *self.calls.lock() += 1;

            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(FiatError::Http("connection reset".to_string()));
            }

            Ok(vec![Price {
                timestamp: start,
                price: dec!(40000),
                currency: "USD".to_string(),
            }])
        }
    }

    fn window() -> (OffsetDateTime, OffsetDateTime) {
        let start = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        (start, start + time::Duration::hours(1))
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures() {
        let source = FlakySource::new(2);
        let (start, end) = window();

        let prices = query_with_retry(
            &source,
            start,
            end,
            Granularity::Hour,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(prices.len(), 1);
        assert_eq!(*source.calls.lock(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_three_attempts() {
        let source = FlakySource::new(u32::MAX);
        let (start, end) = window();

        let error = query_with_retry(
            &source,
            start,
            end,
            Granularity::Hour,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(error, FiatError::RetriesFailed { attempts: 3, .. }));
        assert_eq!(*source.calls.lock(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn validation_errors_are_not_retried() {
        struct BadRequestSource;

        #[async_trait]
        impl PriceSource for BadRequestSource {
            async fn query(
                &self,
                _start: OffsetDateTime,
                _end: OffsetDateTime,
                _granularity: Granularity,
            ) -> Result<Vec<Price>, FiatError> {
                Err(FiatError::Parse("unexpected body".to_string()))
            }
        }

        let (start, end) = window();
        let error = query_with_retry(
            &BadRequestSource,
            start,
            end,
            Granularity::Hour,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(error, FiatError::Parse(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_backoff() {
        let source = FlakySource::new(u32::MAX);
        let (start, end) = window();
        let cancel = CancellationToken::new();

        let cancel_task = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_task.cancel();
        });

        let error = query_with_retry(&source, start, end, Granularity::Hour, &cancel)
            .await
            .unwrap_err();

        assert_eq!(error, FiatError::ShuttingDown);
        assert_eq!(*source.calls.lock(), 1);
    }
}
