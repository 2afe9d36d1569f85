use crate::category::CompiledCategories;
use crate::entry::Entry;
use crate::offchain::classify_offchain;
use crate::onchain::classify_onchain;
use crate::source::ChainLookup;
use crate::source::NodeEvents;
use crate::AuditError;
use crate::Category;
use fiat::msat_to_fiat;
use fiat::FiatBackend;
use fiat::FiatError;
use fiat::Granularity;
use fiat::Price;
use fiat::PriceCache;
use fiat::PriceRequest;
use fiat::PriceSeries;
use std::collections::HashSet;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

const DEFAULT_PAGE_SIZE: u64 = 1_000;

/// Page sizes for the node queries that return events in batches. These
/// bound how much a single fetch pulls into memory.
#[derive(Debug, Clone, Copy)]
pub struct PagingConfig {
    pub max_invoices: u64,
    pub max_payments: u64,
    pub max_forwards: u64,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            max_invoices: DEFAULT_PAGE_SIZE,
            max_payments: DEFAULT_PAGE_SIZE,
            max_forwards: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Everything a single report run needs to know.
#[derive(Debug, Clone)]
pub struct ReportRequest {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
    /// Skip fiat conversion entirely.
    pub disable_fiat: bool,
    pub fiat_backend: FiatBackend,
    /// Overrides the automatic granularity selection when set.
    pub granularity: Option<Granularity>,
    /// Price points for [`FiatBackend::Custom`]; ignored otherwise.
    pub custom_prices: Vec<Price>,
    pub categories: Vec<Category>,
    pub paging: PagingConfig,
}

/// The finished ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    /// Sorted ascending by (timestamp, reference).
    pub entries: Vec<Entry>,
    /// False when no chain backend was available and fee entries carry
    /// zero amounts.
    pub fees_complete: bool,
}

/// Generate the audit report for one time window.
///
/// The on-chain classifier, the off-chain classifier and the price-cache
/// population run concurrently and join before the merge. Cancellation
/// discards all partial work; a cancelled report yields no entries.
pub async fn generate_report(
    node: &dyn NodeEvents,
    chain: Option<&dyn ChainLookup>,
    prices: &PriceCache,
    request: &ReportRequest,
    cancel: &CancellationToken,
) -> Result<Report, AuditError> {
    validate(request)?;
    let categories = CompiledCategories::new(&request.categories)?;

    if cancel.is_cancelled() {
        return Err(AuditError::ShuttingDown);
    }

    let work = async {
        tokio::try_join!(
            classify_onchain(node, chain, request.start, request.end),
            classify_offchain(node, request.start, request.end, &request.paging),
            populate_prices(prices, request, cancel),
        )
    };
    let (onchain, offchain, series) = tokio::select! {
        _ = cancel.cancelled() => return Err(AuditError::ShuttingDown),
        joined = work => joined?,
    };

    let mut entries = onchain;
    entries.extend(offchain);
    entries.sort_by(|a, b| {
        (a.timestamp, &a.reference).cmp(&(b.timestamp, &b.reference))
    });

    if let Some(series) = &series {
        assign_fiat(&mut entries, series);
    }

    for entry in &mut entries {
        if let Some(label) = categories.label_for(&entry.note, entry.on_chain) {
            entry.category = label.to_string();
        }
    }

    verify_unique_references(&entries)?;

    tracing::info!(
        entries = entries.len(),
        fees_complete = chain.is_some(),
        "Generated report"
    );

    Ok(Report {
        entries,
        fees_complete: chain.is_some(),
    })
}

fn validate(request: &ReportRequest) -> Result<(), AuditError> {
    if request.start > request.end {
        return Err(AuditError::InvalidInput(
            "report start is after its end".to_string(),
        ));
    }

    let paging = request.paging;
    if paging.max_invoices == 0 || paging.max_payments == 0 || paging.max_forwards == 0 {
        return Err(AuditError::InvalidInput(
            "paging limits must be positive".to_string(),
        ));
    }

    if request.fiat_backend == FiatBackend::Custom && !request.disable_fiat {
        if request.custom_prices.is_empty() {
            return Err(AuditError::InvalidInput(
                "custom fiat backend requires custom prices".to_string(),
            ));
        }
        if !request
            .custom_prices
            .iter()
            .any(|price| price.timestamp <= request.start)
        {
            return Err(AuditError::Fiat(FiatError::MissingEarliestPrice));
        }
    }

    Ok(())
}

async fn populate_prices(
    prices: &PriceCache,
    request: &ReportRequest,
    cancel: &CancellationToken,
) -> Result<Option<Arc<PriceSeries>>, AuditError> {
    if request.disable_fiat {
        return Ok(None);
    }

    let price_request = PriceRequest {
        start: request.start,
        end: request.end,
        backend: request.fiat_backend,
        granularity: request.granularity,
        custom_prices: request.custom_prices.clone(),
    };

    match prices.populate(&price_request, cancel).await {
        Ok(series) => Ok(Some(series)),
        Err(FiatError::ShuttingDown) => Err(AuditError::ShuttingDown),
        Err(error) => Err(AuditError::Fiat(error)),
    }
}

fn assign_fiat(entries: &mut [Entry], series: &PriceSeries) {
    for entry in entries {
        match series.price_at(entry.timestamp) {
            Some(price) => {
                entry.fiat_value = msat_to_fiat(entry.amount_msat, price).to_string();
                entry.btc_price = Some(price.clone());
            }
            None => {
                tracing::debug!(
                    reference = %entry.reference,
                    "No price sample brackets this entry; leaving fiat empty"
                );
            }
        }
    }
}

fn verify_unique_references(entries: &[Entry]) -> Result<(), AuditError> {
    let mut seen = HashSet::with_capacity(entries.len());
    for entry in entries {
        if !seen.insert(entry.reference.as_str()) {
            return Err(AuditError::DuplicateReference(entry.reference.clone()));
        }
    }

    Ok(())
}
