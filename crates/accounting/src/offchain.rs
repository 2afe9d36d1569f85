use crate::entry::fee_reference;
use crate::entry::forward_reference;
use crate::entry::payment_reference;
use crate::entry::receipt_reference;
use crate::entry::Entry;
use crate::entry::EntryKind;
use crate::report::PagingConfig;
use crate::source::Forward;
use crate::source::Invoice;
use crate::source::NodeEvents;
use crate::source::PagedQuery;
use crate::source::Payment;
use crate::AuditError;
use anyhow::bail;
use anyhow::Result;
use lightning::ln::PaymentHash;
use std::collections::HashMap;
use std::collections::HashSet;
use std::future::Future;
use time::OffsetDateTime;

/// Classify the node's off-chain activity within `[start, end]`.
///
/// Payments whose route ends at our own node and which settle one of our
/// own invoices are circular: the payment, its fee and the receipt are
/// emitted as circular entries so they net out of revenue.
pub(crate) async fn classify_offchain(
    node: &dyn NodeEvents,
    start: OffsetDateTime,
    end: OffsetDateTime,
    paging: &PagingConfig,
) -> Result<Vec<Entry>, AuditError> {
    let (our_pubkey, invoices, payments, forwards) = futures::try_join!(
        node.node_pubkey(),
        fetch_all(paging.max_invoices, |query| node.invoices(query)),
        fetch_all(paging.max_payments, |query| node.payments(query)),
        fetch_all(paging.max_forwards, |query| node.forwards(start, end, query)),
    )
    .map_err(AuditError::Node)?;

    tracing::debug!(
        invoices = invoices.len(),
        payments = payments.len(),
        forwards = forwards.len(),
        "Classifying off-chain activity"
    );

    let invoices: Vec<&Invoice> = invoices
        .iter()
        .filter(|invoice| invoice.settled_at >= start && invoice.settled_at <= end)
        .collect();
    let payments: Vec<&Payment> = payments
        .iter()
        .filter(|payment| payment.timestamp >= start && payment.timestamp <= end)
        .collect();

    let invoices_by_hash: HashMap<PaymentHash, &Invoice> = invoices
        .iter()
        .map(|invoice| (invoice.payment_hash, *invoice))
        .collect();

    let mut circular_hashes: HashSet<PaymentHash> = HashSet::new();
    let mut entries = Vec::new();

    for payment in &payments {
        let paired_invoice = if payment.destination == Some(our_pubkey) {
            invoices_by_hash.get(&payment.payment_hash).copied()
        } else {
            None
        };

        // Circular entries carry the settled invoice's memo so that all
        // three legs of a self-payment categorize alike.
        let (kind, fee_kind, note) = match paired_invoice {
            Some(invoice) => {
                circular_hashes.insert(payment.payment_hash);
                (
                    EntryKind::CircularPayment,
                    EntryKind::CircularPaymentFee,
                    invoice.memo.clone(),
                )
            }
            None => (EntryKind::Payment, EntryKind::PaymentFee, String::new()),
        };

        let reference = payment_reference(payment.sequence_number, &payment.preimage);
        entries.push(entry(
            payment.timestamp,
            kind,
            payment.value_msat,
            false,
            reference.clone(),
            note.clone(),
        ));
        entries.push(entry(
            payment.timestamp,
            fee_kind,
            payment.fee_msat,
            false,
            fee_reference(&reference),
            note,
        ));
    }

    for invoice in &invoices {
        let kind = if circular_hashes.contains(&invoice.payment_hash) {
            EntryKind::CircularReceipt
        } else {
            EntryKind::Receipt
        };

        entries.push(entry(
            invoice.settled_at,
            kind,
            invoice.amount_paid_msat,
            true,
            receipt_reference(&invoice.preimage),
            invoice.memo.clone(),
        ));
    }

    for forward in &forwards {
        if forward.timestamp < start || forward.timestamp > end {
            continue;
        }

        let reference = forward_reference(forward.timestamp, forward.channel_in, forward.channel_out);
        // The forward itself is informational: the amounts on its two legs
        // differ by exactly the fee we earned.
        entries.push(entry(
            forward.timestamp,
            EntryKind::Forward,
            0,
            true,
            reference.clone(),
            String::new(),
        ));
        entries.push(entry(
            forward.timestamp,
            EntryKind::ForwardFee,
            forward.fee_msat,
            true,
            fee_reference(&reference),
            String::new(),
        ));
    }

    Ok(entries)
}

/// Drain a paged node query. A short page ends the sequence.
async fn fetch_all<T, F, Fut>(page_size: u64, fetch: F) -> Result<Vec<T>>
where
    F: Fn(PagedQuery) -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
{
    // A zero-sized page could never come back short, so the loop below
    // would spin forever.
    if page_size == 0 {
        bail!("page size must be positive");
    }

    let mut events = Vec::new();
    let mut offset = 0;

    loop {
        let page = fetch(PagedQuery {
            offset,
            max_events: page_size,
        })
        .await?;
        let count = page.len() as u64;
        events.extend(page);

        if count < page_size {
            return Ok(events);
        }
        offset += count;
    }
}

fn entry(
    timestamp: OffsetDateTime,
    kind: EntryKind,
    amount_msat: u64,
    credit: bool,
    reference: String,
    note: String,
) -> Entry {
    Entry {
        timestamp,
        kind,
        amount_msat,
        credit,
        on_chain: false,
        txid: String::new(),
        reference,
        note,
        fiat_value: String::new(),
        btc_price: None,
        category: String::new(),
    }
}
