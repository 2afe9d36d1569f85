use crate::entry::fee_reference;
use crate::entry::Entry;
use crate::entry::EntryKind;
use crate::fees::transaction_fee;
use crate::htlc::classify_spend;
use crate::htlc::SpendKind;
use crate::source::ChainLookup;
use crate::source::ChannelClose;
use crate::source::ChannelOpen;
use crate::source::NodeEvents;
use crate::source::WalletTx;
use crate::AuditError;
use bitcoin::Txid;
use std::collections::HashMap;
use time::OffsetDateTime;

pub(crate) const FEE_UNKNOWN_NOTE: &str = "fee unknown - no chain backend";

const UNRECOGNISED_SPEND_NOTE: &str = "unrecognised spend of a closed channel output";

const MSAT_PER_SAT: u64 = 1_000;

/// The role a wallet transaction plays in the ledger. Roles are mutually
/// exclusive and assigned first-match-wins in declaration order: opens,
/// closes, sweeps, receipts, payments.
enum TxRole<'a> {
    Open(&'a ChannelOpen),
    Close(&'a ChannelClose),
    Sweep(SpendKind),
    Receipt { unrecognised_spend: bool },
    Payment { unrecognised_spend: bool },
}

/// Classify the node's on-chain activity within `[start, end]`.
///
/// Without a chain backend, fee entries are still emitted but carry a zero
/// amount and a note; the report is then marked incomplete rather than
/// rejected.
pub(crate) async fn classify_onchain(
    node: &dyn NodeEvents,
    chain: Option<&dyn ChainLookup>,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<Vec<Entry>, AuditError> {
    let (opens, closes, wallet_txs) = futures::try_join!(
        node.channel_opens(start, end),
        node.channel_closes(),
        node.wallet_transactions(start, end),
    )
    .map_err(AuditError::Node)?;

    tracing::debug!(
        opens = opens.len(),
        closes = closes.len(),
        wallet_txs = wallet_txs.len(),
        "Classifying on-chain activity"
    );

    let opens_by_txid: HashMap<Txid, &ChannelOpen> = opens
        .iter()
        .map(|open| (open.funding_txid, open))
        .collect();
    let closes_by_txid: HashMap<Txid, &ChannelClose> = closes
        .iter()
        .map(|close| (close.close_txid, close))
        .collect();

    let mut entries = Vec::new();
    for tx in &wallet_txs {
        if tx.timestamp < start || tx.timestamp > end {
            continue;
        }

        let role = role_of(tx, &opens_by_txid, &closes_by_txid)?;
        append_entries(&mut entries, tx, role, chain).await?;
    }

    Ok(entries)
}

fn role_of<'a>(
    tx: &WalletTx,
    opens_by_txid: &HashMap<Txid, &'a ChannelOpen>,
    closes_by_txid: &HashMap<Txid, &'a ChannelClose>,
) -> Result<TxRole<'a>, AuditError> {
    if let Some(open) = opens_by_txid.get(&tx.txid).copied() {
        return Ok(TxRole::Open(open));
    }
    if let Some(close) = closes_by_txid.get(&tx.txid).copied() {
        return Ok(TxRole::Close(close));
    }

    // A sweep spends an output of a known close transaction with an HTLC
    // witness. A spend of a close output we cannot recognise is NOT
    // treated as a sweep; the transaction falls through and its entry is
    // annotated instead.
    let mut unrecognised_spend = false;
    for input in &tx.tx.input {
        let Some(close) = closes_by_txid.get(&input.previous_output.txid).copied() else {
            continue;
        };
        if close.close_height == 0 {
            unrecognised_spend = true;
            continue;
        }

        match classify_spend(&tx.tx, close.close_height)? {
            SpendKind::Success => return Ok(TxRole::Sweep(SpendKind::Success)),
            SpendKind::Timeout => return Ok(TxRole::Sweep(SpendKind::Timeout)),
            SpendKind::Unknown => unrecognised_spend = true,
        }
    }

    if tx.amount_sat > 0 {
        Ok(TxRole::Receipt { unrecognised_spend })
    } else {
        Ok(TxRole::Payment { unrecognised_spend })
    }
}

async fn append_entries(
    entries: &mut Vec<Entry>,
    tx: &WalletTx,
    role: TxRole<'_>,
    chain: Option<&dyn ChainLookup>,
) -> Result<(), AuditError> {
    match role {
        TxRole::Open(open) if open.initiator => {
            entries.push(entry(
                tx,
                EntryKind::ChannelOpen,
                open.capacity_sat * MSAT_PER_SAT,
                false,
                open.channel_id.clone(),
                tx.label.clone(),
            ));
            entries.push(fee_entry(tx, EntryKind::ChannelOpenFee, chain).await?);
        }
        // The peer paid for this open; record it without amount or fee.
        TxRole::Open(open) => {
            entries.push(entry(
                tx,
                EntryKind::RemoteChannelOpen,
                0,
                true,
                open.channel_id.clone(),
                tx.label.clone(),
            ));
        }
        TxRole::Close(close) => {
            // The close itself realizes nothing; the timelocked funds come
            // back through later sweeps.
            entries.push(entry(
                tx,
                EntryKind::ChannelClose,
                0,
                true,
                tx.txid.to_string(),
                tx.label.clone(),
            ));
            if close.initiator {
                entries.push(fee_entry(tx, EntryKind::ChannelCloseFee, chain).await?);
            }
        }
        TxRole::Sweep(kind) => {
            let total_out: u64 = tx.tx.output.iter().map(|output| output.value).sum();
            let marker = match kind {
                SpendKind::Success => "htlc success sweep",
                SpendKind::Timeout => "htlc timeout sweep",
                SpendKind::Unknown => unreachable!("sweeps are classified spends"),
            };

            entries.push(entry(
                tx,
                EntryKind::Sweep,
                total_out * MSAT_PER_SAT,
                true,
                tx.txid.to_string(),
                join_notes(&tx.label, marker),
            ));
            entries.push(fee_entry(tx, EntryKind::SweepFee, chain).await?);
        }
        TxRole::Receipt { unrecognised_spend } => {
            entries.push(entry(
                tx,
                EntryKind::Receipt,
                tx.amount_sat.unsigned_abs() * MSAT_PER_SAT,
                true,
                tx.txid.to_string(),
                annotated_label(tx, unrecognised_spend),
            ));
        }
        TxRole::Payment { unrecognised_spend } => {
            entries.push(entry(
                tx,
                EntryKind::Payment,
                tx.amount_sat.unsigned_abs() * MSAT_PER_SAT,
                false,
                tx.txid.to_string(),
                annotated_label(tx, unrecognised_spend),
            ));
            entries.push(fee_entry(tx, EntryKind::PaymentFee, chain).await?);
        }
    }

    Ok(())
}

async fn fee_entry(
    tx: &WalletTx,
    kind: EntryKind,
    chain: Option<&dyn ChainLookup>,
) -> Result<Entry, AuditError> {
    let (amount_msat, note) = match chain {
        Some(chain) => {
            let fee_sat = transaction_fee(chain, tx.txid)
                .await
                .map_err(AuditError::Chain)?;
            if fee_sat < 0 {
                tracing::warn!(txid = %tx.txid, fee_sat, "Computed a negative fee");
            }

            (fee_sat.max(0) as u64 * MSAT_PER_SAT, String::new())
        }
        None => (0, FEE_UNKNOWN_NOTE.to_string()),
    };

    Ok(entry(
        tx,
        kind,
        amount_msat,
        false,
        fee_reference(&tx.txid.to_string()),
        note,
    ))
}

fn entry(
    tx: &WalletTx,
    kind: EntryKind,
    amount_msat: u64,
    credit: bool,
    reference: String,
    note: String,
) -> Entry {
    Entry {
        timestamp: tx.timestamp,
        kind,
        amount_msat,
        credit,
        on_chain: true,
        txid: tx.txid.to_string(),
        reference,
        note,
        fiat_value: String::new(),
        btc_price: None,
        category: String::new(),
    }
}

fn annotated_label(tx: &WalletTx, unrecognised_spend: bool) -> String {
    if unrecognised_spend {
        join_notes(&tx.label, UNRECOGNISED_SPEND_NOTE)
    } else {
        tx.label.clone()
    }
}

fn join_notes(label: &str, marker: &str) -> String {
    if label.is_empty() {
        marker.to_string()
    } else {
        format!("{label}; {marker}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::htlc::tests::htlc_script;
    use crate::htlc::tests::spend_tx;
    use crate::source::Forward;
    use crate::source::Invoice;
    use crate::source::PagedQuery;
    use crate::source::Payment;
    use anyhow::Result;
    use async_trait::async_trait;
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::PublicKey;
    use bitcoin::OutPoint;
    use bitcoin::PackedLockTime;
    use bitcoin::Script;
    use bitcoin::Sequence;
    use bitcoin::Transaction;
    use bitcoin::TxIn;
    use bitcoin::TxOut;
    use bitcoin::Witness;
    use std::str::FromStr;

    pub(crate) struct OnChainOnlyNode {
        pub(crate) opens: Vec<ChannelOpen>,
        pub(crate) closes: Vec<ChannelClose>,
        pub(crate) wallet_txs: Vec<WalletTx>,
    }

    #[async_trait]
    impl NodeEvents for OnChainOnlyNode {
        async fn node_pubkey(&self) -> Result<PublicKey> {
            Ok(PublicKey::from_str(
                "02eec7245d6b7d2ccb30380bfbe2a3648cd7a942653f5aa340edcea1f283686619",
            )?)
        }

        async fn channel_opens(
            &self,
            _start: OffsetDateTime,
            _end: OffsetDateTime,
        ) -> Result<Vec<ChannelOpen>> {
            Ok(self.opens.clone())
        }

        async fn channel_closes(&self) -> Result<Vec<ChannelClose>> {
            Ok(self.closes.clone())
        }

        async fn wallet_transactions(
            &self,
            _start: OffsetDateTime,
            _end: OffsetDateTime,
        ) -> Result<Vec<WalletTx>> {
            Ok(self.wallet_txs.clone())
        }

        async fn invoices(&self, _query: PagedQuery) -> Result<Vec<Invoice>> {
            Ok(vec![])
        }

        async fn payments(&self, _query: PagedQuery) -> Result<Vec<Payment>> {
            Ok(vec![])
        }

        async fn forwards(
            &self,
            _start: OffsetDateTime,
            _end: OffsetDateTime,
            _query: PagedQuery,
        ) -> Result<Vec<Forward>> {
            Ok(vec![])
        }
    }

    fn ts(unix: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(unix).unwrap()
    }

    fn window() -> (OffsetDateTime, OffsetDateTime) {
        (ts(1_600_000_000), ts(1_800_000_000))
    }

    fn plain_tx(value_sat: u64) -> Transaction {
        Transaction {
            version: 2,
            lock_time: PackedLockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::hash(b"funding"),
                    vout: 0,
                },
                script_sig: Script::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: value_sat,
                script_pubkey: Script::new(),
            }],
        }
    }

    fn wallet_tx(tx: Transaction, amount_sat: i64, label: &str) -> WalletTx {
        WalletTx {
            txid: tx.txid(),
            timestamp: ts(1_700_000_000),
            amount_sat,
            label: label.to_string(),
            tx,
        }
    }

    #[tokio::test]
    async fn plain_receipts_become_receipt_entries() {
        let tx = wallet_tx(plain_tx(100_000), 100_000, "");
        let txid = tx.txid;
        let node = OnChainOnlyNode {
            opens: vec![],
            closes: vec![],
            wallet_txs: vec![tx],
        };
        let (start, end) = window();

        let entries = classify_onchain(&node, None, start, end).await.unwrap();

        assert_eq!(entries.len(), 1);
        let receipt = &entries[0];
        assert_eq!(receipt.kind, EntryKind::Receipt);
        assert_eq!(receipt.amount_msat, 100_000_000);
        assert!(receipt.credit);
        assert!(receipt.on_chain);
        assert_eq!(receipt.reference, txid.to_string());
        assert_eq!(receipt.timestamp, ts(1_700_000_000));
    }

    #[tokio::test]
    async fn local_channel_opens_emit_open_and_fee() {
        let tx = wallet_tx(plain_tx(500_000), -500_000, "");
        let txid = tx.txid;
        let node = OnChainOnlyNode {
            opens: vec![ChannelOpen {
                channel_id: "689156293427329024".to_string(),
                funding_txid: txid,
                capacity_sat: 500_000,
                initiator: true,
            }],
            closes: vec![],
            wallet_txs: vec![tx],
        };
        let (start, end) = window();

        let entries = classify_onchain(&node, None, start, end).await.unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, EntryKind::ChannelOpen);
        assert_eq!(entries[0].amount_msat, 500_000_000);
        assert!(!entries[0].credit);
        assert_eq!(entries[0].reference, "689156293427329024");
        assert_eq!(entries[1].kind, EntryKind::ChannelOpenFee);
        assert_eq!(entries[1].reference, format!("fee:{txid}"));
        assert!(entries[1].note.contains("fee unknown"));
    }

    #[tokio::test]
    async fn remote_channel_opens_are_informational() {
        let tx = wallet_tx(plain_tx(300_000), 0, "");
        let txid = tx.txid;
        let node = OnChainOnlyNode {
            opens: vec![ChannelOpen {
                channel_id: "700000000000000000".to_string(),
                funding_txid: txid,
                capacity_sat: 300_000,
                initiator: false,
            }],
            closes: vec![],
            wallet_txs: vec![tx],
        };
        let (start, end) = window();

        let entries = classify_onchain(&node, None, start, end).await.unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::RemoteChannelOpen);
        assert_eq!(entries[0].amount_msat, 0);
    }

    #[tokio::test]
    async fn closes_realize_nothing_until_swept() {
        let tx = wallet_tx(plain_tx(250_000), 0, "");
        let txid = tx.txid;
        let node = OnChainOnlyNode {
            opens: vec![],
            closes: vec![ChannelClose {
                channel_id: "689156293427329024".to_string(),
                close_txid: txid,
                close_height: 100,
                initiator: true,
            }],
            wallet_txs: vec![tx],
        };
        let (start, end) = window();

        let entries = classify_onchain(&node, None, start, end).await.unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, EntryKind::ChannelClose);
        assert_eq!(entries[0].amount_msat, 0);
        assert!(entries[0].credit);
        assert_eq!(entries[1].kind, EntryKind::ChannelCloseFee);
    }

    #[tokio::test]
    async fn htlc_spends_of_close_outputs_are_sweeps() {
        let close_tx = plain_tx(42_000);
        let close_txid = close_tx.txid();

        let mut sweep = spend_tx(
            vec![vec![0x30; 71], vec![0x00], htlc_script(100).to_bytes()],
            40_000,
        );
        sweep.input[0].previous_output = OutPoint {
            txid: close_txid,
            vout: 0,
        };

        let node = OnChainOnlyNode {
            opens: vec![],
            closes: vec![ChannelClose {
                channel_id: "689156293427329024".to_string(),
                close_txid,
                close_height: 100,
                initiator: false,
            }],
            wallet_txs: vec![wallet_tx(sweep, 40_000, "")],
        };
        let (start, end) = window();

        let entries = classify_onchain(&node, None, start, end).await.unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, EntryKind::Sweep);
        assert_eq!(entries[0].amount_msat, 40_000_000);
        assert!(entries[0].credit);
        assert!(entries[0].note.contains("timeout"));
        assert_eq!(entries[1].kind, EntryKind::SweepFee);
    }

    #[tokio::test]
    async fn unrecognised_close_spends_fall_through_with_a_note() {
        let close_tx = plain_tx(42_000);
        let close_txid = close_tx.txid();

        // Spends the close output with a plain keyspend witness.
        let mut spend = spend_tx(vec![vec![0x30; 71], vec![0x02; 33]], 40_000);
        spend.input[0].previous_output = OutPoint {
            txid: close_txid,
            vout: 0,
        };

        let node = OnChainOnlyNode {
            opens: vec![],
            closes: vec![ChannelClose {
                channel_id: "689156293427329024".to_string(),
                close_txid,
                close_height: 100,
                initiator: false,
            }],
            wallet_txs: vec![wallet_tx(spend, 40_000, "")],
        };
        let (start, end) = window();

        let entries = classify_onchain(&node, None, start, end).await.unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::Receipt);
        assert!(entries[0].note.contains("unrecognised spend"));
    }

    #[tokio::test]
    async fn outbound_transactions_emit_payment_and_fee() {
        let tx = wallet_tx(plain_tx(75_000), -75_000, "loopd -- out");
        let node = OnChainOnlyNode {
            opens: vec![],
            closes: vec![],
            wallet_txs: vec![tx],
        };
        let (start, end) = window();

        let entries = classify_onchain(&node, None, start, end).await.unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, EntryKind::Payment);
        assert_eq!(entries[0].amount_msat, 75_000_000);
        assert!(!entries[0].credit);
        assert_eq!(entries[0].note, "loopd -- out");
        assert_eq!(entries[1].kind, EntryKind::PaymentFee);
    }

    #[tokio::test]
    async fn transactions_outside_the_window_are_skipped() {
        let mut tx = wallet_tx(plain_tx(10_000), 10_000, "");
        tx.timestamp = ts(1_500_000_000);
        let node = OnChainOnlyNode {
            opens: vec![],
            closes: vec![],
            wallet_txs: vec![tx],
        };
        let (start, end) = window();

        let entries = classify_onchain(&node, None, start, end).await.unwrap();

        assert!(entries.is_empty());
    }
}
