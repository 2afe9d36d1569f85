use crate::source::ChainLookup;
use anyhow::Context;
use anyhow::Result;
use bitcoin::Txid;

/// Compute the fee paid by `txid` as the sum of its input values minus the
/// sum of its output values.
///
/// Every input is resolved through another lookup of its funding
/// transaction. The result is signed: a malformed lookup source could yield
/// outputs exceeding inputs, and the caller decides how to treat that
/// rather than having it silently clamped here.
pub async fn transaction_fee(chain: &dyn ChainLookup, txid: Txid) -> Result<i64> {
    let tx = chain
        .transaction(txid)
        .await
        .with_context(|| format!("failed to look up {txid}"))?;

    let mut input_total: i64 = 0;
    for input in &tx.input {
        let outpoint = input.previous_output;
        let funding = chain
            .transaction(outpoint.txid)
            .await
            .with_context(|| format!("failed to look up input {}", outpoint.txid))?;
        let spent = funding
            .output
            .get(outpoint.vout as usize)
            .with_context(|| format!("{outpoint} refers to a missing output"))?;

        input_total = input_total
            .checked_add(spent.value as i64)
            .context("input value sum overflowed")?;
    }

    let mut output_total: i64 = 0;
    for output in &tx.output {
        output_total = output_total
            .checked_add(output.value as i64)
            .context("output value sum overflowed")?;
    }

    Ok(input_total - output_total)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::bail;
    use async_trait::async_trait;
    use bitcoin::hashes::Hash;
    use bitcoin::OutPoint;
    use bitcoin::PackedLockTime;
    use bitcoin::Script;
    use bitcoin::Sequence;
    use bitcoin::Transaction;
    use bitcoin::TxIn;
    use bitcoin::TxOut;
    use bitcoin::Witness;
    use std::collections::HashMap;

    pub(crate) struct MapChain {
        transactions: HashMap<Txid, Transaction>,
    }

    impl MapChain {
        pub(crate) fn new(transactions: Vec<Transaction>) -> Self {
            Self {
                transactions: transactions.into_iter().map(|tx| (tx.txid(), tx)).collect(),
            }
        }
    }

    #[async_trait]
    impl ChainLookup for MapChain {
        async fn transaction(&self, txid: Txid) -> Result<Transaction> {
            match self.transactions.get(&txid) {
                Some(tx) => Ok(tx.clone()),
                None => bail!("transaction {txid} not found"),
            }
        }
    }

    fn coinbase_like(values: Vec<u64>) -> Transaction {
        Transaction {
            version: 2,
            lock_time: PackedLockTime::ZERO,
            input: vec![],
            output: values
                .into_iter()
                .map(|value| TxOut {
                    value,
                    script_pubkey: Script::new(),
                })
                .collect(),
        }
    }

    fn spend(inputs: Vec<(Txid, u32)>, outputs: Vec<u64>) -> Transaction {
        Transaction {
            version: 2,
            lock_time: PackedLockTime::ZERO,
            input: inputs
                .into_iter()
                .map(|(txid, vout)| TxIn {
                    previous_output: OutPoint { txid, vout },
                    script_sig: Script::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::default(),
                })
                .collect(),
            output: outputs
                .into_iter()
                .map(|value| TxOut {
                    value,
                    script_pubkey: Script::new(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn fee_is_inputs_minus_outputs() {
        let funding = coinbase_like(vec![30_000, 12_000]);
        let funding_txid = funding.txid();
        let tx = spend(vec![(funding_txid, 0), (funding_txid, 1)], vec![40_000]);
        let txid = tx.txid();
        let chain = MapChain::new(vec![funding, tx]);

        let fee = transaction_fee(&chain, txid).await.unwrap();

        assert_eq!(fee, 2_000);
    }

    #[tokio::test]
    async fn missing_lookups_propagate() {
        let tx = spend(vec![(Txid::all_zeros(), 0)], vec![40_000]);
        let txid = tx.txid();
        let chain = MapChain::new(vec![tx]);

        assert!(transaction_fee(&chain, txid).await.is_err());
    }

    #[tokio::test]
    async fn negative_fees_are_returned_as_is() {
        let funding = coinbase_like(vec![10_000]);
        let funding_txid = funding.txid();
        let tx = spend(vec![(funding_txid, 0)], vec![15_000]);
        let txid = tx.txid();
        let chain = MapChain::new(vec![funding, tx]);

        let fee = transaction_fee(&chain, txid).await.unwrap();

        assert_eq!(fee, -5_000);
    }
}
