use crate::entry::Entry;
use crate::entry::EntryKind;
use crate::report::Report;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use fiat::Price;
use rust_decimal::Decimal;
use std::io::Read;
use std::io::Write;
use std::str::FromStr;
use time::OffsetDateTime;

/// Write a report as CSV, one row per entry in report order.
///
/// `currency` names the fiat column; amounts are signed with a leading `-`
/// for debits.
pub fn write_report_csv(report: &Report, currency: &str, writer: impl Write) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);

    let fiat_header = format!("Amount({currency})");
    csv_writer.write_record([
        "Timestamp",
        "OnChain",
        "Type",
        "Category",
        "Amount(Msat)",
        fiat_header.as_str(),
        "TxID",
        "Reference",
        "BTCPrice",
        "BTCTimestamp",
        "Note",
    ])?;

    for entry in &report.entries {
        let amount = signed(entry.amount_msat.to_string(), entry.credit);
        let fiat_value = if entry.fiat_value.is_empty() {
            String::new()
        } else {
            signed(entry.fiat_value.clone(), entry.credit)
        };
        let (btc_price, btc_timestamp) = match &entry.btc_price {
            Some(price) => (
                price.price.to_string(),
                price.timestamp.unix_timestamp().to_string(),
            ),
            None => (String::new(), String::new()),
        };

        csv_writer.write_record([
            entry.timestamp.unix_timestamp().to_string(),
            entry.on_chain.to_string(),
            entry.kind.to_string(),
            entry.category.clone(),
            amount,
            fiat_value,
            entry.txid.clone(),
            entry.reference.clone(),
            btc_price,
            btc_timestamp,
            entry.note.clone(),
        ])?;
    }

    csv_writer.flush()?;
    Ok(())
}

/// Parse entries back out of a report CSV.
///
/// The fiat currency is recovered from the `Amount(<FIAT>)` header column.
pub fn parse_report_csv(reader: impl Read) -> Result<Vec<Entry>> {
    let mut csv_reader = csv::Reader::from_reader(reader);

    let headers = csv_reader.headers().context("missing csv header")?.clone();
    if headers.len() != 11 {
        bail!("expected 11 header columns, got {}", headers.len());
    }
    let currency = headers
        .get(5)
        .and_then(|header| header.strip_prefix("Amount("))
        .and_then(|header| header.strip_suffix(')'))
        .context("malformed fiat amount header")?
        .to_string();

    let mut entries = Vec::new();
    for record in csv_reader.records() {
        let record = record?;
        if record.len() != 11 {
            bail!("expected 11 columns, got {}", record.len());
        }

        let timestamp = OffsetDateTime::from_unix_timestamp(
            record[0].parse::<i64>().context("bad timestamp")?,
        )?;
        let on_chain = record[1].parse::<bool>().context("bad on-chain flag")?;
        let kind = EntryKind::from_str(&record[2]).map_err(anyhow::Error::msg)?;
        let (credit, amount_msat) = parse_signed(&record[4])?;
        let fiat_value = record[5].trim_start_matches('-').to_string();

        let btc_price = match (&record[8], &record[9]) {
            ("", "") => None,
            (price, sample_ts) => Some(Price {
                timestamp: OffsetDateTime::from_unix_timestamp(
                    sample_ts.parse::<i64>().context("bad price timestamp")?,
                )?,
                price: Decimal::from_str(price).context("bad btc price")?,
                currency: currency.clone(),
            }),
        };

        entries.push(Entry {
            timestamp,
            kind,
            amount_msat,
            credit,
            on_chain,
            txid: record[6].to_string(),
            reference: record[7].to_string(),
            note: record[10].to_string(),
            fiat_value,
            btc_price,
            category: record[3].to_string(),
        });
    }

    Ok(entries)
}

/// Zero-amount debits keep the sign so the credit flag survives a round
/// trip.
fn signed(value: String, credit: bool) -> String {
    if credit {
        value
    } else {
        format!("-{value}")
    }
}

fn parse_signed(value: &str) -> Result<(bool, u64)> {
    match value.strip_prefix('-') {
        Some(debit) => Ok((false, debit.parse().context("bad amount")?)),
        None => Ok((true, value.parse().context("bad amount")?)),
    }
}
