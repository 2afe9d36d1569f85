use fiat::Price;
use lightning::ln::PaymentPreimage;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// What an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    ChannelOpen,
    RemoteChannelOpen,
    ChannelOpenFee,
    ChannelClose,
    ChannelCloseFee,
    Sweep,
    SweepFee,
    Receipt,
    Payment,
    PaymentFee,
    Forward,
    ForwardFee,
    CircularReceipt,
    CircularPayment,
    CircularPaymentFee,
}

impl EntryKind {
    pub fn label(&self) -> &'static str {
        match self {
            EntryKind::ChannelOpen => "channel-open",
            EntryKind::RemoteChannelOpen => "remote-channel-open",
            EntryKind::ChannelOpenFee => "channel-open-fee",
            EntryKind::ChannelClose => "channel-close",
            EntryKind::ChannelCloseFee => "channel-close-fee",
            EntryKind::Sweep => "sweep",
            EntryKind::SweepFee => "sweep-fee",
            EntryKind::Receipt => "receipt",
            EntryKind::Payment => "payment",
            EntryKind::PaymentFee => "payment-fee",
            EntryKind::Forward => "forward",
            EntryKind::ForwardFee => "forward-fee",
            EntryKind::CircularReceipt => "circular-receipt",
            EntryKind::CircularPayment => "circular-payment",
            EntryKind::CircularPaymentFee => "circular-payment-fee",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.label().fmt(f)
    }
}

impl FromStr for EntryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "channel-open" => EntryKind::ChannelOpen,
            "remote-channel-open" => EntryKind::RemoteChannelOpen,
            "channel-open-fee" => EntryKind::ChannelOpenFee,
            "channel-close" => EntryKind::ChannelClose,
            "channel-close-fee" => EntryKind::ChannelCloseFee,
            "sweep" => EntryKind::Sweep,
            "sweep-fee" => EntryKind::SweepFee,
            "receipt" => EntryKind::Receipt,
            "payment" => EntryKind::Payment,
            "payment-fee" => EntryKind::PaymentFee,
            "forward" => EntryKind::Forward,
            "forward-fee" => EntryKind::ForwardFee,
            "circular-receipt" => EntryKind::CircularReceipt,
            "circular-payment" => EntryKind::CircularPayment,
            "circular-payment-fee" => EntryKind::CircularPaymentFee,
            other => return Err(format!("unknown entry kind: {other}")),
        };

        Ok(kind)
    }
}

/// One row of the output ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// UTC, second precision.
    pub timestamp: OffsetDateTime,
    pub kind: EntryKind,
    /// Always non-negative; the direction is carried by `credit`.
    pub amount_msat: u64,
    /// True increases the balance, false decreases it.
    pub credit: bool,
    pub on_chain: bool,
    /// Empty for purely off-chain events.
    pub txid: String,
    /// Unique within a report.
    pub reference: String,
    /// Free text; carries the on-chain label or invoice memo where one
    /// exists, which is also what categories match against.
    pub note: String,
    /// Decimal fiat value, empty when fiat conversion is disabled or no
    /// price sample bracketed the timestamp.
    pub fiat_value: String,
    /// The BTC price used for the conversion, if any.
    pub btc_price: Option<Price>,
    /// First matching custom category, or empty.
    pub category: String,
}

/// Reference for any fee entry: the claiming entry's reference with a
/// `fee:` prefix. On-chain that reduces to `fee:<txid>`.
pub(crate) fn fee_reference(parent: &str) -> String {
    format!("fee:{parent}")
}

/// Reference for an outgoing payment. The node-assigned sequence number
/// disambiguates repeated payments of the same invoice.
pub(crate) fn payment_reference(sequence_number: u64, preimage: &PaymentPreimage) -> String {
    format!("{sequence_number}:{}", hex::encode(preimage.0))
}

/// Reference for a settled invoice.
pub(crate) fn receipt_reference(preimage: &PaymentPreimage) -> String {
    hex::encode(preimage.0)
}

/// Reference for a forwarding event. Forwards have no preimage or txid, so
/// the resolve time and the channel pair identify them.
pub(crate) fn forward_reference(
    timestamp: OffsetDateTime,
    channel_in: u64,
    channel_out: u64,
) -> String {
    format!("{}:{channel_in}:{channel_out}", timestamp.unix_timestamp())
}
