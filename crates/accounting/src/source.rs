use anyhow::Result;
use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;
use bitcoin::Transaction;
use bitcoin::Txid;
use lightning::ln::PaymentHash;
use lightning::ln::PaymentPreimage;
use time::OffsetDateTime;

/// A channel this node participated in opening.
#[derive(Debug, Clone)]
pub struct ChannelOpen {
    pub channel_id: String,
    pub funding_txid: Txid,
    pub capacity_sat: u64,
    /// Whether the local node funded and initiated the open.
    pub initiator: bool,
}

/// A channel that has been closed on-chain.
#[derive(Debug, Clone)]
pub struct ChannelClose {
    pub channel_id: String,
    pub close_txid: Txid,
    /// Confirmation height of the close transaction; 0 while unconfirmed.
    pub close_height: u32,
    /// Whether the local node initiated the close.
    pub initiator: bool,
}

/// A transaction relevant to the node's on-chain wallet.
#[derive(Debug, Clone)]
pub struct WalletTx {
    pub txid: Txid,
    pub timestamp: OffsetDateTime,
    /// Net amount transferred in satoshis, excluding fees. Negative for
    /// outbound transactions.
    pub amount_sat: i64,
    /// User-assigned transaction label; what on-chain categories match.
    pub label: String,
    /// The raw transaction, needed to inspect witnesses of sweeps.
    pub tx: Transaction,
}

/// A settled invoice.
#[derive(Debug, Clone)]
pub struct Invoice {
    pub memo: String,
    pub preimage: PaymentPreimage,
    pub payment_hash: PaymentHash,
    pub amount_paid_msat: u64,
    pub settled_at: OffsetDateTime,
}

/// A successfully completed outgoing payment.
#[derive(Debug, Clone)]
pub struct Payment {
    /// Monotonic index assigned by the node.
    pub sequence_number: u64,
    pub payment_hash: PaymentHash,
    pub preimage: PaymentPreimage,
    pub value_msat: u64,
    pub fee_msat: u64,
    pub timestamp: OffsetDateTime,
    /// The final hop of the route, when the node reported one.
    pub destination: Option<PublicKey>,
}

/// A settled forwarding event.
#[derive(Debug, Clone, Copy)]
pub struct Forward {
    /// Resolve time of the forward.
    pub timestamp: OffsetDateTime,
    pub channel_in: u64,
    pub channel_out: u64,
    pub fee_msat: u64,
}

/// Offset and size of one page of a paged node query.
#[derive(Debug, Clone, Copy)]
pub struct PagedQuery {
    pub offset: u64,
    pub max_events: u64,
}

/// The Lightning node as an event source.
///
/// Implementations wrap whatever client library talks to the node; the
/// classifiers only depend on this interface. Queries carrying a
/// [`PagedQuery`] return at most `max_events` records starting at `offset`,
/// ordered by their node-assigned index.
#[async_trait]
pub trait NodeEvents: Send + Sync {
    async fn node_pubkey(&self) -> Result<PublicKey>;

    async fn channel_opens(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<ChannelOpen>>;

    /// All known closed channels. Not windowed: sweeps of old closes can
    /// confirm long after the close itself.
    async fn channel_closes(&self) -> Result<Vec<ChannelClose>>;

    async fn wallet_transactions(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<WalletTx>>;

    async fn invoices(&self, query: PagedQuery) -> Result<Vec<Invoice>>;

    async fn payments(&self, query: PagedQuery) -> Result<Vec<Payment>>;

    async fn forwards(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
        query: PagedQuery,
    ) -> Result<Vec<Forward>>;
}

/// Transaction lookup against a bitcoin node or index.
///
/// Optional: without it fee entries degrade to zero amounts with a note.
#[async_trait]
pub trait ChainLookup: Send + Sync {
    async fn transaction(&self, txid: Txid) -> Result<Transaction>;
}
