//! Audit report generation for a single Lightning node.
//!
//! Raw node events (on-chain wallet transactions, channel opens and closes,
//! invoices, payments, forwards) are classified into a flat ledger of typed
//! entries, each with a signed amount, a unique reference, an optional fiat
//! value and a user-defined category. The on-chain and off-chain classifiers
//! run concurrently with the price-cache population and their outputs merge
//! into one timestamp-sorted report.

mod category;
mod csv;
mod entry;
mod fees;
mod htlc;
mod offchain;
mod onchain;
mod report;
mod source;

pub use category::Category;
pub use category::CompiledCategories;
pub use self::csv::parse_report_csv;
pub use self::csv::write_report_csv;
pub use entry::Entry;
pub use entry::EntryKind;
pub use fees::transaction_fee;
pub use htlc::classify_spend;
pub use htlc::SpendKind;
pub use report::generate_report;
pub use report::PagingConfig;
pub use report::Report;
pub use report::ReportRequest;
pub use source::ChainLookup;
pub use source::ChannelClose;
pub use source::ChannelOpen;
pub use source::Forward;
pub use source::Invoice;
pub use source::NodeEvents;
pub use source::PagedQuery;
pub use source::Payment;
pub use source::WalletTx;

/// Errors surfaced by report generation.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("duplicate entry reference: {0}")]
    DuplicateReference(String),
    #[error("shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Fiat(#[from] fiat::FiatError),
    #[error("node query failed: {0:#}")]
    Node(anyhow::Error),
    #[error("chain lookup failed: {0:#}")]
    Chain(anyhow::Error),
}
