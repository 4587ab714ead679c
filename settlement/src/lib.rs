//! CryptoLedger Settlement
//!
//! Turns caller requests into pending transactions and administrative
//! decisions into ledger effects. Approval and cancellation race only through
//! the store's status compare-and-set, so each transaction settles once.

pub mod config;
pub mod directory;
pub mod engine;
pub mod intake;
pub mod metrics;
pub mod quote;
pub mod report;

pub use config::EngineConfig;
pub use directory::{
    Asset, AssetDirectory, InMemoryAssetDirectory, InMemoryUserDirectory, PriceOracle,
    StaticPriceOracle, UserDirectory,
};
pub use engine::{settlement_batch, SettlementEngine, SettlementReceipt};
pub use intake::{RequestIntake, SubmitRequest};
pub use metrics::{Metrics, MetricsSnapshot, SharedMetrics};
pub use quote::{Quote, QuoteCache};
pub use report::{ApprovedSummary, LedgerReports, StatusTally, TransactionStats};
