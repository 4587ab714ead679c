//! CryptoLedger Ledger
//!
//! Cash balances and per-asset holdings, the transaction store, and the
//! compare-and-set commit that settles a transaction as one atomic unit.
//! Ships an in-memory backend and a PostgreSQL backend.

pub mod account;
pub mod balance;
pub mod journal;
pub mod store;
pub mod memory;
pub mod postgres;

pub use account::{Role, User};
pub use balance::{CashBalance, Holding};
pub use journal::{JournalEntry, LedgerAccount, LedgerBatch, Posting};
pub use store::{CommitOutcome, LedgerStore, SettlementStore, TransactionStore};
pub use memory::MemoryStore;
pub use postgres::PgStore;
