//! Store interfaces consumed by the settlement engine.

use async_trait::async_trait;
use rust_decimal::Decimal;

use cryptoledger_common::{
    AssetId, Result, Transaction, TransactionFilter, TransactionId, TransactionStatus, UserId,
};

use crate::balance::Holding;
use crate::journal::{JournalEntry, LedgerBatch};

/// Per-user cash balances and per-(user, asset) holdings.
///
/// Every adjustment is an atomic read-modify-write on its key.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Create a zero cash account for `user_id`. No-op if it exists.
    async fn open_account(&self, user_id: &UserId) -> Result<()>;

    /// Current cash balance.
    async fn get_balance(&self, user_id: &UserId) -> Result<Decimal>;

    /// Add `delta` to the cash balance and return the new balance.
    ///
    /// Fails with `InsufficientBalance` without mutating if the result would be negative.
    async fn adjust_balance(&self, user_id: &UserId, delta: Decimal) -> Result<Decimal>;

    /// Current holding; zero if the user never held the asset.
    async fn get_holding(&self, user_id: &UserId, asset_id: &AssetId) -> Result<Decimal>;

    /// Add `delta` to a holding, creating it on first credit, and return the new amount.
    ///
    /// Fails with `InsufficientBalance` without mutating if the result would be negative.
    async fn adjust_holding(
        &self,
        user_id: &UserId,
        asset_id: &AssetId,
        delta: Decimal,
    ) -> Result<Decimal>;

    /// All holding rows of a user, zero rows included, ordered by asset.
    async fn holdings(&self, user_id: &UserId) -> Result<Vec<Holding>>;

    /// Journal entries written when `transaction_id` settled.
    async fn journal(&self, transaction_id: TransactionId) -> Result<Vec<JournalEntry>>;
}

/// Transaction records keyed by id.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Fetch a transaction; `NotFound` if missing.
    async fn get(&self, id: TransactionId) -> Result<Transaction>;

    /// Persist a new record.
    async fn insert(&self, record: Transaction) -> Result<()>;

    /// Move `id` from `expected` to `next`, recording `note` as the cancellation reason.
    ///
    /// Returns `Ok(false)` if the current status is not `expected`.
    async fn compare_and_set_status_with_note(
        &self,
        id: TransactionId,
        expected: TransactionStatus,
        next: TransactionStatus,
        note: Option<&str>,
    ) -> Result<bool>;

    /// Move `id` from `expected` to `next`. The sole concurrency gate on status.
    async fn compare_and_set_status(
        &self,
        id: TransactionId,
        expected: TransactionStatus,
        next: TransactionStatus,
    ) -> Result<bool> {
        self.compare_and_set_status_with_note(id, expected, next, None)
            .await
    }

    /// Transactions matching `filter`, oldest first.
    async fn list(&self, filter: &TransactionFilter) -> Result<Vec<Transaction>>;
}

/// Result of a settlement commit.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// Status changed and every posting applied.
    Committed(Vec<JournalEntry>),
    /// Another caller moved the transaction first; nothing applied.
    StatusMismatch(TransactionStatus),
}

/// A backend holding both ledgers that can settle a transaction as one unit.
#[async_trait]
pub trait SettlementStore: LedgerStore + TransactionStore {
    /// Compare-and-set the status of `batch.transaction_id` from `expected` to
    /// `next` and apply every posting in `batch`, all or nothing.
    ///
    /// A posting that would leave an account negative fails the whole commit
    /// with `InsufficientBalance`; the status stays `expected`.
    async fn commit(
        &self,
        batch: &LedgerBatch,
        expected: TransactionStatus,
        next: TransactionStatus,
    ) -> Result<CommitOutcome>;
}
