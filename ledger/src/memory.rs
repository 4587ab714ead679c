//! In-memory ledger backend.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{debug, info, instrument};

use cryptoledger_common::{
    AssetId, Entity, LedgerError, Result, ShortAccount, Transaction, TransactionFilter,
    TransactionId, TransactionStatus, UserId,
};

use crate::balance::{CashBalance, Holding};
use crate::journal::{JournalEntry, LedgerAccount, LedgerBatch};
use crate::store::{CommitOutcome, LedgerStore, SettlementStore, TransactionStore};

/// Thread-safe store for cash, holdings and transactions.
///
/// Single-key adjustments lock only their map shard. A settlement commit
/// holds the transaction entry and takes `gate` exclusively, so readers never
/// observe half of a batch.
pub struct MemoryStore {
    balances: DashMap<UserId, CashBalance>,
    holdings: DashMap<(UserId, AssetId), Holding>,
    transactions: DashMap<TransactionId, Transaction>,
    journal: RwLock<Vec<JournalEntry>>,
    gate: RwLock<()>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            balances: DashMap::new(),
            holdings: DashMap::new(),
            transactions: DashMap::new(),
            journal: RwLock::new(Vec::new()),
            gate: RwLock::new(()),
        }
    }

    fn open(&self, user_id: &UserId) {
        self.balances
            .entry(user_id.clone())
            .or_insert_with(|| CashBalance::zero(user_id.clone()));
    }

    fn balance_of(&self, user_id: &UserId) -> Result<Decimal> {
        let _gate = self.gate.read();
        self.balances
            .get(user_id)
            .map(|b| b.balance)
            .ok_or_else(|| LedgerError::NotFound(Entity::User(user_id.clone())))
    }

    fn holding_of(&self, user_id: &UserId, asset_id: &AssetId) -> Result<Decimal> {
        let _gate = self.gate.read();
        self.ensure_user(user_id)?;
        Ok(self
            .holdings
            .get(&(user_id.clone(), asset_id.clone()))
            .map(|h| h.amount)
            .unwrap_or(Decimal::ZERO))
    }

    fn ensure_user(&self, user_id: &UserId) -> Result<()> {
        if self.balances.contains_key(user_id) {
            Ok(())
        } else {
            Err(LedgerError::NotFound(Entity::User(user_id.clone())))
        }
    }

    fn adjust_cash(&self, user_id: &UserId, delta: Decimal) -> Result<Decimal> {
        let _gate = self.gate.read();
        let mut entry = self
            .balances
            .get_mut(user_id)
            .ok_or_else(|| LedgerError::NotFound(Entity::User(user_id.clone())))?;

        let next = checked_next(entry.balance, delta, ShortAccount::Cash(user_id.clone()))?;
        entry.balance = next;
        entry.updated_at = Utc::now();
        Ok(next)
    }

    fn adjust_asset(&self, user_id: &UserId, asset_id: &AssetId, delta: Decimal) -> Result<Decimal> {
        let _gate = self.gate.read();
        self.ensure_user(user_id)?;
        let short = || ShortAccount::Holding(user_id.clone(), asset_id.clone());

        match self.holdings.entry((user_id.clone(), asset_id.clone())) {
            Entry::Occupied(mut occupied) => {
                let holding = occupied.get_mut();
                let next = checked_next(holding.amount, delta, short())?;
                holding.amount = next;
                holding.updated_at = Utc::now();
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                let next = checked_next(Decimal::ZERO, delta, short())?;
                vacant.insert(Holding::new(user_id.clone(), asset_id.clone(), next));
                Ok(next)
            }
        }
    }

    fn current(&self, account: &LedgerAccount) -> Result<Decimal> {
        self.ensure_user(account.user_id())?;
        Ok(match account {
            LedgerAccount::Cash { user_id } => self
                .balances
                .get(user_id)
                .map(|b| b.balance)
                .unwrap_or(Decimal::ZERO),
            LedgerAccount::Holding { user_id, asset_id } => self
                .holdings
                .get(&(user_id.clone(), asset_id.clone()))
                .map(|h| h.amount)
                .unwrap_or(Decimal::ZERO),
        })
    }

    /// Resulting balance of every posting, checked before anything is written.
    fn plan(&self, batch: &LedgerBatch) -> Result<Vec<Decimal>> {
        let mut running: Vec<(&LedgerAccount, Decimal)> = Vec::new();
        let mut after = Vec::with_capacity(batch.postings.len());

        for posting in &batch.postings {
            let before = match running.iter().find(|(a, _)| *a == &posting.account) {
                Some((_, value)) => *value,
                None => self.current(&posting.account)?,
            };
            let next = checked_next(before, posting.delta, posting.account.short())?;

            match running.iter_mut().find(|(a, _)| *a == &posting.account) {
                Some(slot) => slot.1 = next,
                None => running.push((&posting.account, next)),
            }
            after.push(next);
        }

        Ok(after)
    }

    fn write(&self, account: &LedgerAccount, value: Decimal) {
        let now = Utc::now();
        match account {
            LedgerAccount::Cash { user_id } => {
                if let Some(mut entry) = self.balances.get_mut(user_id) {
                    entry.balance = value;
                    entry.updated_at = now;
                }
            }
            LedgerAccount::Holding { user_id, asset_id } => {
                self.holdings
                    .entry((user_id.clone(), asset_id.clone()))
                    .and_modify(|h| {
                        h.amount = value;
                        h.updated_at = now;
                    })
                    .or_insert_with(|| Holding::new(user_id.clone(), asset_id.clone(), value));
            }
        }
    }

    fn commit_batch(
        &self,
        batch: &LedgerBatch,
        expected: TransactionStatus,
        next: TransactionStatus,
    ) -> Result<CommitOutcome> {
        let id = batch.transaction_id;
        let mut record = self
            .transactions
            .get_mut(&id)
            .ok_or(LedgerError::NotFound(Entity::Transaction(id)))?;

        if record.status != expected {
            return Ok(CommitOutcome::StatusMismatch(record.status));
        }
        if !record.status.can_transition_to(next) {
            return Err(LedgerError::InvalidState {
                transaction_id: id,
                status: record.status,
            });
        }

        let _gate = self.gate.write();
        let after = self.plan(batch)?;

        let mut entries = Vec::with_capacity(after.len());
        for (posting, value) in batch.postings.iter().zip(after) {
            self.write(&posting.account, value);
            entries.push(JournalEntry::new(id, posting, value));
        }

        record.status = next;
        record.updated_at = Utc::now();
        self.journal.write().extend(entries.iter().cloned());

        info!(
            transaction_id = %id,
            status = %next,
            postings = entries.len(),
            "Settlement committed"
        );

        Ok(CommitOutcome::Committed(entries))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// `current + delta`, rejecting overflow and negative results.
fn checked_next(current: Decimal, delta: Decimal, account: ShortAccount) -> Result<Decimal> {
    let next = current
        .checked_add(delta)
        .ok_or_else(|| LedgerError::validation("amount", "balance overflows"))?;

    if next < Decimal::ZERO {
        return Err(LedgerError::InsufficientBalance {
            account,
            required: -delta,
            available: current,
        });
    }
    Ok(next)
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn open_account(&self, user_id: &UserId) -> Result<()> {
        self.open(user_id);
        Ok(())
    }

    async fn get_balance(&self, user_id: &UserId) -> Result<Decimal> {
        self.balance_of(user_id)
    }

    #[instrument(skip(self))]
    async fn adjust_balance(&self, user_id: &UserId, delta: Decimal) -> Result<Decimal> {
        let balance = self.adjust_cash(user_id, delta)?;
        debug!(user = %user_id, %delta, %balance, "Cash adjusted");
        Ok(balance)
    }

    async fn get_holding(&self, user_id: &UserId, asset_id: &AssetId) -> Result<Decimal> {
        self.holding_of(user_id, asset_id)
    }

    #[instrument(skip(self))]
    async fn adjust_holding(
        &self,
        user_id: &UserId,
        asset_id: &AssetId,
        delta: Decimal,
    ) -> Result<Decimal> {
        let amount = self.adjust_asset(user_id, asset_id, delta)?;
        debug!(user = %user_id, asset = %asset_id, %delta, %amount, "Holding adjusted");
        Ok(amount)
    }

    async fn holdings(&self, user_id: &UserId) -> Result<Vec<Holding>> {
        let _gate = self.gate.read();
        self.ensure_user(user_id)?;
        let mut holdings: Vec<Holding> = self
            .holdings
            .iter()
            .filter(|h| &h.user_id == user_id)
            .map(|h| h.value().clone())
            .collect();
        holdings.sort_by(|a, b| a.asset_id.cmp(&b.asset_id));
        Ok(holdings)
    }

    async fn journal(&self, transaction_id: TransactionId) -> Result<Vec<JournalEntry>> {
        Ok(self
            .journal
            .read()
            .iter()
            .filter(|e| e.transaction_id == transaction_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn get(&self, id: TransactionId) -> Result<Transaction> {
        self.transactions
            .get(&id)
            .map(|t| t.clone())
            .ok_or(LedgerError::NotFound(Entity::Transaction(id)))
    }

    async fn insert(&self, record: Transaction) -> Result<()> {
        match self.transactions.entry(record.id) {
            Entry::Occupied(_) => Err(LedgerError::validation(
                "id",
                format!("transaction {} already exists", record.id),
            )),
            Entry::Vacant(vacant) => {
                vacant.insert(record);
                Ok(())
            }
        }
    }

    async fn compare_and_set_status_with_note(
        &self,
        id: TransactionId,
        expected: TransactionStatus,
        next: TransactionStatus,
        note: Option<&str>,
    ) -> Result<bool> {
        if !expected.can_transition_to(next) {
            return Err(LedgerError::InvalidState {
                transaction_id: id,
                status: expected,
            });
        }

        let mut record = self
            .transactions
            .get_mut(&id)
            .ok_or(LedgerError::NotFound(Entity::Transaction(id)))?;

        if record.status != expected {
            return Ok(false);
        }

        record.status = next;
        record.updated_at = Utc::now();
        if let Some(note) = note {
            record.cancellation_reason = Some(note.to_string());
        }
        Ok(true)
    }

    async fn list(&self, filter: &TransactionFilter) -> Result<Vec<Transaction>> {
        let mut transactions: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|t| filter.matches(t.value()))
            .map(|t| t.value().clone())
            .collect();
        transactions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(transactions)
    }
}

#[async_trait]
impl SettlementStore for MemoryStore {
    async fn commit(
        &self,
        batch: &LedgerBatch,
        expected: TransactionStatus,
        next: TransactionStatus,
    ) -> Result<CommitOutcome> {
        self.commit_batch(batch, expected, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryptoledger_common::TransactionKind;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn user() -> UserId {
        UserId::new("1")
    }

    fn btc() -> AssetId {
        AssetId::new("bitcoin")
    }

    async fn store_with_user() -> MemoryStore {
        let store = MemoryStore::new();
        store.open_account(&user()).await.unwrap();
        store
    }

    fn pending_sell(quantity: Decimal) -> Transaction {
        Transaction::new(
            user(),
            TransactionKind::Sell {
                asset_id: btc(),
                quantity,
                price: dec!(50000),
            },
            dec!(50000),
            String::new(),
        )
    }

    #[tokio::test]
    async fn test_open_account_is_idempotent() {
        let store = store_with_user().await;
        store.adjust_balance(&user(), dec!(25)).await.unwrap();
        store.open_account(&user()).await.unwrap();
        assert_eq!(store.get_balance(&user()).await.unwrap(), dec!(25));
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let store = MemoryStore::new();
        let err = store.get_balance(&user()).await.unwrap_err();
        assert_eq!(err, LedgerError::NotFound(Entity::User(user())));
        assert!(store.adjust_holding(&user(), &btc(), dec!(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_adjust_holding_rejects_negative() {
        let store = store_with_user().await;
        store.adjust_holding(&user(), &btc(), dec!(0.5)).await.unwrap();

        let err = store
            .adjust_holding(&user(), &btc(), dec!(-0.6))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientBalance {
                account: ShortAccount::Holding(user(), btc()),
                required: dec!(0.6),
                available: dec!(0.5),
            }
        );
        assert_eq!(store.get_holding(&user(), &btc()).await.unwrap(), dec!(0.5));
    }

    #[tokio::test]
    async fn test_holding_kept_at_zero() {
        let store = store_with_user().await;
        store.adjust_holding(&user(), &btc(), dec!(0.5)).await.unwrap();
        store.adjust_holding(&user(), &btc(), dec!(-0.5)).await.unwrap();

        let holdings = store.holdings(&user()).await.unwrap();
        assert_eq!(holdings.len(), 1);
        assert!(holdings[0].amount.is_zero());
    }

    #[tokio::test]
    async fn test_debit_of_missing_holding_rejected() {
        let store = store_with_user().await;
        assert!(store.adjust_holding(&user(), &btc(), dec!(-1)).await.is_err());
        assert!(store.holdings(&user()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_adjust_balance_rejects_negative() {
        let store = store_with_user().await;
        store.adjust_balance(&user(), dec!(10)).await.unwrap();
        assert!(store.adjust_balance(&user(), dec!(-10.01)).await.is_err());
        assert_eq!(store.adjust_balance(&user(), dec!(-10)).await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_compare_and_set_status() {
        let store = store_with_user().await;
        let transaction = pending_sell(dec!(0.2));
        let id = transaction.id;
        store.insert(transaction).await.unwrap();

        assert!(store
            .compare_and_set_status(id, TransactionStatus::Pending, TransactionStatus::Cancelled)
            .await
            .unwrap());
        assert!(!store
            .compare_and_set_status(id, TransactionStatus::Pending, TransactionStatus::Completed)
            .await
            .unwrap());
        assert_eq!(store.get(id).await.unwrap().status, TransactionStatus::Cancelled);

        let missing = TransactionId::new();
        assert!(store
            .compare_and_set_status(missing, TransactionStatus::Pending, TransactionStatus::Cancelled)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = store_with_user().await;
        let transaction = pending_sell(dec!(0.2));
        store.insert(transaction.clone()).await.unwrap();

        let err = store.insert(transaction).await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_terminal_status_cannot_be_reversed() {
        let store = store_with_user().await;
        let transaction = pending_sell(dec!(0.2));
        let id = transaction.id;
        store.insert(transaction).await.unwrap();
        store
            .compare_and_set_status(id, TransactionStatus::Pending, TransactionStatus::Completed)
            .await
            .unwrap();

        let err = store
            .compare_and_set_status(id, TransactionStatus::Completed, TransactionStatus::Pending)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::InvalidState {
                transaction_id: id,
                status: TransactionStatus::Completed,
            }
        );
        assert!(store
            .compare_and_set_status(id, TransactionStatus::Cancelled, TransactionStatus::Completed)
            .await
            .is_err());
        assert_eq!(store.get(id).await.unwrap().status, TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn test_commit_applies_batch_and_status() {
        let store = store_with_user().await;
        store.adjust_holding(&user(), &btc(), dec!(0.5)).await.unwrap();
        let transaction = pending_sell(dec!(0.2));
        let id = transaction.id;
        store.insert(transaction).await.unwrap();

        let mut batch = LedgerBatch::new(id);
        batch.add(LedgerAccount::holding(user(), btc()), dec!(-0.2));
        batch.add(LedgerAccount::cash(user()), dec!(10000));

        let outcome = store
            .commit(&batch, TransactionStatus::Pending, TransactionStatus::Completed)
            .await
            .unwrap();
        let CommitOutcome::Committed(entries) = outcome else {
            panic!("expected commit");
        };

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].balance_after, dec!(0.3));
        assert_eq!(entries[1].balance_after, dec!(10000));
        assert_eq!(store.get(id).await.unwrap().status, TransactionStatus::Completed);
        assert_eq!(store.journal(id).await.unwrap(), entries);
    }

    #[tokio::test]
    async fn test_commit_is_all_or_nothing() {
        let store = store_with_user().await;
        store.adjust_holding(&user(), &btc(), dec!(0.1)).await.unwrap();
        let transaction = pending_sell(dec!(0.2));
        let id = transaction.id;
        store.insert(transaction).await.unwrap();

        let mut batch = LedgerBatch::new(id);
        batch.add(LedgerAccount::cash(user()), dec!(10000));
        batch.add(LedgerAccount::holding(user(), btc()), dec!(-0.2));

        let err = store
            .commit(&batch, TransactionStatus::Pending, TransactionStatus::Completed)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INSUFFICIENT_BALANCE");
        assert_eq!(store.get_balance(&user()).await.unwrap(), Decimal::ZERO);
        assert_eq!(store.get_holding(&user(), &btc()).await.unwrap(), dec!(0.1));
        assert_eq!(store.get(id).await.unwrap().status, TransactionStatus::Pending);
        assert!(store.journal(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_nets_repeated_accounts() {
        let store = store_with_user().await;
        let transaction = pending_sell(dec!(1));
        let id = transaction.id;
        store.insert(transaction).await.unwrap();

        let btc_account = LedgerAccount::holding(user(), btc());
        let mut batch = LedgerBatch::new(id);
        batch.add(btc_account.clone(), dec!(1));
        batch.add(btc_account.clone(), dec!(-1));

        store
            .commit(&batch, TransactionStatus::Pending, TransactionStatus::Completed)
            .await
            .unwrap();
        assert_eq!(store.get_holding(&user(), &btc()).await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_commit_loses_to_earlier_transition() {
        let store = store_with_user().await;
        let transaction = pending_sell(dec!(0.2));
        let id = transaction.id;
        store.insert(transaction).await.unwrap();
        store
            .compare_and_set_status(id, TransactionStatus::Pending, TransactionStatus::Cancelled)
            .await
            .unwrap();

        let mut batch = LedgerBatch::new(id);
        batch.add(LedgerAccount::cash(user()), dec!(10000));
        let outcome = store
            .commit(&batch, TransactionStatus::Pending, TransactionStatus::Completed)
            .await
            .unwrap();

        assert_eq!(outcome, CommitOutcome::StatusMismatch(TransactionStatus::Cancelled));
        assert_eq!(store.get_balance(&user()).await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adjustments_lose_no_updates() {
        let store = Arc::new(store_with_user().await);

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.adjust_holding(&user(), &btc(), dec!(0.01)).await.unwrap();
                    store.adjust_balance(&user(), dec!(1)).await.unwrap();
                })
            })
            .collect();
        for result in futures::future::join_all(tasks).await {
            result.unwrap();
        }

        assert_eq!(store.get_holding(&user(), &btc()).await.unwrap(), dec!(1.00));
        assert_eq!(store.get_balance(&user()).await.unwrap(), dec!(100));
    }

    proptest! {
        #[test]
        fn prop_holding_never_negative(deltas in proptest::collection::vec(-500i64..500, 1..40)) {
            let store = MemoryStore::new();
            store.open(&user());
            for units in deltas {
                let delta = Decimal::new(units, 2);
                let before = store.holding_of(&user(), &btc()).unwrap();
                match store.adjust_asset(&user(), &btc(), delta) {
                    Ok(after) => prop_assert_eq!(after, before + delta),
                    Err(_) => {
                        prop_assert!(before + delta < Decimal::ZERO);
                        prop_assert_eq!(store.holding_of(&user(), &btc()).unwrap(), before);
                    }
                }
                prop_assert!(store.holding_of(&user(), &btc()).unwrap() >= Decimal::ZERO);
            }
        }
    }
}
