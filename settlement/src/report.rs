//! Read-side views for administrators and account pages.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;

use cryptoledger_common::{
    Result, Transaction, TransactionFilter, TransactionStatus, TransactionType, UserId,
};
use cryptoledger_ledger::{Holding, JournalEntry, LedgerStore, SettlementStore, TransactionStore};

use crate::config::EngineConfig;
use crate::engine::bounded;

/// Count and summed quantity of transactions in one status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusTally {
    pub count: u64,
    pub volume: Decimal,
}

impl StatusTally {
    fn add(&mut self, quantity: Decimal) {
        self.count += 1;
        self.volume += quantity;
    }
}

/// Transaction counts and volumes by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransactionStats {
    pub pending: StatusTally,
    pub completed: StatusTally,
    pub cancelled: StatusTally,
}

impl TransactionStats {
    pub fn from_transactions<'a>(transactions: impl IntoIterator<Item = &'a Transaction>) -> Self {
        let mut stats = Self::default();
        for transaction in transactions {
            let tally = match transaction.status {
                TransactionStatus::Pending => &mut stats.pending,
                TransactionStatus::Completed => &mut stats.completed,
                TransactionStatus::Cancelled => &mut stats.cancelled,
            };
            tally.add(transaction.quantity());
        }
        stats
    }

    /// Volume still live or already settled; cancelled requests excluded.
    pub fn total_volume(&self) -> Decimal {
        self.pending.volume + self.completed.volume
    }

    pub fn total_count(&self) -> u64 {
        self.pending.count + self.completed.count + self.cancelled.count
    }
}

/// The most recently approved transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovedSummary {
    pub transaction: Transaction,
    /// Commission at the configured rate, for buys and withdrawals.
    pub fee: Option<Decimal>,
}

/// Queries over the shared store.
pub struct LedgerReports {
    store: Arc<dyn SettlementStore>,
    config: EngineConfig,
}

impl LedgerReports {
    pub fn new(store: Arc<dyn SettlementStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    /// Transactions matching `filter`, oldest first.
    pub async fn transactions(&self, filter: &TransactionFilter) -> Result<Vec<Transaction>> {
        bounded(self.config.store_timeout, "list transactions", self.store.list(filter)).await
    }

    /// All transactions of one user, optionally narrowed by status and type.
    pub async fn user_transactions(
        &self,
        user_id: &UserId,
        status: Option<TransactionStatus>,
        transaction_type: Option<TransactionType>,
    ) -> Result<Vec<Transaction>> {
        let filter = TransactionFilter {
            user_id: Some(user_id.clone()),
            status,
            transaction_type,
        };
        self.transactions(&filter).await
    }

    /// Counts and volumes across all users.
    pub async fn stats(&self) -> Result<TransactionStats> {
        let transactions = self.transactions(&TransactionFilter::default()).await?;
        Ok(TransactionStats::from_transactions(&transactions))
    }

    /// Latest completed transaction by settlement time.
    pub async fn last_approved(&self) -> Result<Option<ApprovedSummary>> {
        let completed = self
            .transactions(&TransactionFilter::default().with_status(TransactionStatus::Completed))
            .await?;

        let Some(transaction) = completed
            .into_iter()
            .max_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)))
        else {
            return Ok(None);
        };

        let fee = match transaction.transaction_type() {
            TransactionType::Buy | TransactionType::Withdrawal => Some(
                self.config
                    .withdrawal_fee_rate
                    .fee_on(transaction.quantity())?,
            ),
            TransactionType::Sell | TransactionType::Deposit => None,
        };
        Ok(Some(ApprovedSummary { transaction, fee }))
    }

    /// Holdings worth showing: zero and near-zero amounts are hidden.
    pub async fn visible_holdings(&self, user_id: &UserId) -> Result<Vec<Holding>> {
        let holdings = bounded(
            self.config.store_timeout,
            "list holdings",
            self.store.holdings(user_id),
        )
        .await?;
        let threshold = self.config.holding_display_threshold;
        Ok(holdings
            .into_iter()
            .filter(|h| h.is_visible(threshold))
            .collect())
    }

    pub async fn cash_balance(&self, user_id: &UserId) -> Result<Decimal> {
        bounded(self.config.store_timeout, "get balance", self.store.get_balance(user_id)).await
    }

    /// Journal written when `transaction` settled; empty if it never did.
    pub async fn settlement_journal(&self, transaction: &Transaction) -> Result<Vec<JournalEntry>> {
        bounded(
            self.config.store_timeout,
            "read journal",
            self.store.journal(transaction.id),
        )
        .await
    }
}
