//! Settlement engine: approval and cancellation of pending transactions.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use cryptoledger_common::{
    notional, FeeRate, LedgerError, Result, Transaction, TransactionId, TransactionKind,
    TransactionStatus, TransactionType, UserId,
};
use cryptoledger_ledger::{
    CommitOutcome, JournalEntry, LedgerAccount, LedgerBatch, SettlementStore, TransactionStore,
};

use crate::config::EngineConfig;
use crate::metrics::{Metrics, SharedMetrics};

/// Run a store call, failing with `StoreUnavailable` once `limit` elapses.
pub(crate) async fn bounded<T, F>(limit: Duration, operation: &'static str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(LedgerError::StoreUnavailable(format!(
            "{} timed out after {}ms",
            operation,
            limit.as_millis()
        ))),
    }
}

/// Ledger postings produced by approving `transaction`.
///
/// | type       | cash            | holding           |
/// |------------|-----------------|-------------------|
/// | buy        |                 | +quantity         |
/// | sell       | +quantity*price | -quantity         |
/// | deposit    | +quantity*price |                   |
/// | withdrawal |                 | -(quantity + fee) |
pub fn settlement_batch(transaction: &Transaction, fee_rate: FeeRate) -> Result<LedgerBatch> {
    let user = &transaction.user_id;
    let mut batch = LedgerBatch::new(transaction.id);

    match &transaction.kind {
        TransactionKind::Buy { asset_id, quantity } => {
            batch.add(LedgerAccount::holding(user.clone(), asset_id.clone()), *quantity);
        }
        TransactionKind::Sell {
            asset_id,
            quantity,
            price,
        } => {
            batch.add(LedgerAccount::holding(user.clone(), asset_id.clone()), -*quantity);
            batch.add(LedgerAccount::cash(user.clone()), notional(*quantity, *price)?);
        }
        TransactionKind::Deposit {
            quantity, price, ..
        } => {
            batch.add(LedgerAccount::cash(user.clone()), notional(*quantity, *price)?);
        }
        TransactionKind::Withdrawal { asset_id, quantity } => {
            batch.add(
                LedgerAccount::holding(user.clone(), asset_id.clone()),
                -fee_rate.gross(*quantity)?,
            );
        }
    }

    Ok(batch)
}

/// Proof of an applied settlement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettlementReceipt {
    pub transaction_id: TransactionId,
    pub user_id: UserId,
    pub transaction_type: TransactionType,
    /// Withdrawal fee debited with the holding; zero for other types.
    pub fee: Decimal,
    /// Postings as applied, with resulting balances.
    pub entries: Vec<JournalEntry>,
}

/// Applies administrative decisions to pending transactions.
///
/// The status compare-and-set inside the store commit decides every race: the
/// winner applies the ledger effects, everyone else gets `InvalidState`.
pub struct SettlementEngine {
    store: Arc<dyn SettlementStore>,
    config: EngineConfig,
    metrics: SharedMetrics,
}

impl SettlementEngine {
    pub fn new(store: Arc<dyn SettlementStore>, config: EngineConfig) -> Self {
        Self::with_metrics(store, config, Arc::new(Metrics::new()))
    }

    /// Create an engine reporting into shared `metrics`.
    pub fn with_metrics(
        store: Arc<dyn SettlementStore>,
        config: EngineConfig,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            store,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<dyn SettlementStore> {
        &self.store
    }

    /// Approve a pending transaction and apply its ledger effects.
    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    pub async fn approve(&self, transaction_id: TransactionId) -> Result<SettlementReceipt> {
        let result = self.try_approve(transaction_id).await;
        match &result {
            Ok(receipt) => {
                self.metrics.approved();
                info!(
                    transaction_id = %transaction_id,
                    user = %receipt.user_id,
                    transaction_type = %receipt.transaction_type,
                    postings = receipt.entries.len(),
                    "Transaction approved"
                );
            }
            Err(e) => self.observe_failure(transaction_id, "approve", e),
        }
        result
    }

    async fn try_approve(&self, transaction_id: TransactionId) -> Result<SettlementReceipt> {
        let limit = self.config.store_timeout;
        let transaction = bounded(limit, "get transaction", self.store.get(transaction_id)).await?;

        if !transaction.is_pending() {
            return Err(LedgerError::InvalidState {
                transaction_id,
                status: transaction.status,
            });
        }

        let fee_rate = self.config.withdrawal_fee_rate;
        let batch = settlement_batch(&transaction, fee_rate)?;
        let fee = match transaction.kind {
            TransactionKind::Withdrawal { quantity, .. } => fee_rate.fee_on(quantity)?,
            _ => Decimal::ZERO,
        };

        let outcome = bounded(
            limit,
            "commit settlement",
            self.store.commit(
                &batch,
                TransactionStatus::Pending,
                TransactionStatus::Completed,
            ),
        )
        .await?;

        match outcome {
            CommitOutcome::Committed(entries) => Ok(SettlementReceipt {
                transaction_id,
                user_id: transaction.user_id,
                transaction_type: transaction.kind.transaction_type(),
                fee,
                entries,
            }),
            CommitOutcome::StatusMismatch(status) => Err(LedgerError::InvalidState {
                transaction_id,
                status,
            }),
        }
    }

    /// Cancel a pending transaction. The ledger is never touched.
    pub async fn cancel(&self, transaction_id: TransactionId) -> Result<()> {
        self.cancel_with_reason(transaction_id, None).await
    }

    /// Cancel a pending transaction, recording why.
    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    pub async fn cancel_with_reason(
        &self,
        transaction_id: TransactionId,
        reason: Option<&str>,
    ) -> Result<()> {
        let reason = reason.map(str::trim).filter(|r| !r.is_empty());
        let result = self.try_cancel(transaction_id, reason).await;
        match &result {
            Ok(()) => {
                self.metrics.cancelled();
                info!(transaction_id = %transaction_id, reason = ?reason, "Transaction cancelled");
            }
            Err(e) => self.observe_failure(transaction_id, "cancel", e),
        }
        result
    }

    async fn try_cancel(&self, transaction_id: TransactionId, reason: Option<&str>) -> Result<()> {
        let limit = self.config.store_timeout;
        let swapped = bounded(
            limit,
            "cancel transaction",
            self.store.compare_and_set_status_with_note(
                transaction_id,
                TransactionStatus::Pending,
                TransactionStatus::Cancelled,
                reason,
            ),
        )
        .await?;

        if swapped {
            return Ok(());
        }

        let current = bounded(limit, "get transaction", self.store.get(transaction_id)).await?;
        Err(LedgerError::InvalidState {
            transaction_id,
            status: current.status,
        })
    }

    fn observe_failure(&self, transaction_id: TransactionId, action: &str, err: &LedgerError) {
        match err {
            LedgerError::InvalidState { status, .. } => {
                self.metrics.rejected_state();
                warn!(transaction_id = %transaction_id, action, status = %status, "Transaction already settled");
            }
            LedgerError::InsufficientBalance { account, required, available } => {
                self.metrics.rejected_insufficient();
                warn!(
                    transaction_id = %transaction_id,
                    action,
                    account = %account,
                    %required,
                    %available,
                    "Settlement rejected"
                );
            }
            LedgerError::StoreUnavailable(message) => {
                self.metrics.store_failure();
                error!(transaction_id = %transaction_id, action, error = %message, "Store failure");
            }
            LedgerError::Validation { .. } | LedgerError::NotFound(_) => {
                warn!(transaction_id = %transaction_id, action, error = %err, "Settlement refused");
            }
        }
    }
}
