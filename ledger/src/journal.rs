//! Ledger postings and the journal of applied changes.

use std::fmt;

use chrono::{DateTime, Utc};
use cryptoledger_common::{AssetId, ShortAccount, TransactionId, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An account a posting can move.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LedgerAccount {
    /// A user's cash balance.
    Cash { user_id: UserId },
    /// A user's holding of one asset.
    Holding { user_id: UserId, asset_id: AssetId },
}

impl LedgerAccount {
    pub fn cash(user_id: UserId) -> Self {
        LedgerAccount::Cash { user_id }
    }

    pub fn holding(user_id: UserId, asset_id: AssetId) -> Self {
        LedgerAccount::Holding { user_id, asset_id }
    }

    pub fn user_id(&self) -> &UserId {
        match self {
            LedgerAccount::Cash { user_id } | LedgerAccount::Holding { user_id, .. } => user_id,
        }
    }

    /// The account as named in an insufficient-balance error.
    pub fn short(&self) -> ShortAccount {
        match self {
            LedgerAccount::Cash { user_id } => ShortAccount::Cash(user_id.clone()),
            LedgerAccount::Holding { user_id, asset_id } => {
                ShortAccount::Holding(user_id.clone(), asset_id.clone())
            }
        }
    }
}

impl fmt::Display for LedgerAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerAccount::Cash { user_id } => write!(f, "{}:cash", user_id),
            LedgerAccount::Holding { user_id, asset_id } => write!(f, "{}:{}", user_id, asset_id),
        }
    }
}

/// A signed change to one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub account: LedgerAccount,
    /// Positive credits, negative debits.
    pub delta: Decimal,
}

/// Postings that must be committed together with a status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerBatch {
    /// Transaction being settled.
    pub transaction_id: TransactionId,
    /// Postings in application order.
    pub postings: Vec<Posting>,
}

impl LedgerBatch {
    /// Create a new batch.
    pub fn new(transaction_id: TransactionId) -> Self {
        Self {
            transaction_id,
            postings: Vec::new(),
        }
    }

    /// Add a posting; zero deltas are skipped.
    pub fn add(&mut self, account: LedgerAccount, delta: Decimal) {
        if !delta.is_zero() {
            self.postings.push(Posting { account, delta });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.postings.is_empty()
    }

    /// Net change the batch makes to `account`.
    pub fn net_delta(&self, account: &LedgerAccount) -> Decimal {
        self.postings
            .iter()
            .filter(|p| &p.account == account)
            .map(|p| p.delta)
            .sum()
    }

    /// Total cash credited minus debited.
    pub fn net_cash(&self) -> Decimal {
        self.postings
            .iter()
            .filter(|p| matches!(p.account, LedgerAccount::Cash { .. }))
            .map(|p| p.delta)
            .sum()
    }
}

/// A posting as applied, with the resulting balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Unique entry ID.
    pub id: Uuid,
    /// Transaction this entry settles.
    pub transaction_id: TransactionId,
    /// Account affected.
    pub account: LedgerAccount,
    /// Signed change.
    pub delta: Decimal,
    /// Balance after this entry.
    pub balance_after: Decimal,
    /// When this entry was created.
    pub created_at: DateTime<Utc>,
}

impl JournalEntry {
    pub fn new(transaction_id: TransactionId, posting: &Posting, balance_after: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            transaction_id,
            account: posting.account.clone(),
            delta: posting.delta,
            balance_after,
            created_at: Utc::now(),
        }
    }

    pub fn is_credit(&self) -> bool {
        self.delta > Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_batch_nets() {
        let transaction_id = TransactionId::new();
        let user = UserId::new("1");
        let btc = LedgerAccount::holding(user.clone(), AssetId::new("bitcoin"));

        let mut batch = LedgerBatch::new(transaction_id);
        batch.add(LedgerAccount::cash(user.clone()), dec!(10000));
        batch.add(btc.clone(), dec!(-0.2));
        batch.add(btc.clone(), Decimal::ZERO);

        assert_eq!(batch.postings.len(), 2);
        assert_eq!(batch.net_cash(), dec!(10000));
        assert_eq!(batch.net_delta(&btc), dec!(-0.2));
    }

    #[test]
    fn test_empty_batch() {
        let mut batch = LedgerBatch::new(TransactionId::new());
        batch.add(LedgerAccount::cash(UserId::new("1")), Decimal::ZERO);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_account_display() {
        let user = UserId::new("7");
        assert_eq!(LedgerAccount::cash(user.clone()).to_string(), "7:cash");
        assert_eq!(
            LedgerAccount::holding(user, AssetId::new("ETH")).to_string(),
            "7:eth"
        );
    }
}
