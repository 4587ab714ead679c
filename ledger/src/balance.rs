//! Cash balances and crypto holdings.

use chrono::{DateTime, Utc};
use cryptoledger_common::{is_dust, AssetId, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A user's cash balance at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CashBalance {
    /// Account owner.
    pub user_id: UserId,
    /// Spendable cash. Never negative.
    pub balance: Decimal,
    /// When this balance was last updated.
    pub updated_at: DateTime<Utc>,
}

impl CashBalance {
    /// Create a new zero balance.
    pub fn zero(user_id: UserId) -> Self {
        Self {
            user_id,
            balance: Decimal::ZERO,
            updated_at: Utc::now(),
        }
    }

    /// Check if the balance covers a debit of `amount`.
    pub fn has_sufficient_funds(&self, amount: Decimal) -> bool {
        self.balance >= amount
    }
}

/// Quantity of one asset held by one user.
///
/// Rows are kept at zero rather than deleted so a later credit never races a
/// re-creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holding {
    pub user_id: UserId,
    pub asset_id: AssetId,
    /// Held quantity. Never negative.
    pub amount: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Holding {
    pub fn new(user_id: UserId, asset_id: AssetId, amount: Decimal) -> Self {
        Self {
            user_id,
            asset_id,
            amount,
            updated_at: Utc::now(),
        }
    }

    /// Whether the holding should appear in listings.
    pub fn is_visible(&self, threshold: Decimal) -> bool {
        !is_dust(self.amount, threshold)
    }
}
