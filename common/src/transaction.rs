//! Transaction types and state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{AssetId, TransactionId, UserId};

/// Transaction status representing the lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    /// Submitted and awaiting an administrative decision.
    Pending,
    /// Approved; ledger effects applied.
    Completed,
    /// Cancelled; never affects the ledger.
    Cancelled,
}

impl TransactionStatus {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed | TransactionStatus::Cancelled
        )
    }

    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[TransactionStatus] {
        match self {
            TransactionStatus::Pending => {
                &[TransactionStatus::Completed, TransactionStatus::Cancelled]
            }
            TransactionStatus::Completed => &[],
            TransactionStatus::Cancelled => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(TransactionStatus::Pending),
            "completed" => Ok(TransactionStatus::Completed),
            "cancelled" => Ok(TransactionStatus::Cancelled),
            other => Err(format!("unknown transaction status '{}'", other)),
        }
    }
}

/// Request type as named by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Buy,
    Sell,
    Deposit,
    Withdrawal,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Buy => "buy",
            TransactionType::Sell => "sell",
            TransactionType::Deposit => "deposit",
            TransactionType::Withdrawal => "withdrawal",
        }
    }

    /// Buy and sell orders require a tradable asset.
    pub fn requires_tradable_asset(&self) -> bool {
        matches!(self, TransactionType::Buy | TransactionType::Sell)
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" => Ok(TransactionType::Buy),
            "sell" => Ok(TransactionType::Sell),
            "deposit" => Ok(TransactionType::Deposit),
            "withdrawal" => Ok(TransactionType::Withdrawal),
            other => Err(format!("unknown transaction type '{}'", other)),
        }
    }
}

/// What a transaction does, with exactly the fields its settlement uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransactionKind {
    /// Credit `quantity` units of the asset.
    Buy { asset_id: AssetId, quantity: Decimal },
    /// Debit `quantity` units and credit their value in cash.
    Sell {
        asset_id: AssetId,
        quantity: Decimal,
        price: Decimal,
    },
    /// Credit the cash value of `quantity` units.
    Deposit {
        asset_id: AssetId,
        quantity: Decimal,
        price: Decimal,
    },
    /// Debit `quantity` units plus the withdrawal fee.
    Withdrawal { asset_id: AssetId, quantity: Decimal },
}

impl TransactionKind {
    /// Build the variant for `kind`; `price` is dropped by variants that do not use it.
    pub fn new(kind: TransactionType, asset_id: AssetId, quantity: Decimal, price: Decimal) -> Self {
        match kind {
            TransactionType::Buy => TransactionKind::Buy { asset_id, quantity },
            TransactionType::Sell => TransactionKind::Sell {
                asset_id,
                quantity,
                price,
            },
            TransactionType::Deposit => TransactionKind::Deposit {
                asset_id,
                quantity,
                price,
            },
            TransactionType::Withdrawal => TransactionKind::Withdrawal { asset_id, quantity },
        }
    }

    pub fn transaction_type(&self) -> TransactionType {
        match self {
            TransactionKind::Buy { .. } => TransactionType::Buy,
            TransactionKind::Sell { .. } => TransactionType::Sell,
            TransactionKind::Deposit { .. } => TransactionType::Deposit,
            TransactionKind::Withdrawal { .. } => TransactionType::Withdrawal,
        }
    }

    pub fn asset_id(&self) -> &AssetId {
        match self {
            TransactionKind::Buy { asset_id, .. }
            | TransactionKind::Sell { asset_id, .. }
            | TransactionKind::Deposit { asset_id, .. }
            | TransactionKind::Withdrawal { asset_id, .. } => asset_id,
        }
    }

    pub fn quantity(&self) -> Decimal {
        match self {
            TransactionKind::Buy { quantity, .. }
            | TransactionKind::Sell { quantity, .. }
            | TransactionKind::Deposit { quantity, .. }
            | TransactionKind::Withdrawal { quantity, .. } => *quantity,
        }
    }
}

/// A transaction request and its settlement state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique transaction identifier.
    pub id: TransactionId,
    /// Owning user.
    pub user_id: UserId,
    /// Type-specific payload.
    pub kind: TransactionKind,
    /// Quote price at submission time.
    pub quote_price: Decimal,
    /// Destination or source address. Advisory only.
    pub wallet: String,
    /// Current status.
    pub status: TransactionStatus,
    /// Reason given when the transaction was cancelled.
    pub cancellation_reason: Option<String>,
    /// When the request was submitted.
    pub created_at: DateTime<Utc>,
    /// When the status last changed.
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Create a new pending transaction.
    pub fn new(user_id: UserId, kind: TransactionKind, quote_price: Decimal, wallet: String) -> Self {
        let now = Utc::now();
        Self {
            id: TransactionId::new(),
            user_id,
            kind,
            quote_price,
            wallet,
            status: TransactionStatus::Pending,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Transition to a new status.
    pub fn transition_to(&mut self, new_status: TransactionStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(new_status) {
            return Err(InvalidTransition {
                from: self.status,
                to: new_status,
            });
        }

        self.status = new_status;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn transaction_type(&self) -> TransactionType {
        self.kind.transaction_type()
    }

    pub fn asset_id(&self) -> &AssetId {
        self.kind.asset_id()
    }

    pub fn quantity(&self) -> Decimal {
        self.kind.quantity()
    }

    pub fn is_pending(&self) -> bool {
        self.status == TransactionStatus::Pending
    }
}

/// Selection criteria for transaction listings. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionFilter {
    pub user_id: Option<UserId>,
    pub status: Option<TransactionStatus>,
    pub transaction_type: Option<TransactionType>,
}

impl TransactionFilter {
    /// All transactions of one user.
    pub fn for_user(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: TransactionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_type(mut self, transaction_type: TransactionType) -> Self {
        self.transaction_type = Some(transaction_type);
        self
    }

    pub fn matches(&self, transaction: &Transaction) -> bool {
        self.user_id
            .as_ref()
            .map_or(true, |user| *user == transaction.user_id)
            && self.status.map_or(true, |s| s == transaction.status)
            && self
                .transaction_type
                .map_or(true, |t| t == transaction.transaction_type())
    }
}

/// Error when attempting invalid state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: TransactionStatus,
    pub to: TransactionStatus,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid state transition from {} to {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}
