//! Error types for ledger operations.

use std::fmt;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::{AssetId, TransactionId, TransactionStatus, UserId};

/// The entity a lookup failed to find.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    User(UserId),
    Asset(AssetId),
    Transaction(TransactionId),
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::User(id) => write!(f, "user {}", id),
            Entity::Asset(id) => write!(f, "asset {}", id),
            Entity::Transaction(id) => write!(f, "transaction {}", id),
        }
    }
}

/// The ledger account that could not cover a debit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShortAccount {
    Cash(UserId),
    Holding(UserId, AssetId),
}

impl fmt::Display for ShortAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShortAccount::Cash(user) => write!(f, "cash balance of {}", user),
            ShortAccount::Holding(user, asset) => write!(f, "{} holding of {}", asset, user),
        }
    }
}

/// Main error type for ledger operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    /// Malformed or missing input. Never persisted.
    #[error("Invalid {field}: {message}")]
    Validation { message: String, field: String },

    /// Unknown user, asset or transaction.
    #[error("Not found: {0}")]
    NotFound(Entity),

    /// Transition attempted on a transaction that is no longer pending.
    #[error("Transaction {transaction_id} is {status}, expected pending")]
    InvalidState {
        transaction_id: TransactionId,
        status: TransactionStatus,
    },

    /// Settlement would drive a balance or holding below zero.
    #[error("Insufficient balance in {account}: required {required}, available {available}")]
    InsufficientBalance {
        account: ShortAccount,
        required: Decimal,
        available: Decimal,
    },

    /// Durable store unreachable, timed out, or a mutation failed.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}

impl LedgerError {
    /// Create a validation error for a field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        LedgerError::Validation {
            message: message.into(),
            field: field.into(),
        }
    }

    /// Check if this error is retryable.
    ///
    /// Only store faults are transient; state and balance rejections are final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::StoreUnavailable(_))
    }

    /// Get error code for the administrative and intake callers.
    pub fn error_code(&self) -> &'static str {
        match self {
            LedgerError::Validation { .. } => "VALIDATION_ERROR",
            LedgerError::NotFound(_) => "NOT_FOUND",
            LedgerError::InvalidState { .. } => "INVALID_STATE",
            LedgerError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            LedgerError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
        }
    }
}

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
