//! User accounts known to the ledger.

use chrono::{DateTime, Utc};
use cryptoledger_common::UserId;
use serde::{Deserialize, Serialize};

/// Account role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Regular customer; submits requests.
    User,
    /// Administrator; approves or cancels requests.
    Admin,
}

/// A ledger user. Identity fields are owned by the auth collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Unique user identifier.
    pub id: UserId,
    /// Display name.
    pub name: String,
    /// Account role.
    pub role: Role,
    /// When the account was created.
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Create a regular user.
    pub fn new(id: impl Into<UserId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: Role::User,
            created_at: Utc::now(),
        }
    }

    /// Create an administrator.
    pub fn admin(id: impl Into<UserId>, name: impl Into<String>) -> Self {
        Self {
            role: Role::Admin,
            ..Self::new(id, name)
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}
