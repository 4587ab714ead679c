//! CryptoLedger Common Types
//!
//! Shared types used across the ledger workspace: identifiers, decimal
//! handling, the transaction record with its status state machine, and the
//! error taxonomy returned to administrative and intake callers.

pub mod identifiers;
pub mod monetary;
pub mod transaction;
pub mod error;

pub use identifiers::*;
pub use monetary::*;
pub use transaction::*;
pub use error::*;
