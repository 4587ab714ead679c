//! PostgreSQL ledger backend.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Row};
use tracing::{info, instrument};
use uuid::Uuid;

use cryptoledger_common::{
    AssetId, Entity, LedgerError, Result, ShortAccount, Transaction, TransactionFilter,
    TransactionId, TransactionKind, TransactionStatus, TransactionType, UserId,
};

use crate::balance::Holding;
use crate::journal::{JournalEntry, LedgerAccount, LedgerBatch};
use crate::store::{CommitOutcome, LedgerStore, SettlementStore, TransactionStore};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS cash_accounts (
        user_id TEXT PRIMARY KEY,
        balance NUMERIC NOT NULL DEFAULT 0 CHECK (balance >= 0),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS holdings (
        user_id TEXT NOT NULL REFERENCES cash_accounts (user_id),
        asset_id TEXT NOT NULL,
        amount NUMERIC NOT NULL CHECK (amount >= 0),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (user_id, asset_id)
    )",
    "CREATE TABLE IF NOT EXISTS transactions (
        id UUID PRIMARY KEY,
        user_id TEXT NOT NULL,
        type TEXT NOT NULL,
        asset_id TEXT NOT NULL,
        quantity NUMERIC NOT NULL CHECK (quantity >= 0),
        price NUMERIC,
        quote_price NUMERIC NOT NULL,
        wallet TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL,
        cancellation_reason TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS transactions_user_idx ON transactions (user_id, created_at)",
    "CREATE TABLE IF NOT EXISTS ledger_journal (
        id UUID PRIMARY KEY,
        transaction_id UUID NOT NULL REFERENCES transactions (id),
        user_id TEXT NOT NULL,
        asset_id TEXT,
        delta NUMERIC NOT NULL,
        balance_after NUMERIC NOT NULL CHECK (balance_after >= 0),
        created_at TIMESTAMPTZ NOT NULL
    )",
];

const TRANSACTION_COLUMNS: &str = "id, user_id, type, asset_id, quantity, price, quote_price, \
     wallet, status, cancellation_reason, created_at, updated_at";

fn store_error(err: sqlx::Error) -> LedgerError {
    LedgerError::StoreUnavailable(err.to_string())
}

fn corrupt(column: &str, message: impl std::fmt::Display) -> LedgerError {
    LedgerError::StoreUnavailable(format!("corrupt {} column: {}", column, message))
}

/// Ledger backed by PostgreSQL. Each settlement runs in one database transaction.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a pool to `database_url`.
    pub async fn connect(database_url: &str, acquire_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .map_err(store_error)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables if they do not exist.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(store_error)?;
        }
        info!("Ledger schema ready");
        Ok(())
    }

    async fn cash_in(conn: &mut PgConnection, user_id: &UserId, delta: Decimal) -> Result<Decimal> {
        let updated = sqlx::query(
            "UPDATE cash_accounts SET balance = balance + $2, updated_at = now()
             WHERE user_id = $1 AND balance + $2 >= 0
             RETURNING balance",
        )
        .bind(user_id.as_str())
        .bind(delta)
        .fetch_optional(&mut *conn)
        .await
        .map_err(store_error)?;

        if let Some(row) = updated {
            return row.try_get("balance").map_err(store_error);
        }

        let available: Option<Decimal> =
            sqlx::query_scalar("SELECT balance FROM cash_accounts WHERE user_id = $1")
                .bind(user_id.as_str())
                .fetch_optional(&mut *conn)
                .await
                .map_err(store_error)?;

        match available {
            None => Err(LedgerError::NotFound(Entity::User(user_id.clone()))),
            Some(available) => Err(LedgerError::InsufficientBalance {
                account: ShortAccount::Cash(user_id.clone()),
                required: -delta,
                available,
            }),
        }
    }

    async fn holding_in(
        conn: &mut PgConnection,
        user_id: &UserId,
        asset_id: &AssetId,
        delta: Decimal,
    ) -> Result<Decimal> {
        Self::user_exists(conn, user_id).await?;

        if delta >= Decimal::ZERO {
            return sqlx::query_scalar(
                "INSERT INTO holdings (user_id, asset_id, amount) VALUES ($1, $2, $3)
                 ON CONFLICT (user_id, asset_id)
                 DO UPDATE SET amount = holdings.amount + EXCLUDED.amount, updated_at = now()
                 RETURNING amount",
            )
            .bind(user_id.as_str())
            .bind(asset_id.as_str())
            .bind(delta)
            .fetch_one(&mut *conn)
            .await
            .map_err(store_error);
        }

        let updated: Option<Decimal> = sqlx::query_scalar(
            "UPDATE holdings SET amount = amount + $3, updated_at = now()
             WHERE user_id = $1 AND asset_id = $2 AND amount + $3 >= 0
             RETURNING amount",
        )
        .bind(user_id.as_str())
        .bind(asset_id.as_str())
        .bind(delta)
        .fetch_optional(&mut *conn)
        .await
        .map_err(store_error)?;

        if let Some(amount) = updated {
            return Ok(amount);
        }

        let available = Self::holding_row(conn, user_id, asset_id).await?;
        Err(LedgerError::InsufficientBalance {
            account: ShortAccount::Holding(user_id.clone(), asset_id.clone()),
            required: -delta,
            available,
        })
    }

    async fn user_exists(conn: &mut PgConnection, user_id: &UserId) -> Result<()> {
        let found: Option<i32> = sqlx::query_scalar("SELECT 1 FROM cash_accounts WHERE user_id = $1")
            .bind(user_id.as_str())
            .fetch_optional(&mut *conn)
            .await
            .map_err(store_error)?;
        found
            .map(|_| ())
            .ok_or_else(|| LedgerError::NotFound(Entity::User(user_id.clone())))
    }

    async fn holding_row(
        conn: &mut PgConnection,
        user_id: &UserId,
        asset_id: &AssetId,
    ) -> Result<Decimal> {
        let amount: Option<Decimal> =
            sqlx::query_scalar("SELECT amount FROM holdings WHERE user_id = $1 AND asset_id = $2")
                .bind(user_id.as_str())
                .bind(asset_id.as_str())
                .fetch_optional(&mut *conn)
                .await
                .map_err(store_error)?;
        Ok(amount.unwrap_or(Decimal::ZERO))
    }

    async fn status_of(conn: &mut PgConnection, id: TransactionId) -> Result<TransactionStatus> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM transactions WHERE id = $1")
            .bind(*id.as_uuid())
            .fetch_optional(&mut *conn)
            .await
            .map_err(store_error)?;
        status
            .ok_or(LedgerError::NotFound(Entity::Transaction(id)))?
            .parse::<TransactionStatus>()
            .map_err(|e| corrupt("status", e))
    }

    async fn post(conn: &mut PgConnection, account: &LedgerAccount, delta: Decimal) -> Result<Decimal> {
        match account {
            LedgerAccount::Cash { user_id } => Self::cash_in(conn, user_id, delta).await,
            LedgerAccount::Holding { user_id, asset_id } => {
                Self::holding_in(conn, user_id, asset_id, delta).await
            }
        }
    }
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction> {
    let id: Uuid = row.try_get("id").map_err(store_error)?;
    let user_id: String = row.try_get("user_id").map_err(store_error)?;
    let kind: String = row.try_get("type").map_err(store_error)?;
    let asset_id: String = row.try_get("asset_id").map_err(store_error)?;
    let quantity: Decimal = row.try_get("quantity").map_err(store_error)?;
    let price: Option<Decimal> = row.try_get("price").map_err(store_error)?;
    let status: String = row.try_get("status").map_err(store_error)?;

    let kind = kind
        .parse::<TransactionType>()
        .map_err(|e| corrupt("type", e))?;
    let status = status
        .parse::<TransactionStatus>()
        .map_err(|e| corrupt("status", e))?;

    Ok(Transaction {
        id: TransactionId::from_uuid(id),
        user_id: UserId::new(user_id),
        kind: TransactionKind::new(
            kind,
            AssetId::new(asset_id),
            quantity,
            price.unwrap_or(Decimal::ZERO),
        ),
        quote_price: row.try_get("quote_price").map_err(store_error)?,
        wallet: row.try_get("wallet").map_err(store_error)?,
        status,
        cancellation_reason: row.try_get("cancellation_reason").map_err(store_error)?,
        created_at: row.try_get("created_at").map_err(store_error)?,
        updated_at: row.try_get("updated_at").map_err(store_error)?,
    })
}

fn journal_from_row(row: &PgRow) -> Result<JournalEntry> {
    let user_id = UserId::new(row.try_get::<String, _>("user_id").map_err(store_error)?);
    let asset_id: Option<String> = row.try_get("asset_id").map_err(store_error)?;
    let account = match asset_id {
        Some(asset_id) => LedgerAccount::holding(user_id, AssetId::new(asset_id)),
        None => LedgerAccount::cash(user_id),
    };

    Ok(JournalEntry {
        id: row.try_get("id").map_err(store_error)?,
        transaction_id: TransactionId::from_uuid(row.try_get("transaction_id").map_err(store_error)?),
        account,
        delta: row.try_get("delta").map_err(store_error)?,
        balance_after: row.try_get("balance_after").map_err(store_error)?,
        created_at: row.try_get("created_at").map_err(store_error)?,
    })
}

/// Stored price column: `None` for variants that carry no price.
fn price_column(kind: &TransactionKind) -> Option<Decimal> {
    match kind {
        TransactionKind::Sell { price, .. } | TransactionKind::Deposit { price, .. } => Some(*price),
        TransactionKind::Buy { .. } | TransactionKind::Withdrawal { .. } => None,
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn open_account(&self, user_id: &UserId) -> Result<()> {
        sqlx::query("INSERT INTO cash_accounts (user_id) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(user_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn get_balance(&self, user_id: &UserId) -> Result<Decimal> {
        let balance: Option<Decimal> =
            sqlx::query_scalar("SELECT balance FROM cash_accounts WHERE user_id = $1")
                .bind(user_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(store_error)?;
        balance.ok_or_else(|| LedgerError::NotFound(Entity::User(user_id.clone())))
    }

    #[instrument(skip(self))]
    async fn adjust_balance(&self, user_id: &UserId, delta: Decimal) -> Result<Decimal> {
        let mut conn = self.pool.acquire().await.map_err(store_error)?;
        Self::cash_in(&mut conn, user_id, delta).await
    }

    async fn get_holding(&self, user_id: &UserId, asset_id: &AssetId) -> Result<Decimal> {
        let mut conn = self.pool.acquire().await.map_err(store_error)?;
        Self::user_exists(&mut conn, user_id).await?;
        Self::holding_row(&mut conn, user_id, asset_id).await
    }

    #[instrument(skip(self))]
    async fn adjust_holding(
        &self,
        user_id: &UserId,
        asset_id: &AssetId,
        delta: Decimal,
    ) -> Result<Decimal> {
        let mut conn = self.pool.acquire().await.map_err(store_error)?;
        Self::holding_in(&mut conn, user_id, asset_id, delta).await
    }

    async fn holdings(&self, user_id: &UserId) -> Result<Vec<Holding>> {
        let mut conn = self.pool.acquire().await.map_err(store_error)?;
        Self::user_exists(&mut conn, user_id).await?;

        let rows = sqlx::query(
            "SELECT asset_id, amount, updated_at FROM holdings
             WHERE user_id = $1 ORDER BY asset_id",
        )
        .bind(user_id.as_str())
        .fetch_all(&mut *conn)
        .await
        .map_err(store_error)?;

        rows.iter()
            .map(|row| {
                Ok(Holding {
                    user_id: user_id.clone(),
                    asset_id: AssetId::new(row.try_get::<String, _>("asset_id").map_err(store_error)?),
                    amount: row.try_get("amount").map_err(store_error)?,
                    updated_at: row.try_get("updated_at").map_err(store_error)?,
                })
            })
            .collect()
    }

    async fn journal(&self, transaction_id: TransactionId) -> Result<Vec<JournalEntry>> {
        let rows = sqlx::query(
            "SELECT id, transaction_id, user_id, asset_id, delta, balance_after, created_at
             FROM ledger_journal WHERE transaction_id = $1 ORDER BY created_at, id",
        )
        .bind(*transaction_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.iter().map(journal_from_row).collect()
    }
}

#[async_trait]
impl TransactionStore for PgStore {
    async fn get(&self, id: TransactionId) -> Result<Transaction> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(*id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?
        .ok_or(LedgerError::NotFound(Entity::Transaction(id)))?;

        transaction_from_row(&row)
    }

    async fn insert(&self, record: Transaction) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO transactions ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            TRANSACTION_COLUMNS
        ))
        .bind(*record.id.as_uuid())
        .bind(record.user_id.as_str())
        .bind(record.transaction_type().as_str())
        .bind(record.asset_id().as_str())
        .bind(record.quantity())
        .bind(price_column(&record.kind))
        .bind(record.quote_price)
        .bind(&record.wallet)
        .bind(record.status.as_str())
        .bind(&record.cancellation_reason)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => LedgerError::validation(
                "id",
                format!("transaction {} already exists", record.id),
            ),
            _ => store_error(e),
        })?;
        Ok(())
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

        let mut conn = self.pool.acquire().await.map_err(store_error)?;
        let result = sqlx::query(
            "UPDATE transactions
             SET status = $3, cancellation_reason = COALESCE($4, cancellation_reason), updated_at = now()
             WHERE id = $1 AND status = $2",
        )
        .bind(*id.as_uuid())
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(note)
        .execute(&mut *conn)
        .await
        .map_err(store_error)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        // Distinguishes a lost race from a missing row.
        Self::status_of(&mut conn, id).await?;
        Ok(false)
    }

    async fn list(&self, filter: &TransactionFilter) -> Result<Vec<Transaction>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM transactions
             WHERE ($1::TEXT IS NULL OR user_id = $1)
               AND ($2::TEXT IS NULL OR status = $2)
               AND ($3::TEXT IS NULL OR type = $3)
             ORDER BY created_at, id",
            TRANSACTION_COLUMNS
        ))
        .bind(filter.user_id.as_ref().map(|u| u.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.transaction_type.map(|t| t.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.iter().map(transaction_from_row).collect()
    }
}

#[async_trait]
impl SettlementStore for PgStore {
    #[instrument(skip(self, batch), fields(transaction_id = %batch.transaction_id))]
    async fn commit(
        &self,
        batch: &LedgerBatch,
        expected: TransactionStatus,
        next: TransactionStatus,
    ) -> Result<CommitOutcome> {
        let id = batch.transaction_id;
        if !expected.can_transition_to(next) {
            return Err(LedgerError::InvalidState {
                transaction_id: id,
                status: expected,
            });
        }

        let mut tx = self.pool.begin().await.map_err(store_error)?;

        let claimed = sqlx::query(
            "UPDATE transactions SET status = $3, updated_at = now()
             WHERE id = $1 AND status = $2",
        )
        .bind(*id.as_uuid())
        .bind(expected.as_str())
        .bind(next.as_str())
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;

        if claimed.rows_affected() == 0 {
            let current = Self::status_of(&mut tx, id).await?;
            tx.rollback().await.map_err(store_error)?;
            return Ok(CommitOutcome::StatusMismatch(current));
        }

        let mut entries = Vec::with_capacity(batch.postings.len());
        for posting in &batch.postings {
            // Dropping `tx` on error rolls back the status change and earlier postings.
            let balance_after = Self::post(&mut tx, &posting.account, posting.delta).await?;
            entries.push(JournalEntry::new(id, posting, balance_after));
        }

        for entry in &entries {
            let asset_id = match &entry.account {
                LedgerAccount::Cash { .. } => None,
                LedgerAccount::Holding { asset_id, .. } => Some(asset_id.as_str()),
            };
            sqlx::query(
                "INSERT INTO ledger_journal
                 (id, transaction_id, user_id, asset_id, delta, balance_after, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(entry.id)
            .bind(*id.as_uuid())
            .bind(entry.account.user_id().as_str())
            .bind(asset_id)
            .bind(entry.delta)
            .bind(entry.balance_after)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        }

        tx.commit().await.map_err(store_error)?;

        info!(
            transaction_id = %id,
            status = %next,
            postings = entries.len(),
            "Settlement committed"
        );

        Ok(CommitOutcome::Committed(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_price_column() {
        let sell = TransactionKind::Sell {
            asset_id: AssetId::new("bitcoin"),
            quantity: dec!(0.2),
            price: dec!(50000),
        };
        let buy = TransactionKind::Buy {
            asset_id: AssetId::new("bitcoin"),
            quantity: dec!(2),
        };
        assert_eq!(price_column(&sell), Some(dec!(50000)));
        assert_eq!(price_column(&buy), None);
    }

    #[test]
    fn test_store_error_is_retryable() {
        let err = store_error(sqlx::Error::PoolTimedOut);
        assert!(err.is_retryable());
        assert_eq!(err.error_code(), "STORE_UNAVAILABLE");
    }

    #[test]
    fn test_schema_guards_non_negative() {
        let guarded = SCHEMA.iter().filter(|s| s.contains(">= 0")).count();
        assert_eq!(guarded, 4);
    }
}
