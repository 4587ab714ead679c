//! Request intake: validates and records new pending transactions.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use cryptoledger_common::{
    parse_amount, AssetId, Entity, LedgerError, Result, Transaction, TransactionKind,
    TransactionType, UserId,
};
use cryptoledger_ledger::{LedgerStore, SettlementStore, TransactionStore};

use crate::config::EngineConfig;
use crate::directory::{AssetDirectory, UserDirectory};
use crate::engine::bounded;
use crate::metrics::{Metrics, SharedMetrics};
use crate::quote::QuoteCache;

/// A request as received from a caller, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitRequest {
    pub user_id: String,
    pub asset_id: String,
    /// `buy`, `sell`, `deposit` or `withdrawal`, any case.
    pub transaction_type: String,
    pub amount: String,
    pub price: String,
    #[serde(default)]
    pub wallet: String,
}

/// Fields of a request that passed validation.
struct Validated {
    user_id: UserId,
    asset_id: AssetId,
    transaction_type: TransactionType,
    amount: Decimal,
}

/// Creates pending transactions. Never touches balances or holdings.
///
/// Users must be known to the directory and have an open ledger account.
pub struct RequestIntake {
    store: Arc<dyn SettlementStore>,
    users: Arc<dyn UserDirectory>,
    assets: Arc<dyn AssetDirectory>,
    quotes: Option<Arc<QuoteCache>>,
    config: EngineConfig,
    metrics: SharedMetrics,
}

impl RequestIntake {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        users: Arc<dyn UserDirectory>,
        assets: Arc<dyn AssetDirectory>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            users,
            assets,
            quotes: None,
            config,
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Price market submissions from `quotes`.
    pub fn with_quotes(mut self, quotes: Arc<QuoteCache>) -> Self {
        self.quotes = Some(quotes);
        self
    }

    /// Report into shared `metrics`.
    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Validate a request and record it as pending.
    #[instrument(skip(self, request), fields(user = %request.user_id, transaction_type = %request.transaction_type))]
    pub async fn submit(&self, request: SubmitRequest) -> Result<Transaction> {
        let validated = self
            .validate(
                &request.user_id,
                &request.asset_id,
                &request.transaction_type,
                &request.amount,
            )
            .await?;
        let price = parse_amount(&request.price, "price")?;
        self.record(validated, price, request.wallet).await
    }

    /// Like [`submit`](Self::submit), pricing the request at the current market quote.
    #[instrument(skip(self, amount, wallet))]
    pub async fn submit_at_market(
        &self,
        user_id: &str,
        asset_id: &str,
        transaction_type: &str,
        amount: &str,
        wallet: &str,
    ) -> Result<Transaction> {
        let quotes = self
            .quotes
            .as_ref()
            .ok_or_else(|| LedgerError::validation("price", "no price oracle configured"))?;

        let validated = self
            .validate(user_id, asset_id, transaction_type, amount)
            .await?;
        let quote = quotes.quote(&validated.asset_id).await?;
        self.record(validated, quote.price, wallet.to_string()).await
    }

    async fn validate(
        &self,
        user_id: &str,
        asset_id: &str,
        transaction_type: &str,
        amount: &str,
    ) -> Result<Validated> {
        let transaction_type = transaction_type
            .parse::<TransactionType>()
            .map_err(|e| LedgerError::validation("type", e))?;

        let user_id = UserId::new(user_id.trim());
        if !user_id.is_valid() {
            return Err(LedgerError::validation("user_id", "is missing or malformed"));
        }

        let asset_id = AssetId::new(asset_id);
        if asset_id.is_empty() {
            return Err(LedgerError::validation("asset_id", "is required"));
        }

        let amount = parse_amount(amount, "amount")?;

        let limit = self.config.store_timeout;
        if bounded(limit, "find user", self.users.find_user(&user_id))
            .await?
            .is_none()
        {
            return Err(LedgerError::NotFound(Entity::User(user_id)));
        }
        // Fails with NotFound until open_account has run for this user.
        bounded(limit, "find account", self.store.get_balance(&user_id)).await?;

        if transaction_type.requires_tradable_asset() {
            let asset = bounded(limit, "find asset", self.assets.find_asset(&asset_id))
                .await?
                .ok_or_else(|| LedgerError::NotFound(Entity::Asset(asset_id.clone())))?;
            if !asset.tradable {
                return Err(LedgerError::validation(
                    "asset_id",
                    format!("{} is not tradable", asset.symbol),
                ));
            }
        }

        Ok(Validated {
            user_id,
            asset_id,
            transaction_type,
            amount,
        })
    }

    async fn record(&self, validated: Validated, price: Decimal, wallet: String) -> Result<Transaction> {
        let kind = TransactionKind::new(
            validated.transaction_type,
            validated.asset_id,
            validated.amount,
            price,
        );
        let transaction = Transaction::new(validated.user_id, kind, price, wallet.trim().to_string());

        if let Err(e) = bounded(
            self.config.store_timeout,
            "insert transaction",
            self.store.insert(transaction.clone()),
        )
        .await
        {
            warn!(transaction_id = %transaction.id, error = %e, "Failed to record transaction");
            if e.is_retryable() {
                self.metrics.store_failure();
            }
            return Err(e);
        }

        self.metrics.submitted();
        info!(
            transaction_id = %transaction.id,
            user = %transaction.user_id,
            transaction_type = %transaction.transaction_type(),
            asset = %transaction.asset_id(),
            quantity = %transaction.quantity(),
            "Transaction submitted"
        );
        Ok(transaction)
    }
}
