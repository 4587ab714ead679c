//! Collaborators the engine consults: users, assets and prices.

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use cryptoledger_common::{AssetId, Entity, LedgerError, Result, UserId};
use cryptoledger_ledger::User;

/// A listed asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    /// Ticker, e.g. `BTC`.
    pub symbol: String,
    pub name: String,
    /// Whether buy and sell orders may reference this asset.
    pub tradable: bool,
}

impl Asset {
    pub fn new(id: impl Into<AssetId>, symbol: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            symbol: symbol.into(),
            name: name.into(),
            tradable: true,
        }
    }

    /// Mark the asset as deposit/withdrawal only.
    pub fn untradable(mut self) -> Self {
        self.tradable = false;
        self
    }
}

/// Lookup of registered users.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, id: &UserId) -> Result<Option<User>>;
}

/// Lookup of listed assets.
#[async_trait]
pub trait AssetDirectory: Send + Sync {
    async fn find_asset(&self, id: &AssetId) -> Result<Option<Asset>>;
}

/// Source of current asset prices.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Get the oracle name.
    fn name(&self) -> &str;

    /// Current price of one unit of `asset`.
    async fn quote(&self, asset: &AssetId) -> Result<Decimal>;
}

/// User directory held in memory.
#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: DashMap<UserId, User>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a user.
    pub fn add(&self, user: User) {
        self.users.insert(user.id.clone(), user);
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn find_user(&self, id: &UserId) -> Result<Option<User>> {
        Ok(self.users.get(id).map(|u| u.clone()))
    }
}

/// Asset directory held in memory.
#[derive(Default)]
pub struct InMemoryAssetDirectory {
    assets: DashMap<AssetId, Asset>,
}

impl InMemoryAssetDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory seeded with the assets the simulator trades.
    pub fn with_defaults() -> Self {
        let directory = Self::new();
        directory.add(Asset::new("bitcoin", "BTC", "Bitcoin"));
        directory.add(Asset::new("ethereum", "ETH", "Ethereum"));
        directory.add(Asset::new("solana", "SOL", "Solana"));
        directory
    }

    pub fn add(&self, asset: Asset) {
        self.assets.insert(asset.id.clone(), asset);
    }
}

#[async_trait]
impl AssetDirectory for InMemoryAssetDirectory {
    async fn find_asset(&self, id: &AssetId) -> Result<Option<Asset>> {
        Ok(self.assets.get(id).map(|a| a.clone()))
    }
}

/// Oracle answering from a fixed price table.
#[derive(Default)]
pub struct StaticPriceOracle {
    prices: DashMap<AssetId, Decimal>,
}

impl StaticPriceOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the price of `asset`.
    pub fn set_price(&self, asset: impl Into<AssetId>, price: Decimal) {
        self.prices.insert(asset.into(), price);
    }
}

#[async_trait]
impl PriceOracle for StaticPriceOracle {
    fn name(&self) -> &str {
        "STATIC"
    }

    async fn quote(&self, asset: &AssetId) -> Result<Decimal> {
        let price = self
            .prices
            .get(asset)
            .map(|p| *p)
            .ok_or_else(|| LedgerError::NotFound(Entity::Asset(asset.clone())))?;
        debug!(asset = %asset, %price, "Static quote");
        Ok(price)
    }
}
