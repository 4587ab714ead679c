//! Market quotes reused for a fixed TTL.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use cryptoledger_common::{AssetId, LedgerError, Result};

use crate::directory::PriceOracle;

/// A price observed from an oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quote {
    pub asset_id: AssetId,
    pub price: Decimal,
    /// Oracle that produced the price.
    pub source: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    quote: Quote,
    cached_at: Instant,
}

impl CacheEntry {
    fn is_valid(&self, ttl: Duration) -> bool {
        self.cached_at.elapsed() < ttl
    }
}

/// Thread-safe quote cache in front of a [`PriceOracle`].
///
/// One instance is shared by everyone who needs prices; nothing is global.
pub struct QuoteCache {
    oracle: Arc<dyn PriceOracle>,
    cache: DashMap<AssetId, CacheEntry>,
    ttl: Duration,
}

impl QuoteCache {
    pub fn new(oracle: Arc<dyn PriceOracle>, ttl: Duration) -> Self {
        Self {
            oracle,
            cache: DashMap::new(),
            ttl,
        }
    }

    /// Cached quote for `asset`, fetched from the oracle when missing or stale.
    pub async fn quote(&self, asset: &AssetId) -> Result<Quote> {
        if let Some(entry) = self.cache.get(asset) {
            if entry.is_valid(self.ttl) {
                debug!(asset = %asset, "Quote cache hit");
                return Ok(entry.quote.clone());
            }
        }
        self.cache.remove_if(asset, |_, entry| !entry.is_valid(self.ttl));

        debug!(asset = %asset, oracle = self.oracle.name(), "Quote cache miss");
        let price = self.oracle.quote(asset).await?;
        if price <= Decimal::ZERO {
            return Err(LedgerError::validation(
                "price",
                format!("oracle {} returned non-positive price {}", self.oracle.name(), price),
            ));
        }

        let quote = Quote {
            asset_id: asset.clone(),
            price,
            source: self.oracle.name().to_string(),
            fetched_at: Utc::now(),
        };
        self.cache.insert(
            asset.clone(),
            CacheEntry {
                quote: quote.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(quote)
    }

    /// Drop the cached quote for `asset`.
    pub fn invalidate(&self, asset: &AssetId) {
        self.cache.remove(asset);
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Evict expired entries.
    pub fn evict_expired(&self) {
        let ttl = self.ttl;
        self.cache.retain(|_, entry| entry.is_valid(ttl));
    }
}
