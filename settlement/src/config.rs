//! Engine configuration.

use std::time::Duration;

use cryptoledger_common::FeeRate;
use rust_decimal::Decimal;

/// Settlement engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fee charged on withdrawals, as a fraction of the withdrawn quantity.
    pub withdrawal_fee_rate: FeeRate,
    /// Upper bound on every store call made by the engine.
    pub store_timeout: Duration,
    /// Holdings at or below this amount are hidden from listings.
    pub holding_display_threshold: Decimal,
    /// How long a market quote is reused.
    pub quote_ttl: Duration,
    /// PostgreSQL URL. The in-memory store is used when unset.
    pub database_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            withdrawal_fee_rate: FeeRate::DEFAULT,
            store_timeout: Duration::from_millis(5000),
            holding_display_threshold: Decimal::new(1, 8),
            quote_ttl: Duration::from_secs(600),
            database_url: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Unparseable values are reported rather than silently replaced by defaults.
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::default();

        if let Ok(rate) = std::env::var("LEDGER_WITHDRAWAL_FEE_RATE") {
            let rate = rate
                .trim()
                .parse::<Decimal>()
                .map_err(|e| format!("LEDGER_WITHDRAWAL_FEE_RATE: {}", e))?;
            config.withdrawal_fee_rate = FeeRate::new(rate)?;
        }

        if let Ok(ms) = std::env::var("LEDGER_STORE_TIMEOUT_MS") {
            let ms = ms
                .trim()
                .parse::<u64>()
                .map_err(|e| format!("LEDGER_STORE_TIMEOUT_MS: {}", e))?;
            config.store_timeout = Duration::from_millis(ms);
        }

        if let Ok(threshold) = std::env::var("LEDGER_HOLDING_DISPLAY_THRESHOLD") {
            config.holding_display_threshold = threshold
                .trim()
                .parse::<Decimal>()
                .map_err(|e| format!("LEDGER_HOLDING_DISPLAY_THRESHOLD: {}", e))?;
        }

        if let Ok(secs) = std::env::var("LEDGER_QUOTE_TTL_SECS") {
            let secs = secs
                .trim()
                .parse::<u64>()
                .map_err(|e| format!("LEDGER_QUOTE_TTL_SECS: {}", e))?;
            config.quote_ttl = Duration::from_secs(secs);
        }

        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.trim().is_empty() {
                config.database_url = Some(url);
            }
        }

        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.store_timeout.is_zero() {
            return Err("Store timeout cannot be 0".to_string());
        }

        if self.holding_display_threshold < Decimal::ZERO {
            return Err("Holding display threshold cannot be negative".to_string());
        }

        if let Some(url) = &self.database_url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                return Err(format!("Unsupported database URL: {}", url));
            }
        }

        Ok(())
    }
}
