//! Decimal amounts: parsing of caller input, notional value and fees.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};

/// Parse a caller-supplied amount or price.
///
/// Accepts plain (`"0.25"`) and scientific (`"2.5e-1"`) notation. Rejects empty
/// input, non-numeric text and negative values.
pub fn parse_amount(raw: &str, field: &str) -> Result<Decimal> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(LedgerError::validation(field, "is required"));
    }

    let value = Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|_| LedgerError::validation(field, format!("'{}' is not a number", raw)))?;

    if value.is_sign_negative() && !value.is_zero() {
        return Err(LedgerError::validation(field, "must be non-negative"));
    }

    Ok(value.normalize())
}

/// Cash value of `quantity` units at `price`.
pub fn notional(quantity: Decimal, price: Decimal) -> Result<Decimal> {
    quantity
        .checked_mul(price)
        .ok_or_else(|| LedgerError::validation("amount", "amount x price overflows"))
}

/// Fee rate levied as a fraction of the moved asset quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeeRate(Decimal);

impl FeeRate {
    /// Flat 14% withdrawal fee.
    pub const DEFAULT: FeeRate = FeeRate(Decimal::from_parts(14, 0, 0, false, 2));

    /// Create a fee rate; must lie within `[0, 1]`.
    pub fn new(rate: Decimal) -> std::result::Result<Self, String> {
        if rate < Decimal::ZERO || rate > Decimal::ONE {
            return Err(format!("fee rate {} must be between 0 and 1", rate));
        }
        Ok(Self(rate))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Fee charged on `quantity`.
    pub fn fee_on(&self, quantity: Decimal) -> Result<Decimal> {
        quantity
            .checked_mul(self.0)
            .ok_or_else(|| LedgerError::validation("amount", "fee overflows"))
    }

    /// `quantity` plus the fee charged on it.
    pub fn gross(&self, quantity: Decimal) -> Result<Decimal> {
        self.fee_on(quantity)?
            .checked_add(quantity)
            .ok_or_else(|| LedgerError::validation("amount", "fee overflows"))
    }
}

impl Default for FeeRate {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a holding is too small to show in listings: zero, or at or below `threshold`.
pub fn is_dust(amount: Decimal, threshold: Decimal) -> bool {
    amount.abs() <= threshold || amount.is_zero()
}
