//! Amount and currency rules shared by the ledger and the transfer service.
//!
//! Amounts are exact `Decimal`s with at most [`AMOUNT_SCALE`] fractional
//! digits. Currency codes are three ASCII letters, stored uppercased and
//! compared case-insensitively.

use rust_decimal::prelude::*;
use thiserror::Error;

/// Maximum number of fractional digits accepted for an amount
pub const AMOUNT_SCALE: u32 = 2;

/// Largest value a `NUMERIC(19, 2)` column holds, for amounts and balances alike
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(2_313_682_943, 2_328_306_436, 0, false, 2);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoneyError {
    #[error("Amount must be greater than zero")]
    NonPositive,

    #[error("Amount cannot be negative")]
    Negative,

    #[error("Amount {0} has more than 2 decimal places")]
    PrecisionOverflow(Decimal),

    #[error("Amount {0} exceeds the maximum of 99999999999999999.99")]
    OutOfRange(Decimal),

    #[error("Currency code must be 3 letters, got '{0}'")]
    InvalidCurrency(String),
}

/// Validate a strictly positive amount with at most two decimals.
pub fn validate_amount(amount: Decimal) -> Result<Decimal, MoneyError> {
    if amount <= Decimal::ZERO {
        return Err(MoneyError::NonPositive);
    }
    check_scale(amount)
}

/// Validate an amount that may be zero (opening balances).
pub fn validate_non_negative(amount: Decimal) -> Result<Decimal, MoneyError> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(MoneyError::Negative);
    }
    check_scale(amount)
}

fn check_scale(amount: Decimal) -> Result<Decimal, MoneyError> {
    // 100.50 and 100.5 are the same amount; only significant digits count
    if amount.normalize().scale() > AMOUNT_SCALE {
        return Err(MoneyError::PrecisionOverflow(amount));
    }
    if amount > MAX_AMOUNT {
        return Err(MoneyError::OutOfRange(amount));
    }
    Ok(amount)
}

/// `balance + amount`, or `None` if the result leaves the storable range.
pub fn checked_credit(balance: Decimal, amount: Decimal) -> Option<Decimal> {
    balance.checked_add(amount).filter(|sum| *sum <= MAX_AMOUNT)
}

/// Trim, check and uppercase a currency code.
pub fn normalize_currency(code: &str) -> Result<String, MoneyError> {
    let trimmed = code.trim();
    if trimmed.len() != 3 || !trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(MoneyError::InvalidCurrency(code.to_string()));
    }
    Ok(trimmed.to_ascii_uppercase())
}

#[inline]
pub fn same_currency(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Render an amount with exactly two decimals ("100" -> "100.00").
pub fn fixed_scale(amount: Decimal) -> String {
    let mut scaled =
        amount.round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::MidpointAwayFromZero);
    scaled.rescale(AMOUNT_SCALE);
    scaled.to_string()
}
