// Copyright (c) 2024 Botho Foundation
#![deny(missing_docs)]

//! Fixed-point amount arithmetic.
//!
//! Balances, fees, rewards and reward shares are all signed 64-bit integers
//! scaled by [`MULTIPLIER`], giving eight decimal places. A share of
//! `1_00000000` is 100%.
//!
//! Intermediate products are computed in 128 bits and truncated toward zero,
//! so results match what every other node computes for the same inputs.

use std::fmt;
use thiserror::Error;

pub mod serde_amount;

/// Scale factor for amounts and shares (1e8).
pub const MULTIPLIER: i64 = 1_0000_0000;

/// Number of decimal places represented by [`MULTIPLIER`].
pub const DECIMAL_PLACES: usize = 8;

/// Errors from parsing decimal amount strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    /// Empty input
    #[error("empty amount")]
    Empty,
    /// Non-digit characters
    #[error("invalid amount: {0}")]
    Invalid(String),
    /// More fractional digits than can be represented
    #[error("too many decimal places in {0}")]
    TooPrecise(String),
    /// Value does not fit into 64 bits once scaled
    #[error("amount out of range: {0}")]
    Overflow(String),
}

/// `multiplicand * multiplier / 1e8`, truncated toward zero.
pub fn round_down_scaled_multiply(multiplicand: i64, multiplier: i64) -> i64 {
    (multiplicand as i128 * multiplier as i128 / MULTIPLIER as i128) as i64
}

/// `(multiplicand * multiplier + 1e8 - 1) / 1e8`.
pub fn round_up_scaled_multiply(multiplicand: i64, multiplier: i64) -> i64 {
    ((multiplicand as i128 * multiplier as i128 + (MULTIPLIER as i128 - 1)) / MULTIPLIER as i128)
        as i64
}

/// `dividend * 1e8 / divisor`, truncated toward zero.
///
/// Returns `None` when `divisor` is zero.
pub fn checked_scaled_divide(dividend: i64, divisor: i64) -> Option<i64> {
    if divisor == 0 {
        return None;
    }

    Some((dividend as i128 * MULTIPLIER as i128 / divisor as i128) as i64)
}

/// `dividend * 1e8 / divisor`, truncated toward zero.
///
/// # Panics
/// If `divisor` is zero, like any integer division.
pub fn scaled_divide(dividend: i64, divisor: i64) -> i64 {
    (dividend as i128 * MULTIPLIER as i128 / divisor as i128) as i64
}

/// Greatest common divisor of two amounts (always non-negative).
pub fn greatest_common_divisor(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.unsigned_abs(), b.unsigned_abs());
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }
    a as i64
}

/// Render an amount with exactly eight decimal places, e.g. `12.00000500`.
pub fn pretty_amount(amount: i64) -> String {
    PrettyAmount(amount).to_string()
}

/// Display wrapper for amounts, usable directly in log fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrettyAmount(pub i64);

impl fmt::Display for PrettyAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let magnitude = self.0.unsigned_abs();
        let whole = magnitude / MULTIPLIER as u64;
        let fraction = magnitude % MULTIPLIER as u64;
        write!(f, "{}{}.{:08}", sign, whole, fraction)
    }
}

/// Parse a decimal string such as `"0.05"` or `"-12.00000001"` into a scaled
/// amount.
pub fn parse_amount(src: &str) -> Result<i64, AmountError> {
    let src = src.trim();
    if src.is_empty() {
        return Err(AmountError::Empty);
    }

    let (negative, digits) = match src.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, src.strip_prefix('+').unwrap_or(src)),
    };

    let (whole, fraction) = match digits.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (digits, ""),
    };

    if whole.is_empty() && fraction.is_empty() {
        return Err(AmountError::Invalid(src.to_string()));
    }
    if !whole.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
        return Err(AmountError::Invalid(src.to_string()));
    }
    if fraction.len() > DECIMAL_PLACES {
        return Err(AmountError::TooPrecise(src.to_string()));
    }

    let overflow = || AmountError::Overflow(src.to_string());

    let whole_value: i128 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| overflow())?
    };

    let mut fraction_value: i128 = 0;
    for (i, c) in fraction.chars().enumerate() {
        let digit = c as i128 - '0' as i128;
        fraction_value += digit * 10i128.pow((DECIMAL_PLACES - 1 - i) as u32);
    }

    let mut scaled = whole_value
        .checked_mul(MULTIPLIER as i128)
        .and_then(|v| v.checked_add(fraction_value))
        .ok_or_else(overflow)?;
    if negative {
        scaled = -scaled;
    }

    i64::try_from(scaled).map_err(|_| overflow())
}
