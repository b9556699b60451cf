//! Storage quantity parsing
//!
//! Converts Kubernetes resource quantities (`1Gi`, `500M`, `1.5Ti`, `2e9`)
//! into whole bytes, rounding fractional results up.

use crate::error::{Error, Result};

/// Binary suffixes and their power of 1024
const BINARY_SUFFIXES: &[(&str, u32)] = &[
    ("Ki", 1),
    ("Mi", 2),
    ("Gi", 3),
    ("Ti", 4),
    ("Pi", 5),
    ("Ei", 6),
];

/// Decimal suffixes and their power of 10
const DECIMAL_SUFFIXES: &[(&str, i32)] = &[
    ("n", -9),
    ("u", -6),
    ("m", -3),
    ("k", 3),
    ("M", 6),
    ("G", 9),
    ("T", 12),
    ("P", 15),
    ("E", 18),
];

/// Parse a quantity string into bytes
pub fn parse_quantity(input: &str) -> Result<u64> {
    let invalid = |reason: &str| Error::CapacityParse(format!("{:?}: {}", input, reason));

    let s = input.trim();
    if s.is_empty() {
        return Err(invalid("empty quantity"));
    }
    let s = s.strip_prefix('+').unwrap_or(s);
    if s.starts_with('-') {
        return Err(invalid("negative quantity"));
    }

    let number_end = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(number_end);

    let (whole, fraction) = split_decimal(number).ok_or_else(|| invalid("malformed number"))?;

    // bytes = number * multiplier / divisor
    let (multiplier, divisor) = if let Some(&(_, power)) =
        BINARY_SUFFIXES.iter().find(|(name, _)| *name == suffix)
    {
        (1024u128.pow(power), 1)
    } else {
        let exponent = decimal_exponent(suffix).ok_or_else(|| invalid("unknown suffix"))?;
        let scale = 10u128
            .checked_pow(exponent.unsigned_abs())
            .ok_or_else(|| invalid("quantity too large"))?;
        if exponent >= 0 {
            (scale, 1)
        } else {
            (1, scale)
        }
    };

    // Multiply the fraction digit by digit from the right. `carry` ends up
    // as the whole part of fraction * multiplier; `inexact` records whether
    // anything was left below it.
    let mut carry = 0u128;
    let mut inexact = false;
    for digit in fraction.bytes().rev() {
        let product = u128::from(digit - b'0')
            .checked_mul(multiplier)
            .and_then(|p| p.checked_add(carry))
            .ok_or_else(|| invalid("quantity too large"))?;
        inexact |= product % 10 != 0;
        carry = product / 10;
    }

    let whole = if whole.is_empty() {
        0
    } else {
        whole.parse::<u128>().map_err(|_| invalid("quantity too large"))?
    };
    let scaled = whole
        .checked_mul(multiplier)
        .and_then(|w| w.checked_add(carry))
        .ok_or_else(|| invalid("quantity too large"))?;

    let mut bytes = scaled / divisor;
    if inexact || scaled % divisor != 0 {
        bytes += 1;
    }
    u64::try_from(bytes).map_err(|_| invalid("quantity too large"))
}

/// `"12.5"` → ("12", "5")
fn split_decimal(number: &str) -> Option<(&str, &str)> {
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if fraction.contains('.') {
        return None;
    }
    Some((whole, fraction))
}

/// Power of ten for a decimal suffix or an `e<n>` exponent
fn decimal_exponent(suffix: &str) -> Option<i32> {
    if suffix.is_empty() {
        return Some(0);
    }
    if let Some(&(_, exponent)) = DECIMAL_SUFFIXES.iter().find(|(name, _)| *name == suffix) {
        return Some(exponent);
    }
    let digits = suffix.strip_prefix('e').or_else(|| suffix.strip_prefix('E'))?;
    if digits.is_empty() {
        return None;
    }
    digits.parse::<i32>().ok()
}
