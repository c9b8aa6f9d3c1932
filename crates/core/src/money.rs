use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum MoneyError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
}

/// Parses a US dollar amount ("1,234.56", "$-5.00", "(75.25)") into signed
/// cents. Accounting parentheses negate.
pub fn parse_usd(s: &str) -> Result<i64, MoneyError> {
    let s = s.trim();
    let (negative, s) = if s.starts_with('(') && s.ends_with(')') {
        (true, &s[1..s.len() - 1])
    } else {
        (false, s)
    };
    let cleaned = s.replace([',', '$', ' '], "");
    let mut dec =
        Decimal::from_str(&cleaned).map_err(|_| MoneyError::InvalidAmount(s.to_string()))?;
    if negative {
        dec = -dec;
    }
    (dec * Decimal::from(100))
        .round()
        .to_i64()
        .ok_or_else(|| MoneyError::InvalidAmount(s.to_string()))
}

/// Formats signed cents as a dollar string, e.g. -4999 → "-$49.99".
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}${}.{:02}", abs / 100, abs % 100)
}
