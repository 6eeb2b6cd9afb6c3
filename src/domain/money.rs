//! Currency handling and minor-unit conversion.
//!
//! Amounts travel as `BigDecimal` everywhere inside the engine. Channels
//! that want integer minor units (cents) go through [`to_minor_units`];
//! channels that transmit decimal strings go through [`validate_scale`]
//! and [`format_decimal`] instead.

use std::fmt;

use bigdecimal::{BigDecimal, Signed, ToPrimitive};
use serde::{Deserialize, Serialize};

use crate::error::PaymentError;

/// Closed set of currencies the engine settles in. Anything else is
/// rejected at the boundary rather than passed through to a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Cny,
    Usd,
    Eur,
    Gbp,
    Jpy,
    Hkd,
    Krw,
    Aud,
    Cad,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cny => "CNY",
            Self::Usd => "USD",
            Self::Eur => "EUR",
            Self::Gbp => "GBP",
            Self::Jpy => "JPY",
            Self::Hkd => "HKD",
            Self::Krw => "KRW",
            Self::Aud => "AUD",
            Self::Cad => "CAD",
        }
    }

    /// Zero-decimal currencies are charged in whole units: 100 JPY is
    /// transmitted as 100, not 10000.
    pub fn is_zero_decimal(&self) -> bool {
        matches!(self, Self::Jpy | Self::Krw)
    }

    /// Number of decimal places the currency supports.
    pub fn exponent(&self) -> i64 {
        if self.is_zero_decimal() {
            0
        } else {
            2
        }
    }

    fn minor_unit_factor(&self) -> BigDecimal {
        if self.is_zero_decimal() {
            BigDecimal::from(1)
        } else {
            BigDecimal::from(100)
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Currency {
    type Error = PaymentError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CNY" => Ok(Self::Cny),
            "USD" => Ok(Self::Usd),
            "EUR" => Ok(Self::Eur),
            "GBP" => Ok(Self::Gbp),
            "JPY" => Ok(Self::Jpy),
            "HKD" => Ok(Self::Hkd),
            "KRW" => Ok(Self::Krw),
            "AUD" => Ok(Self::Aud),
            "CAD" => Ok(Self::Cad),
            other => Err(PaymentError::Validation(format!(
                "unknown currency code: {other}"
            ))),
        }
    }
}

/// Convert a major-unit amount to integer minor units, rounding half-up.
///
/// `100.00 USD -> 10000`, `100 JPY -> 100`, `99.995 USD -> 10000`.
pub fn to_minor_units(amount: &BigDecimal, currency: Currency) -> Result<i64, PaymentError> {
    if amount.is_negative() {
        return Err(PaymentError::Validation(format!(
            "amount must not be negative, got {amount}"
        )));
    }
    let scaled = amount * currency.minor_unit_factor();
    // round(0) rounds half away from zero, which is half-up for the
    // non-negative amounts accepted above.
    scaled.round(0).to_i64().ok_or_else(|| {
        PaymentError::Validation(format!("amount {amount} out of representable range"))
    })
}

/// Convert integer minor units back to a major-unit amount
/// (`10000 USD cents -> 100.00`, `100 JPY -> 100`).
pub fn from_minor_units(minor: i64, currency: Currency) -> BigDecimal {
    BigDecimal::from(minor) / currency.minor_unit_factor()
}

/// Reject amounts carrying more precision than the currency supports.
/// Decimal-string channels skip conversion, so `100.005 USD` has to be
/// caught here instead of silently rounded.
pub fn validate_scale(amount: &BigDecimal, currency: Currency) -> Result<(), PaymentError> {
    if amount.with_scale(currency.exponent()) != *amount {
        return Err(PaymentError::Validation(format!(
            "amount {amount} has more precision than {currency} allows"
        )));
    }
    Ok(())
}

/// Render an amount as the canonical decimal string for wire transmission,
/// padded to the currency exponent (`100 USD -> "100.00"`, `100 JPY -> "100"`).
/// Callers are expected to have run [`validate_scale`] first.
pub fn format_decimal(amount: &BigDecimal, currency: Currency) -> String {
    amount.with_scale(currency.exponent()).to_string()
}
