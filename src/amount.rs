use std::fmt;

use thiserror::Error;

/// Errors produced while parsing token amounts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("empty amount")]
    Empty,
    #[error("invalid digit in amount '{0}'")]
    InvalidDigit(String),
    #[error("amount '{0}' does not fit in 128 bits")]
    Overflow(String),
    #[error("amount '{0}' has more than {1} fractional digits")]
    TooPrecise(String, u8),
}

/// Token amount in the token's smallest denomination (e.g. wei for an 18-decimal token).
///
/// Amounts are never floating point; equality is exact integer equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(u128);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn from_base_units(value: u128) -> Self {
        Amount(value)
    }

    pub fn base_units(&self) -> u128 {
        self.0
    }

    /// Parse a big-endian hex payload such as the `data` field of a transfer log.
    ///
    /// Leading zero padding is accepted; significant digits beyond 128 bits are not.
    pub fn from_hex(value: &str) -> Result<Self, AmountError> {
        let digits = value
            .strip_prefix("0x")
            .or_else(|| value.strip_prefix("0X"))
            .unwrap_or(value);
        if digits.is_empty() {
            return Err(AmountError::Empty);
        }
        if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(AmountError::InvalidDigit(value.to_string()));
        }
        let significant = digits.trim_start_matches('0');
        if significant.is_empty() {
            return Ok(Amount::ZERO);
        }
        if significant.len() > 32 {
            return Err(AmountError::Overflow(value.to_string()));
        }
        u128::from_str_radix(significant, 16)
            .map(Amount)
            .map_err(|_| AmountError::Overflow(value.to_string()))
    }

    /// Parse a human decimal string ("10.5") into base units for a token with `decimals`.
    pub fn parse_decimal(value: &str, decimals: u8) -> Result<Self, AmountError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(AmountError::Empty);
        }
        let (whole, frac) = value.split_once('.').unwrap_or((value, ""));
        if whole.is_empty() && frac.is_empty() {
            return Err(AmountError::InvalidDigit(value.to_string()));
        }
        if !whole.bytes().chain(frac.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(AmountError::InvalidDigit(value.to_string()));
        }
        if frac.len() > decimals as usize {
            return Err(AmountError::TooPrecise(value.to_string(), decimals));
        }

        let overflow = || AmountError::Overflow(value.to_string());
        let scale = pow10(decimals).ok_or_else(overflow)?;
        let whole_units = if whole.is_empty() {
            0
        } else {
            whole.parse::<u128>().map_err(|_| overflow())?
        };
        let frac_units = if frac.is_empty() {
            0
        } else {
            let pad = pow10(decimals - frac.len() as u8).ok_or_else(overflow)?;
            frac.parse::<u128>()
                .map_err(|_| overflow())?
                .checked_mul(pad)
                .ok_or_else(overflow)?
        };

        whole_units
            .checked_mul(scale)
            .and_then(|units| units.checked_add(frac_units))
            .map(Amount)
            .ok_or_else(overflow)
    }

    /// Render as a decimal string with exactly `precision` fractional digits,
    /// rounding half up on the first dropped digit.
    pub fn to_decimal_string(&self, decimals: u8, precision: u8) -> String {
        let (quotient, frac_digits) = if decimals <= precision {
            let widen = pow10(precision - decimals).unwrap_or(1);
            (self.0.saturating_mul(widen), precision)
        } else {
            let Some(scale) = pow10(decimals - precision) else {
                return format!("0.{:0width$}", 0, width = precision as usize);
            };
            let mut q = self.0 / scale;
            if (self.0 % scale).saturating_mul(2) >= scale {
                q = q.saturating_add(1);
            }
            (q, precision)
        };

        match pow10(frac_digits) {
            Some(unit) if frac_digits > 0 => {
                let whole = quotient / unit;
                let frac = quotient % unit;
                format!("{whole}.{frac:0width$}", width = frac_digits as usize)
            }
            _ => quotient.to_string(),
        }
    }
}

fn pow10(exp: u8) -> Option<u128> {
    10u128.checked_pow(exp as u32)
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u128> for Amount {
    fn from(value: u128) -> Self {
        Amount(value)
    }
}
