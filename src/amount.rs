//! Fixed-point monetary amount with 2 decimal places.
//!
//! TDDF carries amounts as zero-padded integer minor units with an implied
//! decimal point. `Amount` keeps them exact via `rust_decimal`.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub};
use std::str::FromStr;

/// A decimal amount that always carries exactly 2 decimal places.
///
/// # Examples
///
/// ```
/// use tddf_pipeline::Amount;
///
/// let amount = Amount::from_minor_units(12345);
/// assert_eq!(amount.to_string(), "123.45");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(Decimal);

impl Amount {
    /// The number of implied decimal places.
    pub const SCALE: u32 = 2;

    /// Zero value.
    pub const ZERO: Self = Amount(Decimal::ZERO);

    /// Creates a new `Amount`, normalizing to 2 decimal places.
    pub fn new(value: Decimal) -> Self {
        let mut normalized = value;
        normalized.rescale(Self::SCALE);
        Amount(normalized)
    }

    /// Interprets an integer count of minor units (cents).
    pub fn from_minor_units(units: i64) -> Self {
        Amount(Decimal::new(units, Self::SCALE))
    }

    /// Parses a fixed-width implied-decimal field such as `"00000012345"`.
    ///
    /// Accepts an optional leading `-`. Anything else that is not an ASCII
    /// digit makes the field invalid.
    pub fn parse_implied(field: &str) -> Option<Self> {
        let trimmed = field.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let units: i64 = digits.parse().ok()?;
        Some(Self::from_minor_units(if negative { -units } else { units }))
    }

    /// Minor units, the inverse of [`Amount::from_minor_units`].
    pub fn minor_units(&self) -> i64 {
        let mut scaled = self.0;
        scaled.rescale(Self::SCALE);
        scaled.mantissa() as i64
    }

    /// Returns `true` if this value is zero.
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl FromStr for Amount {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let decimal = Decimal::from_str(s.trim())?;
        Ok(Amount::new(decimal))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

impl Add for Amount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Amount::new(self.0 + rhs.0)
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
        self.0.rescale(Self::SCALE);
    }
}

impl Sub for Amount {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Amount::new(self.0 - rhs.0)
    }
}

impl Neg for Amount {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Amount::new(-self.0)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Amount::ZERO, |acc, x| acc + x)
    }
}

impl Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{:.2}", self.0))
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Amount::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_implied_decimal_divides_by_hundred() {
        assert_eq!(Amount::parse_implied("00000012345").unwrap().to_string(), "123.45");
        assert_eq!(Amount::parse_implied("00000000000").unwrap(), Amount::ZERO);
        assert_eq!(Amount::parse_implied("-0000000150").unwrap().to_string(), "-1.50");
    }

    #[test]
    fn test_implied_decimal_rejects_garbage() {
        assert!(Amount::parse_implied("").is_none());
        assert!(Amount::parse_implied("   ").is_none());
        assert!(Amount::parse_implied("12A45").is_none());
        assert!(Amount::parse_implied("12.45").is_none());
        assert!(Amount::parse_implied("-").is_none());
    }

    #[test]
    fn test_minor_units_inverse() {
        let a = Amount::from_minor_units(987654);
        assert_eq!(a.minor_units(), 987654);
        assert_eq!(Amount::from_str("1.5").unwrap().minor_units(), 150);
    }

    #[test]
    fn test_arithmetic_preserves_scale() {
        let a = Amount::from_str("1.5").unwrap();
        let b = Amount::from_str("2.25").unwrap();

        assert_eq!((a + b).to_string(), "3.75");
        assert_eq!((a - b).to_string(), "-0.75");
        assert_eq!((-a).to_string(), "-1.50");
    }

    #[test]
    fn test_sum() {
        let total: Amount = [100, 250, 5]
            .into_iter()
            .map(Amount::from_minor_units)
            .sum();
        assert_eq!(total.to_string(), "3.55");
        assert!(std::iter::empty::<Amount>().sum::<Amount>().is_zero());
    }
}
