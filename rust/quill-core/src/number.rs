//! Exact decimal arithmetic for the runtime's `Number` values.
//!
//! A `Number` is `mantissa * 10^exponent` with an arbitrary-precision
//! integer mantissa, so decimal literals and arithmetic never pick up
//! binary rounding artifacts. Division that does not terminate is cut
//! off at 34 significant digits, the same width the original decimal128
//! runtime carried.

use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Significant digits kept when a quotient does not terminate.
const DIV_PRECISION: u32 = 34;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NumberError {
    #[error("invalid number literal: {0:?}")]
    Parse(String),
    #[error("division by zero")]
    DivideByZero,
}

/// An exact decimal value: `mantissa * 10^exponent`.
///
/// Always normalized: the mantissa carries no trailing zero digits, and
/// zero is represented as mantissa 0 with exponent 0.
#[derive(Debug, Clone)]
pub struct Number {
    mantissa: BigInt,
    exponent: i64,
}

impl Number {
    pub fn zero() -> Self {
        Number { mantissa: BigInt::zero(), exponent: 0 }
    }

    pub fn from_i64(v: i64) -> Self {
        Number { mantissa: BigInt::from(v), exponent: 0 }.normalized()
    }

    pub fn from_u32(v: u32) -> Self {
        Number { mantissa: BigInt::from(v), exponent: 0 }.normalized()
    }

    /// Convert from a binary float. Used only by the transcendental
    /// primitives, which round-trip through `f64`.
    pub fn from_f64(v: f64) -> Result<Self, NumberError> {
        if !v.is_finite() {
            return Err(NumberError::Parse(v.to_string()));
        }
        // Rust's float Display prints the shortest round-tripping
        // decimal form, which parses exactly.
        v.to_string().parse()
    }

    fn normalized(mut self) -> Self {
        if self.mantissa.is_zero() {
            self.exponent = 0;
            return self;
        }
        let ten = BigInt::from(10);
        while (&self.mantissa % &ten).is_zero() {
            self.mantissa /= &ten;
            self.exponent += 1;
        }
        self
    }

    pub fn is_zero(&self) -> bool {
        self.mantissa.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.mantissa.is_negative()
    }

    /// True when the value has no fractional part.
    pub fn is_integer(&self) -> bool {
        self.exponent >= 0 || self.trunc() == *self
    }

    pub fn abs(&self) -> Self {
        Number { mantissa: self.mantissa.abs(), exponent: self.exponent }
    }

    pub fn neg(&self) -> Self {
        Number { mantissa: -&self.mantissa, exponent: self.exponent }
    }

    /// Bring two values to a common exponent.
    fn aligned(&self, other: &Number) -> (BigInt, BigInt, i64) {
        let exp = self.exponent.min(other.exponent);
        let scale = |n: &Number| {
            let shift = (n.exponent - exp) as u32;
            &n.mantissa * BigInt::from(10).pow(shift)
        };
        (scale(self), scale(other), exp)
    }

    pub fn add(&self, other: &Number) -> Self {
        let (a, b, exp) = self.aligned(other);
        Number { mantissa: a + b, exponent: exp }.normalized()
    }

    pub fn sub(&self, other: &Number) -> Self {
        let (a, b, exp) = self.aligned(other);
        Number { mantissa: a - b, exponent: exp }.normalized()
    }

    pub fn mul(&self, other: &Number) -> Self {
        Number {
            mantissa: &self.mantissa * &other.mantissa,
            exponent: self.exponent + other.exponent,
        }
        .normalized()
    }

    /// Exact when the quotient terminates; otherwise truncated toward
    /// zero at 34 significant digits.
    pub fn div(&self, other: &Number) -> Result<Self, NumberError> {
        if other.is_zero() {
            return Err(NumberError::DivideByZero);
        }
        if self.is_zero() {
            return Ok(Number::zero());
        }
        let da = decimal_digits(&self.mantissa);
        let db = decimal_digits(&other.mantissa);
        // Scale the dividend far enough that the integer quotient holds
        // at least DIV_PRECISION+1 significant digits.
        let shift = (DIV_PRECISION + 1 + db).saturating_sub(da).max(1);
        let scaled = &self.mantissa * BigInt::from(10).pow(shift);
        let quotient = scaled / &other.mantissa;
        Ok(Number {
            mantissa: quotient,
            exponent: self.exponent - other.exponent - shift as i64,
        }
        .normalized())
    }

    /// Truncated modulo: `a - b * trunc(a / b)`, exact.
    pub fn rem(&self, other: &Number) -> Result<Self, NumberError> {
        if other.is_zero() {
            return Err(NumberError::DivideByZero);
        }
        let (a, b, exp) = self.aligned(other);
        Ok(Number { mantissa: a % b, exponent: exp }.normalized())
    }

    /// Exact for integer exponents; falls back to `f64` otherwise.
    pub fn pow(&self, other: &Number) -> Result<Self, NumberError> {
        if other.is_integer() {
            if let Some(n) = other.to_i64() {
                if (-0x7fff..=0x7fff).contains(&n) {
                    return self.pow_integer(n);
                }
            }
        }
        Number::from_f64(self.to_f64().powf(other.to_f64()))
    }

    fn pow_integer(&self, n: i64) -> Result<Self, NumberError> {
        if n >= 0 {
            let n = n as u32;
            Ok(Number {
                mantissa: self.mantissa.pow(n),
                exponent: self.exponent * n as i64,
            }
            .normalized())
        } else {
            Number::from_i64(1).div(&self.pow_integer(-n)?)
        }
    }

    /// Integer part, rounded toward zero.
    pub fn trunc(&self) -> Self {
        if self.exponent >= 0 {
            return self.clone();
        }
        let shift = BigInt::from(10).pow((-self.exponent) as u32);
        Number { mantissa: &self.mantissa / shift, exponent: 0 }.normalized()
    }

    pub fn floor(&self) -> Self {
        if self.exponent >= 0 {
            return self.clone();
        }
        let shift = BigInt::from(10).pow((-self.exponent) as u32);
        let (q, r) = (&self.mantissa / &shift, &self.mantissa % &shift);
        let q = if r.is_negative() { q - 1 } else { q };
        Number { mantissa: q, exponent: 0 }.normalized()
    }

    pub fn ceil(&self) -> Self {
        if self.exponent >= 0 {
            return self.clone();
        }
        let shift = BigInt::from(10).pow((-self.exponent) as u32);
        let (q, r) = (&self.mantissa / &shift, &self.mantissa % &shift);
        let q = if r.is_positive() { q + 1 } else { q };
        Number { mantissa: q, exponent: 0 }.normalized()
    }

    pub fn to_i64(&self) -> Option<i64> {
        if !self.is_integer() {
            return None;
        }
        if self.exponent == 0 {
            return self.mantissa.to_i64();
        }
        let scaled = &self.mantissa * BigInt::from(10).pow(u32::try_from(self.exponent).ok()?);
        scaled.to_i64()
    }

    pub fn to_u32(&self) -> Option<u32> {
        self.to_i64().and_then(|v| u32::try_from(v).ok())
    }

    pub fn to_f64(&self) -> f64 {
        self.to_string().parse().unwrap_or(f64::NAN)
    }
}

/// Number of decimal digits in the magnitude of `n` (0 counts as one).
fn decimal_digits(n: &BigInt) -> u32 {
    if n.is_zero() {
        return 1;
    }
    n.abs().to_string().len() as u32
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Number {}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Number {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b, _) = self.aligned(other);
        a.cmp(&b)
    }
}

impl FromStr for Number {
    type Err = NumberError;

    fn from_str(s: &str) -> Result<Self, NumberError> {
        let bad = || NumberError::Parse(s.to_string());
        let mut rest = s.trim();
        if rest.is_empty() {
            return Err(bad());
        }
        let mut exponent: i64 = 0;
        // Optional exponent suffix.
        if let Some(pos) = rest.find(['e', 'E']) {
            exponent = rest[pos + 1..].parse().map_err(|_| bad())?;
            rest = &rest[..pos];
        }
        let digits: String = match rest.find('.') {
            Some(pos) => {
                let frac = &rest[pos + 1..];
                if frac.is_empty() || frac.contains(['+', '-']) {
                    return Err(bad());
                }
                exponent -= frac.len() as i64;
                format!("{}{}", &rest[..pos], frac)
            }
            None => rest.to_string(),
        };
        let mantissa = BigInt::from_str(&digits).map_err(|_| bad())?;
        Ok(Number { mantissa, exponent }.normalized())
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return write!(f, "0");
        }
        let digits = self.mantissa.abs().to_string();
        let sign = if self.is_negative() { "-" } else { "" };
        if self.exponent >= 0 {
            let zeros = "0".repeat(self.exponent as usize);
            write!(f, "{sign}{digits}{zeros}")
        } else {
            let frac_len = (-self.exponent) as usize;
            if digits.len() > frac_len {
                let (int, frac) = digits.split_at(digits.len() - frac_len);
                write!(f, "{sign}{int}.{frac}")
            } else {
                let zeros = "0".repeat(frac_len - digits.len());
                write!(f, "{sign}0.{zeros}{digits}")
            }
        }
    }
}

impl Serialize for Number {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Number {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(s: &str) -> Number {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!(n("0").to_string(), "0");
        assert_eq!(n("42").to_string(), "42");
        assert_eq!(n("-3.25").to_string(), "-3.25");
        assert_eq!(n("0.001").to_string(), "0.001");
        assert_eq!(n("1e3").to_string(), "1000");
        assert_eq!(n("12.50").to_string(), "12.5");
        assert!("".parse::<Number>().is_err());
        assert!("1.2.3".parse::<Number>().is_err());
    }

    #[test]
    fn test_exact_decimal_addition() {
        // The classic binary-float trap.
        assert_eq!(n("0.1").add(&n("0.2")), n("0.3"));
        assert_eq!(n("1.5").sub(&n("2")), n("-0.5"));
    }

    #[test]
    fn test_multiplication_and_division() {
        assert_eq!(n("2.5").mul(&n("4")), n("10"));
        assert_eq!(n("1").div(&n("8")).unwrap(), n("0.125"));
        assert_eq!(n("10").div(&n("4")).unwrap(), n("2.5"));
        assert_eq!(n("1").div(&n("0")), Err(NumberError::DivideByZero));
    }

    #[test]
    fn test_nonterminating_division_is_cut_off() {
        let third = n("1").div(&n("3")).unwrap();
        let s = third.to_string();
        assert!(s.starts_with("0.3333"));
        assert!(s.len() >= 30);
    }

    #[test]
    fn test_modulo_is_truncated() {
        assert_eq!(n("7").rem(&n("3")).unwrap(), n("1"));
        assert_eq!(n("-7").rem(&n("3")).unwrap(), n("-1"));
        assert_eq!(n("7.5").rem(&n("2")).unwrap(), n("1.5"));
    }

    #[test]
    fn test_integer_powers_are_exact() {
        assert_eq!(n("2").pow(&n("10")).unwrap(), n("1024"));
        assert_eq!(n("0.1").pow(&n("3")).unwrap(), n("0.001"));
        assert_eq!(n("2").pow(&n("-2")).unwrap(), n("0.25"));
    }

    #[test]
    fn test_comparisons_align_exponents() {
        assert!(n("1.5") < n("2"));
        assert!(n("10") == n("10.0"));
        assert!(n("-1") > n("-2.5"));
    }

    #[test]
    fn test_floor_ceil_trunc() {
        assert_eq!(n("2.7").floor(), n("2"));
        assert_eq!(n("-2.7").floor(), n("-3"));
        assert_eq!(n("2.3").ceil(), n("3"));
        assert_eq!(n("-2.3").ceil(), n("-2"));
        assert_eq!(n("-2.7").trunc(), n("-2"));
    }

    #[test]
    fn test_conversions() {
        assert_eq!(n("42").to_i64(), Some(42));
        assert_eq!(n("4.2").to_i64(), None);
        assert_eq!(n("65").to_u32(), Some(65));
        assert_eq!(n("-1").to_u32(), None);
        assert_eq!(Number::from_f64(0.5).unwrap(), n("0.5"));
    }
}
