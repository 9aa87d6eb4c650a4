//! Fixed-point numbers
//!
//! Oracle results are signed 128-bit integers scaled by 10^18. All consensus
//! arithmetic stays in this integer domain so that every execution produces
//! bit-identical results; floating point only appears once, when a
//! configured variance fraction is turned into a [`VarianceBound`].

use crate::error::FixedPointError;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Number of decimal places carried by a [`FixedPoint`].
pub const DECIMALS: u32 = 18;

/// `10^DECIMALS`
pub const SCALE: u128 = 1_000_000_000_000_000_000;

/// A signed fixed-point value with 18 decimal places.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FixedPoint(i128);

impl FixedPoint {
    pub const ZERO: FixedPoint = FixedPoint(0);

    /// Wrap an already-scaled integer.
    pub const fn from_raw(raw: i128) -> Self {
        Self(raw)
    }

    /// The scaled integer representation.
    pub const fn raw(self) -> i128 {
        self.0
    }

    /// A whole number. Every `i64` fits after scaling.
    pub fn from_integer(value: i64) -> Self {
        Self(value as i128 * SCALE as i128)
    }

    /// Convert a [`Decimal`], truncating digits beyond the 18th decimal place.
    ///
    /// # Errors
    /// [`FixedPointError::Overflow`] when the scaled value exceeds 128 bits.
    pub fn from_decimal(value: Decimal) -> Result<Self, FixedPointError> {
        let mantissa = value.mantissa();
        let scale = value.scale();

        let raw = if scale <= DECIMALS {
            mantissa
                .checked_mul(10i128.pow(DECIMALS - scale))
                .ok_or(FixedPointError::Overflow)?
        } else {
            mantissa / 10i128.pow(scale - DECIMALS)
        };

        Ok(Self(raw))
    }

    /// Floor of the exact midpoint of `a` and `b`.
    ///
    /// Rounds toward negative infinity and never overflows, even for
    /// `i128::MIN` and `i128::MAX`.
    pub fn midpoint_floor(a: FixedPoint, b: FixedPoint) -> FixedPoint {
        FixedPoint((a.0 >> 1) + (b.0 >> 1) + (a.0 & b.0 & 1))
    }

    /// `|self - other|` without overflow.
    pub fn abs_diff(self, other: FixedPoint) -> u128 {
        self.0.abs_diff(other.0)
    }

    pub fn unsigned_abs(self) -> u128 {
        self.0.unsigned_abs()
    }
}

impl fmt::Display for FixedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let magnitude = self.0.unsigned_abs();
        let integer = magnitude / SCALE;
        let fraction = magnitude % SCALE;
        let sign = if self.0 < 0 { "-" } else { "" };

        if fraction == 0 {
            write!(f, "{sign}{integer}")
        } else {
            let digits = format!("{fraction:018}");
            write!(f, "{sign}{integer}.{}", digits.trim_end_matches('0'))
        }
    }
}

impl fmt::Debug for FixedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FixedPoint({self})")
    }
}

impl FromStr for FixedPoint {
    type Err = FixedPointError;

    /// Parse a plain decimal literal such as `-100.05`. Exact: at most 18
    /// fractional digits are accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };
        let (integer, fraction) = digits.split_once('.').unwrap_or((digits, ""));

        let is_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if (integer.is_empty() && fraction.is_empty()) || !is_digits(integer) || !is_digits(fraction)
        {
            return Err(FixedPointError::Parse(s.to_string()));
        }
        if fraction.len() > DECIMALS as usize {
            return Err(FixedPointError::Parse(format!(
                "{s}: more than {DECIMALS} fractional digits"
            )));
        }

        let mut magnitude: u128 = 0;
        for b in integer.bytes() {
            magnitude = magnitude
                .checked_mul(10)
                .and_then(|m| m.checked_add(u128::from(b - b'0')))
                .ok_or(FixedPointError::Overflow)?;
        }
        magnitude = magnitude.checked_mul(SCALE).ok_or(FixedPointError::Overflow)?;

        let mut fractional: u128 = 0;
        for b in fraction.bytes() {
            fractional = fractional * 10 + u128::from(b - b'0');
        }
        fractional *= 10u128.pow(DECIMALS - fraction.len() as u32);
        magnitude = magnitude
            .checked_add(fractional)
            .ok_or(FixedPointError::Overflow)?;

        let raw = if negative {
            0i128.checked_sub_unsigned(magnitude)
        } else {
            0i128.checked_add_unsigned(magnitude)
        };
        raw.map(FixedPoint).ok_or(FixedPointError::Overflow)
    }
}

impl Serialize for FixedPoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FixedPoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let literal = String::deserialize(deserializer)?;
        literal.parse().map_err(serde::de::Error::custom)
    }
}

/// Upper bound on `(max - min) / |median|`, held as a fraction scaled by 10^18.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarianceBound(u128);

impl VarianceBound {
    pub const fn from_raw(raw: u128) -> Self {
        Self(raw)
    }

    /// Build the bound from a fraction such as `0.05` (5%).
    ///
    /// The float is rendered with its shortest round-trip representation and
    /// parsed as a decimal, so `0.05` becomes exactly `5 * 10^16`.
    pub fn from_fraction(fraction: f64) -> Result<Self, FixedPointError> {
        if !fraction.is_finite() || fraction < 0.0 {
            return Err(FixedPointError::InvalidRatio(fraction.to_string()));
        }
        let decimal = Decimal::from_str(&fraction.to_string())
            .map_err(|e| FixedPointError::InvalidRatio(e.to_string()))?;
        Self::from_decimal(decimal)
    }

    pub fn from_decimal(fraction: Decimal) -> Result<Self, FixedPointError> {
        if fraction.is_sign_negative() && !fraction.is_zero() {
            return Err(FixedPointError::InvalidRatio(fraction.to_string()));
        }
        let scaled = FixedPoint::from_decimal(fraction)?;
        u128::try_from(scaled.raw())
            .map(Self)
            .map_err(|_| FixedPointError::InvalidRatio(fraction.to_string()))
    }

    pub const fn raw(self) -> u128 {
        self.0
    }

    /// Whether `spread / magnitude` stays within the bound, evaluated exactly.
    ///
    /// A zero magnitude only admits a zero spread.
    pub fn permits(self, spread: u128, magnitude: u128) -> bool {
        if magnitude == 0 {
            return spread == 0;
        }
        wide_mul(spread, SCALE) <= wide_mul(self.0, magnitude)
    }
}

/// Full 256-bit product of two `u128`, as `(high, low)` words.
pub(crate) fn wide_mul(a: u128, b: u128) -> (u128, u128) {
    const MASK: u128 = u64::MAX as u128;

    let (a_hi, a_lo) = (a >> 64, a & MASK);
    let (b_hi, b_lo) = (b >> 64, b & MASK);

    let lo_lo = a_lo * b_lo;
    let hi_lo = a_hi * b_lo;
    let lo_hi = a_lo * b_hi;
    let hi_hi = a_hi * b_hi;

    let cross = (lo_lo >> 64) + (hi_lo & MASK) + (lo_hi & MASK);
    let low = (cross << 64) | (lo_lo & MASK);
    let high = hi_hi + (hi_lo >> 64) + (lo_hi >> 64) + (cross >> 64);

    (high, low)
}

/// `(high, low) / divisor`, or `None` when the quotient needs more than 128
/// bits or the divisor is zero.
pub(crate) fn wide_div((high, low): (u128, u128), divisor: u128) -> Option<u128> {
    if divisor == 0 || high >= divisor {
        return None;
    }

    let mut rem = high;
    let mut quotient = 0u128;
    for bit in (0..128).rev() {
        let carry = rem >> 127;
        rem = (rem << 1) | ((low >> bit) & 1);
        if carry == 1 || rem >= divisor {
            rem = rem.wrapping_sub(divisor);
            quotient |= 1 << bit;
        }
    }
    Some(quotient)
}
