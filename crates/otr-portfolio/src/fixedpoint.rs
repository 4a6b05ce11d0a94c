//! Fixed-point money type.
//!
//! All money amounts in the tracker use a 1e-6 (micros) fixed-point
//! representation stored as `i64`: ledger amounts, cost basis, strikes,
//! premiums and snapshot equity. Share and contract counts stay plain `i64`.
//!
//! `Micros` wraps the raw `i64` so the type system prevents:
//! - Implicit construction from raw `i64` (no `From<i64>` impl).
//! - Mixing `Micros` with unrelated `i64` values (quantities, row ids).
//!
//! # Arithmetic
//!
//! - `Add`, `Sub`, `Neg`, `AddAssign`, `SubAssign` for `Micros op Micros`.
//! - `mul_qty` multiplies a per-unit price by a count in `i128` and clamps
//!   back into `i64`; trade values never wrap.
//! - `div_round` / [`weighted_average`] divide in `i128` rounding half away
//!   from zero.
//!
//! # Boundaries
//!
//! Decimal input from CSV files and HTTP bodies enters through
//! [`Micros::parse_decimal`] or [`Micros::from_f64`]. Over serde a `Micros`
//! is a JSON number in dollars (`199.0`); it also accepts a decimal string.

use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Price/cash scale: micros (1e-6).
pub const MICROS_SCALE: i64 = 1_000_000;

pub(crate) fn i128_to_i64_clamp(x: i128) -> i64 {
    if x > i64::MAX as i128 {
        i64::MAX
    } else if x < i64::MIN as i128 {
        i64::MIN
    } else {
        x as i64
    }
}

/// Integer division rounding half away from zero. `den` must be non-zero.
pub(crate) fn div_round_i128(num: i128, den: i128) -> i128 {
    debug_assert!(den != 0);
    let q = num / den;
    let r = num % den;
    if r.abs() * 2 >= den.abs() {
        if (num < 0) == (den < 0) {
            q + 1
        } else {
            q - 1
        }
    } else {
        q
    }
}

// ---------------------------------------------------------------------------
// Micros newtype
// ---------------------------------------------------------------------------

/// A fixed-point monetary amount at 1e-6 scale (micros).
///
/// 1 USD = `Micros(1_000_000)`. There is intentionally no `From<i64>`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Micros(i64);

impl Micros {
    pub const ZERO: Micros = Micros(0);
    pub const MAX: Micros = Micros(i64::MAX);
    pub const MIN: Micros = Micros(i64::MIN);

    /// Construct a `Micros` from a raw `i64` at 1e-6 scale.
    #[inline]
    pub const fn new(raw: i64) -> Self {
        Micros(raw)
    }

    /// Whole dollars, e.g. `Micros::dollars(150)` is $150.00.
    #[inline]
    pub const fn dollars(d: i64) -> Self {
        Micros(d * MICROS_SCALE)
    }

    /// Dollars and cents, e.g. `Micros::cents(199_00)` is $199.00.
    #[inline]
    pub const fn cents(c: i64) -> Self {
        Micros(c * 10_000)
    }

    /// Extract the underlying raw `i64`.
    #[inline]
    pub const fn raw(self) -> i64 {
        self.0
    }

    #[inline]
    pub fn saturating_add(self, rhs: Micros) -> Micros {
        Micros(self.0.saturating_add(rhs.0))
    }

    #[inline]
    pub fn saturating_sub(self, rhs: Micros) -> Micros {
        Micros(self.0.saturating_sub(rhs.0))
    }

    /// Absolute value. `Micros::MIN.abs()` saturates to `Micros::MAX`.
    #[inline]
    pub fn abs(self) -> Micros {
        Micros(self.0.saturating_abs())
    }

    /// Sign as a plain integer: `1`, `0` or `-1`.
    #[inline]
    pub fn signum(self) -> i64 {
        self.0.signum()
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    #[inline]
    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Multiply a per-unit price by a count, `None` on `i64` overflow.
    #[inline]
    pub fn checked_mul_qty(self, qty: i64) -> Option<Micros> {
        self.0.checked_mul(qty).map(Micros)
    }

    /// Multiply a per-unit price by a count, clamping at the `i64` bounds.
    #[inline]
    pub fn mul_qty(self, qty: i64) -> Micros {
        Micros(i128_to_i64_clamp(self.0 as i128 * qty as i128))
    }

    /// Divide by a count, rounding half away from zero. `None` when `qty == 0`.
    pub fn div_round(self, qty: i64) -> Option<Micros> {
        if qty == 0 {
            return None;
        }
        Some(Micros(i128_to_i64_clamp(div_round_i128(
            self.0 as i128,
            qty as i128,
        ))))
    }

    /// Ratio `self / other` as a float; `0.0` when `other` is zero.
    pub fn ratio(self, other: Micros) -> f64 {
        if other.0 == 0 {
            0.0
        } else {
            self.0 as f64 / other.0 as f64
        }
    }

    /// Scale by a float multiplier (FX rate), rounding to the nearest micro.
    pub fn scale_f64(self, factor: f64) -> Micros {
        Micros::from_f64(self.to_f64() * factor).unwrap_or(if factor.is_sign_negative() {
            Micros::MIN
        } else {
            Micros::MAX
        })
    }

    /// Convert a dollar float to micros. `None` for NaN, infinities or values
    /// outside the `i64` micros range.
    pub fn from_f64(dollars: f64) -> Option<Micros> {
        if !dollars.is_finite() {
            return None;
        }
        let scaled = (dollars * MICROS_SCALE as f64).round();
        if scaled > i64::MAX as f64 || scaled < i64::MIN as f64 {
            return None;
        }
        Some(Micros(scaled as i64))
    }

    /// Dollar value as a float (display and JSON only).
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / MICROS_SCALE as f64
    }

    /// Parse a decimal dollar string such as `"150"`, `"-2.75"`, `"$1,234.50"`.
    ///
    /// A leading `$` and thousands separators are accepted. Digits beyond the
    /// sixth decimal place round half away from zero.
    pub fn parse_decimal(input: &str) -> Result<Micros, ParseMicrosError> {
        let trimmed = input.trim();
        let (negative, rest) = match trimmed.strip_prefix('-') {
            Some(r) => (true, r),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };
        let rest = rest.strip_prefix('$').unwrap_or(rest);
        let cleaned: String = rest.chars().filter(|c| *c != ',').collect();
        if cleaned.is_empty() {
            return Err(ParseMicrosError::new(input));
        }

        let (whole, frac) = match cleaned.split_once('.') {
            Some((w, f)) => (w, f),
            None => (cleaned.as_str(), ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(ParseMicrosError::new(input));
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit())
        {
            return Err(ParseMicrosError::new(input));
        }

        let whole_v: i128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| ParseMicrosError::new(input))?
        };

        let mut frac_v: i128 = 0;
        for (i, ch) in frac.chars().take(6).enumerate() {
            let digit = ch as i128 - '0' as i128;
            frac_v += digit * 10_i128.pow(5 - i as u32);
        }
        if let Some(next) = frac.chars().nth(6) {
            if next >= '5' {
                frac_v += 1;
            }
        }

        let mut raw = whole_v * MICROS_SCALE as i128 + frac_v;
        if negative {
            raw = -raw;
        }
        if raw > i64::MAX as i128 || raw < i64::MIN as i128 {
            return Err(ParseMicrosError::new(input));
        }
        Ok(Micros(raw as i64))
    }
}

/// Weighted average `(Σ qty_i * price_i * mult + extra) / (total_qty * mult)`
/// computed in `i128`. Used for cost-basis updates where `extra` is
/// capitalised fees. Returns `Micros::ZERO` when `total_qty == 0`.
pub fn weighted_average(
    legs: &[(i64, Micros)],
    extra: Micros,
    total_qty: i64,
    multiplier: i64,
) -> Micros {
    if total_qty == 0 || multiplier == 0 {
        return Micros::ZERO;
    }
    let mut num: i128 = extra.0 as i128;
    for (qty, price) in legs {
        num += *qty as i128 * price.0 as i128 * multiplier as i128;
    }
    let den = total_qty as i128 * multiplier as i128;
    Micros(i128_to_i64_clamp(div_round_i128(num, den)))
}

// ---------------------------------------------------------------------------
// Parse error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseMicrosError {
    input: String,
}

impl ParseMicrosError {
    fn new(input: &str) -> Self {
        Self {
            input: input.to_string(),
        }
    }
}

impl std::fmt::Display for ParseMicrosError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid money amount: {:?}", self.input)
    }
}

impl std::error::Error for ParseMicrosError {}

// ---------------------------------------------------------------------------
// Arithmetic operators (closed over Micros)
// ---------------------------------------------------------------------------

impl Add for Micros {
    type Output = Micros;
    #[inline]
    fn add(self, rhs: Micros) -> Micros {
        Micros(self.0 + rhs.0)
    }
}

impl Sub for Micros {
    type Output = Micros;
    #[inline]
    fn sub(self, rhs: Micros) -> Micros {
        Micros(self.0 - rhs.0)
    }
}

impl Neg for Micros {
    type Output = Micros;
    #[inline]
    fn neg(self) -> Micros {
        Micros(-self.0)
    }
}

impl AddAssign for Micros {
    #[inline]
    fn add_assign(&mut self, rhs: Micros) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Micros {
    #[inline]
    fn sub_assign(&mut self, rhs: Micros) {
        self.0 -= rhs.0;
    }
}

impl std::iter::Sum for Micros {
    fn sum<I: Iterator<Item = Micros>>(iter: I) -> Micros {
        iter.fold(Micros::ZERO, |acc, m| acc.saturating_add(m))
    }
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

impl std::fmt::Display for Micros {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dollars = self.0 / MICROS_SCALE;
        let frac = (self.0 % MICROS_SCALE).abs();
        // When |value| < $1 and value is negative, dollars truncates to 0,
        // losing the sign.  Emit "-0" explicitly in that case.
        if self.0 < 0 && dollars == 0 {
            write!(f, "-{dollars}.{frac:06}")
        } else {
            write!(f, "{dollars}.{frac:06}")
        }
    }
}

// ---------------------------------------------------------------------------
// Serde
// ---------------------------------------------------------------------------

impl Serialize for Micros {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_f64())
    }
}

impl<'de> Deserialize<'de> for Micros {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MicrosVisitor;

        impl<'de> de::Visitor<'de> for MicrosVisitor {
            type Value = Micros;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a dollar amount as a number or decimal string")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Micros, E> {
                v.checked_mul(MICROS_SCALE)
                    .map(Micros)
                    .ok_or_else(|| E::custom("money amount out of range"))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Micros, E> {
                let v = i64::try_from(v).map_err(|_| E::custom("money amount out of range"))?;
                self.visit_i64(v)
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Micros, E> {
                Micros::from_f64(v).ok_or_else(|| E::custom("money amount out of range"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Micros, E> {
                Micros::parse_decimal(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(MicrosVisitor)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
