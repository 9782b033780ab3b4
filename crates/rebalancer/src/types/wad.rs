//! WAD fixed-point values (18 decimals) and the precise-unit arithmetic used
//! for every ratio, balance and price in the engine.
//!
//! Multiplication truncates toward zero. Division comes in two flavours: the
//! plain form truncates, the `_ceil` form rounds away from zero. Sizing code
//! picks the direction explicitly so the engine never over-trades.

use alloy::primitives::U256;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::errors::MathError;

const WAD_SCALE: Decimal = dec!(1_000_000_000_000_000_000);
const WAD_UNIT: U256 = U256::from_limbs([1_000_000_000_000_000_000, 0, 0, 0]);
const WAD_DECIMALS: u32 = 18;

/// WAD-scaled value (18 decimals). `Wad::ONE` is a leverage ratio of 1.0x,
/// a 100% percentage, or one whole token.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Wad(pub U256);

impl Wad {
    pub const ONE: Wad = Wad(WAD_UNIT);
    pub const ZERO: Wad = Wad(U256::ZERO);

    /// Create from a `U256` that is already WAD-scaled.
    pub fn from_raw(val: U256) -> Self {
        Self(val)
    }

    /// Inner `U256`.
    pub fn raw(self) -> U256 {
        self.0
    }

    /// Whole units, e.g. `Wad::from_units(3)` is 3.0.
    pub fn from_units(units: u64) -> Self {
        Self(U256::from(units) * WAD_UNIT)
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    /// Exact conversion from a non-negative `Decimal`. Digits beyond the 18th
    /// decimal place are truncated.
    pub fn from_decimal(value: Decimal) -> Result<Self, MathError> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(MathError::Negative(value));
        }
        let mantissa = U256::from(value.mantissa().unsigned_abs());
        let scale = value.scale();
        let raw = if scale <= WAD_DECIMALS {
            mantissa
                .checked_mul(pow10(WAD_DECIMALS - scale))
                .ok_or(MathError::Overflow)?
        } else {
            mantissa / pow10(scale - WAD_DECIMALS)
        };
        Ok(Self(raw))
    }

    /// Convert to an off-chain `Decimal` for logging and display.
    pub fn to_decimal(self) -> Decimal {
        let raw = Decimal::from_str(&self.0.to_string()).unwrap_or_default();
        (raw / WAD_SCALE).normalize()
    }

    // -----------------------------------------------------------------------
    // Checked arithmetic
    // -----------------------------------------------------------------------

    pub fn checked_add(self, rhs: Wad) -> Result<Wad, MathError> {
        self.0
            .checked_add(rhs.0)
            .map(Wad)
            .ok_or(MathError::Overflow)
    }

    pub fn checked_sub(self, rhs: Wad) -> Result<Wad, MathError> {
        self.0
            .checked_sub(rhs.0)
            .map(Wad)
            .ok_or(MathError::Underflow)
    }

    /// `self - rhs`, floored at zero.
    pub fn saturating_sub(self, rhs: Wad) -> Wad {
        Wad(self.0.saturating_sub(rhs.0))
    }

    pub fn abs_diff(self, rhs: Wad) -> Wad {
        if self >= rhs {
            Wad(self.0 - rhs.0)
        } else {
            Wad(rhs.0 - self.0)
        }
    }

    /// `self * rhs / 1e18`, truncated.
    pub fn precise_mul(self, rhs: Wad) -> Result<Wad, MathError> {
        let product = self.0.checked_mul(rhs.0).ok_or(MathError::Overflow)?;
        Ok(Wad(product / WAD_UNIT))
    }

    /// `self * 1e18 / rhs`, truncated.
    pub fn precise_div(self, rhs: Wad) -> Result<Wad, MathError> {
        if rhs.is_zero() {
            return Err(MathError::DivisionByZero);
        }
        let scaled = self.0.checked_mul(WAD_UNIT).ok_or(MathError::Overflow)?;
        Ok(Wad(scaled / rhs.0))
    }

    /// `self * 1e18 / rhs`, rounded up.
    pub fn precise_div_ceil(self, rhs: Wad) -> Result<Wad, MathError> {
        if rhs.is_zero() {
            return Err(MathError::DivisionByZero);
        }
        let scaled = self.0.checked_mul(WAD_UNIT).ok_or(MathError::Overflow)?;
        Ok(Wad(div_ceil(scaled, rhs.0)))
    }
}

fn pow10(exp: u32) -> U256 {
    U256::from(10u64).pow(U256::from(exp))
}

fn div_ceil(numerator: U256, denominator: U256) -> U256 {
    let quotient = numerator / denominator;
    if (numerator % denominator).is_zero() {
        quotient
    } else {
        quotient + U256::from(1u64)
    }
}

impl fmt::Debug for Wad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Wad({})", self.to_decimal())
    }
}

impl fmt::Display for Wad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal())
    }
}

impl From<U256> for Wad {
    fn from(val: U256) -> Self {
        Self(val)
    }
}

impl TryFrom<Decimal> for Wad {
    type Error = MathError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Wad::from_decimal(value)
    }
}

// Config files carry ratios as decimal strings ("2.0", "0.05").
impl Serialize for Wad {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        rust_decimal::serde::str::serialize(&self.to_decimal(), serializer)
    }
}

impl<'de> Deserialize<'de> for Wad {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = rust_decimal::serde::str::deserialize(deserializer)?;
        Wad::from_decimal(value).map_err(serde::de::Error::custom)
    }
}
