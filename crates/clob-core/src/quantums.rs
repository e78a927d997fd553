//! Fixed-point price and size units.
//!
//! All lifecycle arithmetic is integer: prices are `Subticks`, sizes are
//! `BaseQuantums`. Oracle prices arrive as fractional subticks (`Decimal`) and
//! are rounded pessimistically before any comparison.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// Parts-per-million denominator.
pub const PPM: u64 = 1_000_000;

/// Price in subticks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Subticks(pub u64);

impl Subticks {
    pub const ZERO: Self = Self(0);

    #[inline]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub fn inner(&self) -> u64 {
        self.0
    }

    /// Smallest multiple of `tick` that is `>= self`.
    ///
    /// Saturates to the largest representable multiple instead of overflowing.
    pub fn round_up_to_tick(self, tick: u64) -> Self {
        if tick <= 1 {
            return self;
        }
        let rem = self.0 % tick;
        if rem == 0 {
            return self;
        }
        match self.0.checked_add(tick - rem) {
            Some(v) => Self(v),
            None => Self(u64::MAX - u64::MAX % tick),
        }
    }

    /// Largest multiple of `tick` that is `<= self`.
    pub fn round_down_to_tick(self, tick: u64) -> Self {
        if tick <= 1 {
            return self;
        }
        Self(self.0 - self.0 % tick)
    }

    /// Round a fractional price up (used for LTE trigger comparisons).
    pub fn ceil_from(price: Decimal) -> Self {
        Self::from_decimal(price.ceil())
    }

    /// Round a fractional price down (used for GTE trigger comparisons).
    pub fn floor_from(price: Decimal) -> Self {
        Self::from_decimal(price.floor())
    }

    fn from_decimal(integral: Decimal) -> Self {
        if integral.is_sign_negative() {
            return Self::ZERO;
        }
        Self(integral.to_u64().unwrap_or(u64::MAX))
    }
}

impl fmt::Display for Subticks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Subticks {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Size in base quantums.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BaseQuantums(pub u64);

impl BaseQuantums {
    pub const ZERO: Self = Self(0);

    #[inline]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub fn inner(&self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Self)
    }
}

impl fmt::Display for BaseQuantums {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BaseQuantums {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl Add for BaseQuantums {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for BaseQuantums {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_pessimistic_rounding() {
        assert_eq!(Subticks::ceil_from(dec!(20.1)), Subticks(21));
        assert_eq!(Subticks::floor_from(dec!(20.9)), Subticks(20));
        assert_eq!(Subticks::ceil_from(dec!(20)), Subticks(20));
        assert_eq!(Subticks::floor_from(dec!(-3.5)), Subticks(0));
    }

    #[test]
    fn test_tick_rounding() {
        assert_eq!(Subticks(1_050).round_up_to_tick(100), Subticks(1_100));
        assert_eq!(Subticks(1_050).round_down_to_tick(100), Subticks(1_000));
        assert_eq!(Subticks(1_000).round_up_to_tick(100), Subticks(1_000));
        assert_eq!(Subticks(7).round_up_to_tick(1), Subticks(7));
    }

    #[test]
    fn test_round_up_saturates() {
        let rounded = Subticks(u64::MAX - 1).round_up_to_tick(10);
        assert_eq!(rounded.0 % 10, 0);
        assert!(rounded.0 <= u64::MAX);
    }
}
