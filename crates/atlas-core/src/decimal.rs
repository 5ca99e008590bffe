//! Exact-decimal price and quantity newtypes.
//!
//! Fills, notionals and loss caps are all money math, so nothing here goes
//! through `f64`. Keeping prices and sizes as distinct types stops a size
//! from being passed where a price is expected.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Div, Mul, Sub};
use std::str::FromStr;

/// Shared surface of the decimal newtypes: construction, sign checks,
/// parsing (surrounding whitespace allowed), display and same-type sums.
macro_rules! decimal_newtype {
    ($name:ident) => {
        impl $name {
            pub const ZERO: Self = Self(Decimal::ZERO);

            #[inline]
            pub fn new(value: Decimal) -> Self {
                Self(value)
            }

            #[inline]
            pub fn inner(&self) -> Decimal {
                self.0
            }

            #[inline]
            pub fn is_zero(&self) -> bool {
                self.0.is_zero()
            }

            /// Strictly greater than zero.
            #[inline]
            pub fn is_positive(&self) -> bool {
                self.0 > Decimal::ZERO
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = rust_decimal::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Decimal::from_str(s.trim()).map(Self)
            }
        }

        impl From<Decimal> for $name {
            fn from(value: Decimal) -> Self {
                Self(value)
            }
        }

        impl Add for $name {
            type Output = Self;

            fn add(self, rhs: Self) -> Self {
                Self(self.0 + rhs.0)
            }
        }

        impl Sub for $name {
            type Output = Self;

            fn sub(self, rhs: Self) -> Self {
                Self(self.0 - rhs.0)
            }
        }
    };
}

/// Quote-currency price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(pub Decimal);

decimal_newtype!(Price);

impl Price {
    /// Steps half the distance from `self`, so two non-negative prices
    /// never overflow.
    #[inline]
    pub fn midpoint(&self, other: Price) -> Self {
        Self(
            self.0
                .saturating_add(other.0.saturating_sub(self.0) / Decimal::TWO),
        )
    }

    /// `(self - base) / base` in basis points; `None` for a zero base or on
    /// overflow.
    #[inline]
    pub fn bps_from(&self, base: Price) -> Option<Decimal> {
        self.relative_to(base, Decimal::from(10_000))
    }

    /// `(self - base) / base` in percent; `None` for a zero base or on
    /// overflow.
    #[inline]
    pub fn pct_from(&self, base: Price) -> Option<Decimal> {
        self.relative_to(base, Decimal::ONE_HUNDRED)
    }

    fn relative_to(&self, base: Price, scale: Decimal) -> Option<Decimal> {
        self.0
            .checked_sub(base.0)?
            .checked_div(base.0)?
            .checked_mul(scale)
    }
}

impl Mul<Decimal> for Price {
    type Output = Self;

    fn mul(self, factor: Decimal) -> Self {
        Self(self.0 * factor)
    }
}

impl Div<Decimal> for Price {
    type Output = Self;

    fn div(self, divisor: Decimal) -> Self {
        Self(self.0 / divisor)
    }
}

/// Base-asset quantity.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Size(pub Decimal);

decimal_newtype!(Size);

impl Size {
    /// Quantity worth `notional_usd` at `price`; `None` unless the price is
    /// positive and the quotient fits.
    #[inline]
    pub fn from_notional(notional_usd: Decimal, price: Price) -> Option<Self> {
        if !price.is_positive() {
            return None;
        }
        notional_usd.checked_div(price.0).map(Self)
    }

    /// Quote value of this quantity at `price`, saturating at the decimal
    /// range.
    #[inline]
    pub fn notional(&self, price: Price) -> Decimal {
        self.0.saturating_mul(price.0)
    }
}
