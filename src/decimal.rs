//! Fixed-precision decimal arithmetic helpers.
//!
//! Every monetary, volume, price and fee quantity in this crate flows through
//! [`rust_decimal::Decimal`]. Arithmetic is exact; rounding happens explicitly
//! at the monetary boundaries defined by the accounting and clearing layers.

use rust_decimal::{Decimal, RoundingStrategy};

/// Round half-away-from-zero to `decimals` fractional digits.
///
/// This is the default rounding mode at every monetary boundary.
#[must_use]
#[inline]
pub fn round(x: Decimal, decimals: u32) -> Decimal {
    x.round_dp_with_strategy(decimals, RoundingStrategy::MidpointAwayFromZero)
}

/// Round toward zero to `decimals` fractional digits.
///
/// Used for the cross-currency collateral leg of a leveraged reservation,
/// where rounding up would reserve more than the free balance covers.
#[must_use]
#[inline]
pub fn round_down(x: Decimal, decimals: u32) -> Decimal {
    x.round_dp_with_strategy(decimals, RoundingStrategy::ToZero)
}

/// Round away from zero to `decimals` fractional digits.
///
/// Used when releasing the natural-side remainder of a partially freed
/// leveraged reservation.
#[must_use]
#[inline]
pub fn round_up(x: Decimal, decimals: u32) -> Decimal {
    x.round_dp_with_strategy(decimals, RoundingStrategy::AwayFromZero)
}

/// Functor lift of [`round`] over an optional amount.
#[must_use]
#[inline]
pub fn round_opt(x: Option<Decimal>, decimals: u32) -> Option<Decimal> {
    x.map(|v| round(v, decimals))
}

/// `1 + x`.
#[must_use]
#[inline]
pub fn dec1p(x: Decimal) -> Decimal {
    Decimal::ONE + x
}

/// `1 - x`.
#[must_use]
#[inline]
pub fn dec1m(x: Decimal) -> Decimal {
    Decimal::ONE - x
}

/// Fused multiply-add, `a * b + c`.
#[must_use]
#[inline]
pub fn fma(a: Decimal, b: Decimal, c: Decimal) -> Decimal {
    a * b + c
}
