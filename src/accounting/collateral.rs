//! Two-currency collateral bundle backing a leveraged position.

use rust_decimal::Decimal;
use serde::Serialize;
use std::ops::{AddAssign, SubAssign};

/// Collateral held against a loan, split across the base and quote
/// currencies of the book.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Collateral {
    pub base: Decimal,
    pub quote: Decimal,
}

impl Collateral {
    #[must_use]
    pub fn new(base: Decimal, quote: Decimal) -> Self {
        Self { base, quote }
    }

    /// Total value expressed in base units at `price` (quote per base).
    #[must_use]
    pub fn value_in_base(&self, price: Decimal) -> Decimal {
        self.base + self.quote / price
    }

    /// Total value expressed in quote units at `price`.
    #[must_use]
    pub fn value_in_quote(&self, price: Decimal) -> Decimal {
        self.base * price + self.quote
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.base == Decimal::ZERO && self.quote == Decimal::ZERO
    }
}

impl AddAssign for Collateral {
    fn add_assign(&mut self, other: Self) {
        self.base += other.base;
        self.quote += other.quote;
    }
}

impl SubAssign for Collateral {
    fn sub_assign(&mut self, other: Self) {
        self.base -= other.base;
        self.quote -= other.quote;
    }
}
