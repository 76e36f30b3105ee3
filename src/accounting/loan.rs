//! Loans backing leveraged positions.

use crate::accounting::collateral::Collateral;
use crate::book::OrderDirection;
use crate::decimal::{dec1m, round};
use rust_decimal::Decimal;
use serde::Serialize;

/// Rounding precision of the two currencies of a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoundParams {
    pub base_decimals: u32,
    pub quote_decimals: u32,
}

/// A margin loan opened by a leveraged order.
///
/// The amount is denominated in the order's natural spend currency: quote
/// for BUY positions, base for SELL positions. `undrawn` tracks how much of
/// the principal is still available to fund fills of the opening order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Loan {
    amount: Decimal,
    direction: OrderDirection,
    leverage: Decimal,
    collateral: Collateral,
    margin_call_price: Decimal,
    undrawn: Decimal,
}

impl Loan {
    #[must_use]
    pub fn new(
        amount: Decimal,
        direction: OrderDirection,
        leverage: Decimal,
        collateral: Collateral,
        margin_call_price: Decimal,
    ) -> Self {
        Self {
            amount,
            direction,
            leverage,
            collateral,
            margin_call_price,
            undrawn: amount,
        }
    }

    #[must_use]
    #[inline]
    pub fn amount(&self) -> Decimal {
        self.amount
    }

    #[must_use]
    #[inline]
    pub fn direction(&self) -> OrderDirection {
        self.direction
    }

    #[must_use]
    #[inline]
    pub fn leverage(&self) -> Decimal {
        self.leverage
    }

    #[must_use]
    #[inline]
    pub fn collateral(&self) -> &Collateral {
        &self.collateral
    }

    #[must_use]
    #[inline]
    pub fn margin_call_price(&self) -> Decimal {
        self.margin_call_price
    }

    /// Re-mark the liquidation threshold after a fill at a new price.
    pub fn set_margin_call_price(&mut self, price: Decimal) {
        self.margin_call_price = price;
    }

    /// Draw up to `amount` of the undrawn principal to fund a fill.
    /// Returns the amount actually drawn.
    pub fn draw(&mut self, amount: Decimal) -> Decimal {
        let drawn = amount.min(self.undrawn).max(Decimal::ZERO);
        self.undrawn -= drawn;
        drawn
    }

    /// Shrink the principal when part of the opening order is cancelled.
    /// Returns the reduction applied, clamped to the outstanding amount.
    pub fn reduce_principal(&mut self, amount: Decimal) -> Decimal {
        let reduction = amount.min(self.amount).max(Decimal::ZERO);
        self.amount -= reduction;
        self.undrawn = self.undrawn.min(self.amount);
        reduction
    }

    /// Shrink the recorded collateral when a commit consumes part of it.
    pub fn consume_collateral(&mut self, base: Decimal, quote: Decimal) -> Collateral {
        let consumed = Collateral::new(base.min(self.collateral.base), quote.min(self.collateral.quote));
        self.collateral -= consumed;
        consumed
    }

    /// Repay `amount` of the loan at `price`, releasing collateral in
    /// proportion.
    ///
    /// With `r = amount / self.amount`, `q1` the share of collateral value
    /// held in base at `price` and `q2 = 1 - q1`: a BUY loan releases base
    /// collateral by `min(r, q1) / q1`, dipping into quote collateral by
    /// `(r - q1) / q2` once `r > q1`. SELL loans swap the two roles. Each
    /// component rounds to its currency's decimals.
    ///
    /// # Panics
    /// When `amount` exceeds the outstanding loan (caller bug).
    pub fn settle(&mut self, amount: Decimal, price: Decimal, round_params: &RoundParams) -> Collateral {
        let amount = round(
            amount,
            match self.direction {
                OrderDirection::Buy => round_params.quote_decimals,
                OrderDirection::Sell => round_params.base_decimals,
            },
        );

        if amount == self.amount {
            self.amount = Decimal::ZERO;
            self.undrawn = Decimal::ZERO;
            return std::mem::take(&mut self.collateral);
        }
        assert!(
            amount <= self.amount,
            "settle amount {amount} greater than outstanding loan {}",
            self.amount,
        );

        let r = amount / self.amount;
        self.amount -= amount;
        self.undrawn = self.undrawn.min(self.amount);

        if self.collateral.is_zero() {
            return Collateral::default();
        }
        let q1 = self.collateral.base * price / self.collateral.value_in_quote(price);
        let q2 = dec1m(q1);

        match self.direction {
            OrderDirection::Buy => {
                let base_release = if r < q1 {
                    round(r / q1 * self.collateral.base, round_params.base_decimals)
                } else {
                    self.collateral.base
                };
                self.collateral.base -= base_release;
                if r <= q1 {
                    return Collateral::new(base_release, Decimal::ZERO);
                }
                let r_prime = r - q1;
                let quote_release =
                    round(r_prime / q2 * self.collateral.quote, round_params.quote_decimals);
                self.collateral.quote -= quote_release;
                Collateral::new(base_release, quote_release)
            }
            OrderDirection::Sell => {
                let quote_release = if r < q2 {
                    round(r / q2 * self.collateral.quote, round_params.quote_decimals)
                } else {
                    self.collateral.quote
                };
                self.collateral.quote -= quote_release;
                if r <= q2 {
                    return Collateral::new(Decimal::ZERO, quote_release);
                }
                let r_prime = r - q2;
                let base_release =
                    round(r_prime / q1 * self.collateral.base, round_params.base_decimals);
                self.collateral.base -= base_release;
                Collateral::new(base_release, quote_release)
            }
        }
    }
}
