//! Margin-call geometry.

use crate::book::OrderDirection;
use crate::decimal::{dec1m, dec1p};
use rust_decimal::Decimal;

/// Closed-form reference price at which a position opened at `price` with
/// the given leverage hits the maintenance-margin threshold.
///
/// BUY positions liquidate when the price falls to
/// `price * L / ((1 + L) * (1 - m))`; SELL positions when it rises to
/// `price * (2 + L) / ((1 + L) * (1 + m))`.
#[must_use]
pub fn margin_call_price(
    price: Decimal,
    leverage: Decimal,
    direction: OrderDirection,
    maintenance_margin: Decimal,
) -> Decimal {
    match direction {
        OrderDirection::Buy => {
            price * leverage / (dec1p(leverage) * dec1m(maintenance_margin))
        }
        OrderDirection::Sell => {
            price * (Decimal::TWO + leverage) / (dec1p(leverage) * dec1p(maintenance_margin))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decimal::round;
    use rust_decimal_macros::dec;

    #[test]
    fn buy_call_price_matches_the_closed_form() {
        // 3 * 1.2 / (2.2 * 0.75)
        let p = margin_call_price(dec!(3), dec!(1.2), OrderDirection::Buy, dec!(0.25));
        assert_eq!(round(p, 8), dec!(2.18181818));
    }

    #[test]
    fn sell_call_price_matches_the_closed_form() {
        // 3 * (2 + 1.2) / (2.2 * 1.25)
        let p = margin_call_price(dec!(3), dec!(1.2), OrderDirection::Sell, dec!(0.25));
        assert_eq!(round(p, 8), dec!(3.49090909));
    }

    #[test]
    fn zero_leverage_buy_never_calls() {
        let p = margin_call_price(dec!(3), Decimal::ZERO, OrderDirection::Buy, dec!(0.25));
        assert_eq!(p, Decimal::ZERO);
    }
}
