//! Shared helpers for the integration suite.

use exchange_sim::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Zero-fee, two-book exchange with the balances used by the seeded
/// scenarios: 100 base and 5000 quote per agent.
pub fn exchange() -> MultiBookExchange {
    MultiBookExchange::new(config()).expect("valid test config")
}

pub fn config() -> ExchangeConfig {
    ExchangeConfig {
        price_decimals: 2,
        volume_decimals: 4,
        base_decimals: 4,
        quote_decimals: 8,
        initial_price: dec!(100),
        maintenance_margin: dec!(0.25),
        max_leverage: dec!(5),
        max_loan: dec!(1000000),
        min_order_size: None,
        max_open_orders: None,
        books: 2,
        initial_base: dec!(100),
        initial_quote: dec!(5000),
        fee_policy: FeePolicyConfig::zero_fee(),
    }
}

pub fn limit_order(
    direction: OrderDirection,
    volume: Decimal,
    price: Decimal,
    book_id: BookId,
) -> ExchangeRequest {
    ExchangeRequest::PlaceOrderLimit(PlaceOrderLimitPayload {
        direction,
        volume,
        price,
        leverage: Decimal::ZERO,
        book_id,
        currency: Currency::Base,
        client_order_id: None,
        post_only: false,
        time_in_force: TimeInForce::Gtc,
        expiry_period: None,
        stp_flag: StpFlag::None,
        settle_flag: SettleFlag::Fifo,
    })
}

pub fn market_order(direction: OrderDirection, volume: Decimal, book_id: BookId) -> ExchangeRequest {
    ExchangeRequest::PlaceOrderMarket(PlaceOrderMarketPayload {
        direction,
        volume,
        leverage: Decimal::ZERO,
        book_id,
        currency: Currency::Base,
        client_order_id: None,
        stp_flag: StpFlag::None,
        settle_flag: SettleFlag::Fifo,
    })
}

/// Submit a request that is expected to succeed, returning its outcome.
pub fn submit(
    exchange: &mut MultiBookExchange,
    agent_id: AgentId,
    request: ExchangeRequest,
    timestamp: Timestamp,
) -> RequestOutcome {
    let outcome = exchange.handle_request(agent_id, request, timestamp);
    assert!(
        outcome.response.is_ok(),
        "request failed: {:?}",
        outcome.response
    );
    outcome
}

/// The order id assigned by a successful placement.
pub fn placed_order_id(outcome: &RequestOutcome) -> OrderId {
    match outcome.response.as_ref().expect("successful placement") {
        ExchangeResponse::ResponsePlaceOrderLimit { order_id, .. }
        | ExchangeResponse::ResponsePlaceOrderMarket { order_id, .. } => *order_id,
        other => panic!("not a placement response: {other:?}"),
    }
}

/// Check the balance and reservation invariants for every account.
pub fn assert_account_invariants(exchange: &MultiBookExchange) {
    for (_, account) in exchange.accounts().iter() {
        for book_id in 0..account.book_count() as BookId {
            let balances = account.at(book_id);
            for balance in [&balances.base, &balances.quote] {
                assert_eq!(balance.total(), balance.free() + balance.reserved());
                assert!(balance.free() >= Decimal::ZERO);
                assert!(balance.reserved() >= Decimal::ZERO);
                let sum: Decimal = balance.reservations().values().copied().sum();
                assert_eq!(sum, balance.reserved());
                assert!(balance.reservations().values().all(|r| *r > Decimal::ZERO));
            }
        }
    }
}

/// Total base and quote across all agents on one book.
pub fn totals(exchange: &MultiBookExchange, book_id: BookId) -> (Decimal, Decimal) {
    let mut base = Decimal::ZERO;
    let mut quote = Decimal::ZERO;
    for (_, account) in exchange.accounts().iter() {
        let balances = account.at(book_id);
        base += balances.base.total();
        quote += balances.quote.total();
    }
    (base, quote)
}
