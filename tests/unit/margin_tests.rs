//! Leveraged reservations, loans and margin-call liquidation.

use crate::common::*;
use exchange_sim::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Thin single-book setup matching the reservation worked example:
/// 10 base and 200 quote.
fn thin_config() -> ExchangeConfig {
    let mut config = config();
    config.books = 1;
    config.initial_base = dec!(10);
    config.initial_quote = dec!(200);
    config
}

fn leveraged_buy(volume: Decimal, price: Decimal, leverage: Decimal) -> ExchangeRequest {
    ExchangeRequest::PlaceOrderLimit(PlaceOrderLimitPayload {
        direction: OrderDirection::Buy,
        volume,
        price,
        leverage,
        book_id: 0,
        currency: Currency::Base,
        client_order_id: None,
        post_only: false,
        time_in_force: TimeInForce::Gtc,
        expiry_period: None,
        stp_flag: StpFlag::None,
        settle_flag: SettleFlag::Fifo,
    })
}

#[test]
fn leveraged_buy_reservation_opens_a_loan() {
    let mut exchange = MultiBookExchange::new(thin_config()).unwrap();
    let agent = exchange.register_local_agent("margin_0");

    // 10 base at 3 with 1.2x leverage: leveraged cost 10 * 2.2 * 3 = 66,
    // collateral 66 / 2.2 = 30, loan 30 * 1.2 = 36
    let outcome = submit(&mut exchange, agent, leveraged_buy(dec!(10), dec!(3), dec!(1.2)), 1);
    let order_id = placed_order_id(&outcome);

    let balances = exchange.accounts().get(agent).unwrap().at(0);
    assert_eq!(balances.quote.reservation(order_id), Some(dec!(30)));
    assert_eq!(balances.base.reservation(order_id), None);
    let loan = balances.loan(order_id).expect("loan opened");
    assert_eq!(loan.amount(), dec!(36));
    assert_eq!(balances.quote_loan(), dec!(36));
    // margin call at 3 * 1.2 / (2.2 * 0.75)
    assert_eq!(round(loan.margin_call_price(), 8), dec!(2.18181818));
    assert_account_invariants(&exchange);
}

#[test]
fn oversized_collateral_spills_into_the_base_balance() {
    let mut exchange = MultiBookExchange::new(thin_config()).unwrap();
    let agent = exchange.register_local_agent("margin_0");

    // volume 70 at 3 with 1.2x: cost 462, collateral 210 > 200 free quote,
    // so the last 10 quote of collateral is held in base
    let outcome = submit(&mut exchange, agent, leveraged_buy(dec!(70), dec!(3), dec!(1.2)), 1);
    let order_id = placed_order_id(&outcome);

    let balances = exchange.accounts().get(agent).unwrap().at(0);
    assert_eq!(balances.quote.reservation(order_id), Some(dec!(200)));
    // the remaining 10 quote of collateral, valued at 3, rounds down
    assert_eq!(balances.base.reservation(order_id), Some(dec!(3.3333)));
    assert_account_invariants(&exchange);
}

#[test]
fn cancelling_a_leveraged_order_dissolves_the_loan() {
    let mut exchange = MultiBookExchange::new(thin_config()).unwrap();
    let agent = exchange.register_local_agent("margin_0");

    let outcome = submit(&mut exchange, agent, leveraged_buy(dec!(10), dec!(3), dec!(1.2)), 1);
    let order_id = placed_order_id(&outcome);
    submit(
        &mut exchange,
        agent,
        ExchangeRequest::CancelOrders {
            book_id: 0,
            cancellations: vec![CancellationItem { order_id, volume: None }],
        },
        2,
    );

    let balances = exchange.accounts().get(agent).unwrap().at(0);
    assert!(balances.loan(order_id).is_none());
    assert_eq!(balances.quote_loan(), Decimal::ZERO);
    assert_eq!(balances.quote_collateral(), Decimal::ZERO);
    assert_eq!(balances.quote.reserved(), Decimal::ZERO);
    assert_eq!(balances.quote.total(), dec!(200));
    assert_account_invariants(&exchange);
}

#[test]
fn leveraged_fill_draws_the_loan_before_collateral() {
    let mut exchange = exchange();
    exchange.register_remote_agent(0); // seller
    exchange.register_remote_agent(1); // leveraged buyer

    submit(&mut exchange, 0, limit_order(OrderDirection::Sell, dec!(22), dec!(3), 0), 1);
    let outcome = submit(&mut exchange, 1, leveraged_buy(dec!(10), dec!(3), dec!(1.2)), 2);
    let order_id = placed_order_id(&outcome);

    let buyer = exchange.accounts().get(1).unwrap().at(0);
    // 66 quote spent: 36 drawn from the loan, 30 from the collateral
    // reservation; only the collateral leaves the buyer's ledger
    assert_eq!(buyer.quote.total(), dec!(4970));
    assert_eq!(buyer.quote.reserved(), Decimal::ZERO);
    assert_eq!(buyer.base.total(), dec!(122));
    let loan = buyer.loan(order_id).expect("position stays open");
    assert_eq!(loan.amount(), dec!(36));
    assert_eq!(buyer.quote_loan(), dec!(36));

    let seller = exchange.accounts().get(0).unwrap().at(0);
    assert_eq!(seller.base.total(), dec!(78));
    assert_eq!(seller.quote.total(), dec!(5066));
    assert_account_invariants(&exchange);
}

#[test]
fn close_positions_repays_the_loan() {
    let mut exchange = exchange();
    exchange.register_remote_agent(0);
    exchange.register_remote_agent(1);

    submit(&mut exchange, 0, limit_order(OrderDirection::Sell, dec!(22), dec!(3), 0), 1);
    let outcome = submit(&mut exchange, 1, leveraged_buy(dec!(10), dec!(3), dec!(1.2)), 2);
    let order_id = placed_order_id(&outcome);

    // liquidity to close against
    submit(&mut exchange, 0, limit_order(OrderDirection::Buy, dec!(30), dec!(3), 0), 3);

    let close = submit(
        &mut exchange,
        1,
        ExchangeRequest::ClosePositions {
            book_id: 0,
            positions: vec![ClosePositionItem { order_id, volume: None }],
        },
        4,
    );
    let Ok(ExchangeResponse::ResponseClosePositions { closed, .. }) = close.response else {
        panic!("unexpected response");
    };
    assert_eq!(closed, vec![order_id]);

    let buyer = exchange.accounts().get(1).unwrap().at(0);
    assert!(buyer.loan(order_id).is_none());
    assert_eq!(buyer.quote_loan(), Decimal::ZERO);
    // sold 12 base at 3 to raise the 36 owed
    assert_eq!(buyer.base.total(), dec!(110));
    assert_eq!(buyer.quote.total(), dec!(4970));
    assert_account_invariants(&exchange);
}

#[test]
fn margin_call_force_closes_the_underwater_long() {
    let mut exchange = exchange();
    exchange.register_remote_agent(0);
    exchange.register_remote_agent(1);

    submit(&mut exchange, 0, limit_order(OrderDirection::Sell, dec!(22), dec!(3), 0), 1);
    let outcome = submit(&mut exchange, 1, leveraged_buy(dec!(10), dec!(3), dec!(1.2)), 2);
    let order_id = placed_order_id(&outcome);
    assert_eq!(
        exchange
            .clearing()
            .margin_call_prices(0, OrderDirection::Buy)
            .len(),
        1
    );

    // a bid to liquidate into
    submit(&mut exchange, 0, limit_order(OrderDirection::Buy, dec!(30), dec!(2), 0), 3);

    // price above the call threshold: nothing happens
    exchange.check_margin_calls(0, dec!(2.5), 4);
    assert!(exchange.accounts().get(1).unwrap().at(0).loan(order_id).is_some());

    // price crosses p* = 2.1818..: the long is force-closed
    exchange.check_margin_calls(0, dec!(2.0), 5);

    let buyer = exchange.accounts().get(1).unwrap().at(0);
    assert!(buyer.loan(order_id).is_none());
    assert_eq!(buyer.quote_loan(), Decimal::ZERO);
    // sold 18 base at 2 to repay the 36 owed
    assert_eq!(buyer.base.total(), dec!(104));
    assert_eq!(buyer.quote.total(), dec!(4970));
    assert!(exchange
        .clearing()
        .margin_call_prices(0, OrderDirection::Buy)
        .is_empty());
    assert_account_invariants(&exchange);
}

#[test]
fn exceeding_the_loan_cap_is_rejected() {
    let mut config = thin_config();
    config.max_loan = dec!(10);
    let mut exchange = MultiBookExchange::new(config).unwrap();
    let agent = exchange.register_local_agent("margin_0");

    let outcome = exchange.handle_request(agent, leveraged_buy(dec!(10), dec!(3), dec!(1.2)), 1);
    let Err(error) = outcome.response else {
        panic!("expected rejection");
    };
    assert_eq!(error.code, OrderErrorCode::ExceedingLoan);
}

#[test]
fn leverage_above_the_cap_is_rejected() {
    let mut exchange = MultiBookExchange::new(thin_config()).unwrap();
    let agent = exchange.register_local_agent("margin_0");
    let outcome = exchange.handle_request(agent, leveraged_buy(dec!(1), dec!(3), dec!(9)), 1);
    let Err(error) = outcome.response else {
        panic!("expected rejection");
    };
    assert_eq!(error.code, OrderErrorCode::InvalidLeverage);
}
