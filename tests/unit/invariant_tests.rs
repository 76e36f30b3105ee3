//! Cross-cutting invariants: monetary conservation, book ordering and
//! reservation consistency under mixed activity.

use crate::common::*;
use exchange_sim::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

#[test]
fn base_and_quote_are_conserved_without_fees() {
    let mut exchange = exchange();
    exchange.register_remote_agent(0);
    exchange.register_remote_agent(1);
    exchange.register_remote_agent(2);

    let (base_before, quote_before) = totals(&exchange, 0);

    submit(&mut exchange, 0, limit_order(OrderDirection::Buy, dec!(2), dec!(98), 0), 1);
    submit(&mut exchange, 0, limit_order(OrderDirection::Sell, dec!(2), dec!(102), 0), 2);
    submit(&mut exchange, 1, limit_order(OrderDirection::Buy, dec!(1.5), dec!(99), 0), 3);
    submit(&mut exchange, 2, market_order(OrderDirection::Sell, dec!(2.5), 0), 4);
    submit(&mut exchange, 1, market_order(OrderDirection::Buy, dec!(1), 0), 5);
    submit(&mut exchange, 2, limit_order(OrderDirection::Sell, dec!(0.7), dec!(101), 0), 6);
    submit(&mut exchange, 0, market_order(OrderDirection::Buy, dec!(0.7), 0), 7);

    let (base_after, quote_after) = totals(&exchange, 0);
    assert_eq!(base_before, base_after);
    assert_eq!(quote_before, quote_after);
    assert_account_invariants(&exchange);
}

#[test]
fn best_bid_stays_below_best_ask() {
    let mut exchange = exchange();
    exchange.register_remote_agent(0);
    exchange.register_remote_agent(1);

    let orders = [
        (0, OrderDirection::Buy, dec!(1), dec!(99)),
        (1, OrderDirection::Sell, dec!(1), dec!(101)),
        (0, OrderDirection::Buy, dec!(2), dec!(100)),
        (1, OrderDirection::Sell, dec!(2), dec!(100.5)),
        (0, OrderDirection::Buy, dec!(1), dec!(100.5)), // crosses
        (1, OrderDirection::Sell, dec!(1), dec!(99.5)), // crosses
    ];
    for (agent, direction, volume, price) in orders {
        submit(&mut exchange, agent, limit_order(direction, volume, price, 0), 1);
        let book = exchange.book(0).unwrap();
        let bid = book.best_bid();
        let ask = book.best_ask();
        if bid > Decimal::ZERO && ask > Decimal::ZERO {
            assert!(bid < ask, "crossed book: bid {bid} >= ask {ask}");
        }
    }
    assert_account_invariants(&exchange);
}

#[test]
fn reserve_exactly_free_drains_the_balance() {
    let mut exchange = exchange();
    let agent = exchange.register_local_agent("solo_0");

    // 5000 quote buys exactly 50 units at 100
    submit(&mut exchange, agent, limit_order(OrderDirection::Buy, dec!(50), dec!(100), 0), 1);
    let balances = exchange.accounts().get(agent).unwrap().at(0);
    assert_eq!(balances.quote.free(), Decimal::ZERO);
    assert_eq!(balances.quote.reserved(), dec!(5000));

    // one increment more than free is unreservable
    let outcome = exchange.handle_request(
        agent,
        limit_order(OrderDirection::Buy, dec!(0.0001), dec!(100), 0),
        2,
    );
    let Err(error) = outcome.response else {
        panic!("expected rejection");
    };
    assert_eq!(error.code, OrderErrorCode::InsufficientQuote);
}

#[test]
fn reset_agent_restores_the_template_and_clears_the_books() {
    let mut exchange = exchange();
    exchange.register_remote_agent(0);
    exchange.register_remote_agent(1);

    submit(&mut exchange, 0, limit_order(OrderDirection::Buy, dec!(1), dec!(99), 0), 1);
    submit(&mut exchange, 0, limit_order(OrderDirection::Sell, dec!(1), dec!(101), 1), 2);
    submit(&mut exchange, 1, limit_order(OrderDirection::Buy, dec!(1), dec!(98), 0), 3);

    submit(
        &mut exchange,
        0,
        ExchangeRequest::ResetAgent { agent_ids: vec![0] },
        4,
    );

    // agent 0's orders are gone from both books, agent 1's remain
    assert_eq!(exchange.book(0).unwrap().best_bid(), dec!(98));
    assert_eq!(exchange.book(1).unwrap().best_ask(), Decimal::ZERO);

    let balances = exchange.accounts().get(0).unwrap().at(0);
    assert_eq!(balances.base.total(), dec!(100));
    assert_eq!(balances.quote.total(), dec!(5000));
    assert_eq!(balances.quote.reserved(), Decimal::ZERO);
    assert!(exchange.accounts().get(0).unwrap().active_orders(0).is_empty());
    assert_account_invariants(&exchange);
}

#[test]
fn retrieval_requests_reflect_the_book() {
    let mut exchange = exchange();
    exchange.register_remote_agent(0);

    submit(&mut exchange, 0, limit_order(OrderDirection::Buy, dec!(2), dec!(99), 0), 1);
    submit(&mut exchange, 0, limit_order(OrderDirection::Buy, dec!(1), dec!(98), 0), 2);
    let sell = submit(&mut exchange, 0, limit_order(OrderDirection::Sell, dec!(3), dec!(101), 0), 3);
    let sell_id = placed_order_id(&sell);

    let outcome = exchange.handle_request(0, ExchangeRequest::RetrieveL1 { book_id: 0 }, 4);
    let Ok(ExchangeResponse::ResponseRetrieveL1 { snapshot, .. }) = outcome.response else {
        panic!("unexpected response");
    };
    assert_eq!(snapshot.best_bid, dec!(99));
    assert_eq!(snapshot.best_ask, dec!(101));
    assert_eq!(snapshot.bid_volume, dec!(2));
    assert_eq!(snapshot.ask_volume, dec!(3));

    let outcome = exchange.handle_request(0, ExchangeRequest::RetrieveBook { book_id: 0, depth: 10 }, 5);
    let Ok(ExchangeResponse::ResponseRetrieveBook { bids, asks, .. }) = outcome.response else {
        panic!("unexpected response");
    };
    assert_eq!(bids.len(), 2);
    assert_eq!(bids[0].price, dec!(99));
    assert_eq!(bids[1].price, dec!(98));
    assert_eq!(asks.len(), 1);

    let outcome = exchange.handle_request(
        0,
        ExchangeRequest::RetrieveOrders {
            book_id: 0,
            order_ids: vec![sell_id, 999],
        },
        6,
    );
    let Ok(ExchangeResponse::ResponseRetrieveOrders { orders, .. }) = outcome.response else {
        panic!("unexpected response");
    };
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].header.id, sell_id);
    assert_eq!(orders[0].price, dec!(101));
}

#[test]
fn balances_serialize_for_the_persisted_layout() {
    let mut exchange = exchange();
    let agent = exchange.register_local_agent("solo_0");
    submit(&mut exchange, agent, limit_order(OrderDirection::Buy, dec!(1), dec!(99), 0), 1);

    let balances = exchange.accounts().get(agent).unwrap().at(0);
    let json = serde_json::to_value(balances).unwrap();
    assert_eq!(json["quote"]["reserved"], "99");
    assert_eq!(json["quote"]["free"], "4901");
    assert!(json["loans"].as_object().unwrap().is_empty());
}
