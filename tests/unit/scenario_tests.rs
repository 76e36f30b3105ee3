//! End-to-end scenarios through the exchange front door.

use crate::common::*;
use exchange_sim::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

#[test]
fn single_agent_crossing_round_trips_cash() {
    let mut exchange = exchange();
    let agent = exchange.register_local_agent("solo_0");

    submit(&mut exchange, agent, limit_order(OrderDirection::Buy, dec!(1), dec!(99), 0), 1);
    submit(&mut exchange, agent, limit_order(OrderDirection::Sell, dec!(1), dec!(101), 0), 2);

    {
        let book = exchange.book(0).unwrap();
        assert_eq!(book.best_bid(), dec!(99));
        assert_eq!(book.best_ask(), dec!(101));
        let balances = exchange.accounts().get(agent).unwrap().at(0);
        assert_eq!(balances.base.reserved(), dec!(1));
        assert_eq!(balances.quote.reserved(), dec!(99));
        assert_eq!(balances.base.free(), dec!(99));
        assert_eq!(balances.quote.free(), dec!(4901));
    }

    // the agent's own market sell lifts its own bid
    submit(&mut exchange, agent, market_order(OrderDirection::Sell, dec!(1), 0), 3);

    let book = exchange.book(0).unwrap();
    assert_eq!(book.best_bid(), Decimal::ZERO);
    assert_eq!(book.best_ask(), dec!(101));

    let balances = exchange.accounts().get(agent).unwrap().at(0);
    assert_eq!(balances.base.total(), dec!(100));
    assert_eq!(balances.quote.total(), dec!(5000));
    assert_eq!(balances.base.reserved(), dec!(1));
    assert_eq!(balances.quote.reserved(), Decimal::ZERO);
    assert_account_invariants(&exchange);
}

#[test]
fn two_agent_match_settles_both_sides() {
    let mut exchange = exchange();
    exchange.register_remote_agent(0);
    exchange.register_remote_agent(1);

    submit(&mut exchange, 0, limit_order(OrderDirection::Buy, dec!(1), dec!(99), 0), 1);
    submit(&mut exchange, 0, limit_order(OrderDirection::Sell, dec!(1), dec!(101), 0), 2);
    submit(&mut exchange, 1, market_order(OrderDirection::Buy, dec!(1), 0), 3);

    let book = exchange.book(0).unwrap();
    assert_eq!(book.best_bid(), dec!(99));
    assert_eq!(book.best_ask(), Decimal::ZERO);

    let maker = exchange.accounts().get(0).unwrap().at(0);
    assert_eq!(maker.base.total(), dec!(99));
    assert_eq!(maker.quote.total(), dec!(5101));
    assert_eq!(maker.quote.reserved(), dec!(99));

    let taker = exchange.accounts().get(1).unwrap().at(0);
    assert_eq!(taker.base.total(), dec!(101));
    assert_eq!(taker.quote.total(), dec!(4899));
    assert_eq!(taker.base.reserved(), Decimal::ZERO);
    assert_eq!(taker.quote.reserved(), Decimal::ZERO);
    assert_account_invariants(&exchange);
}

#[test]
fn market_order_exceeding_depth_drops_the_residual() {
    let mut exchange = exchange();
    exchange.register_remote_agent(0);
    exchange.register_remote_agent(1);

    submit(&mut exchange, 0, limit_order(OrderDirection::Buy, dec!(1), dec!(99), 0), 1);
    submit(&mut exchange, 0, limit_order(OrderDirection::Sell, dec!(1), dec!(101), 0), 2);
    // only one unit of depth exists; the second unit is discarded
    submit(&mut exchange, 1, market_order(OrderDirection::Buy, dec!(2), 0), 3);

    let book = exchange.book(0).unwrap();
    assert_eq!(book.best_bid(), dec!(99));
    assert_eq!(book.best_ask(), Decimal::ZERO);

    let maker = exchange.accounts().get(0).unwrap().at(0);
    assert_eq!(maker.base.total(), dec!(99));
    assert_eq!(maker.quote.total(), dec!(5101));

    let taker = exchange.accounts().get(1).unwrap().at(0);
    assert_eq!(taker.base.total(), dec!(101));
    assert_eq!(taker.quote.total(), dec!(4899));
    assert_eq!(taker.quote.reserved(), Decimal::ZERO);
    assert_account_invariants(&exchange);
}

#[test]
fn partial_cancel_leaves_the_remainder_resting() {
    let mut exchange = exchange();
    let agent = exchange.register_local_agent("solo_0");

    submit(&mut exchange, agent, limit_order(OrderDirection::Buy, dec!(2), dec!(99), 0), 1);
    let sell = submit(&mut exchange, agent, limit_order(OrderDirection::Sell, dec!(3), dec!(101), 0), 2);
    let sell_id = placed_order_id(&sell);

    submit(
        &mut exchange,
        agent,
        ExchangeRequest::CancelOrders {
            book_id: 0,
            cancellations: vec![CancellationItem {
                order_id: sell_id,
                volume: Some(dec!(1.5)),
            }],
        },
        3,
    );

    let book = exchange.book(0).unwrap();
    assert_eq!(book.best_bid(), dec!(99));
    assert_eq!(book.best_ask(), dec!(101));
    assert_eq!(book.ask_levels(1)[0].volume, dec!(1.5));
    assert_eq!(book.bid_levels(1)[0].volume, dec!(2));

    let balances = exchange.accounts().get(agent).unwrap().at(0);
    assert_eq!(balances.base.reserved(), dec!(1.5));
    assert_eq!(balances.quote.reserved(), dec!(198));
    assert_account_invariants(&exchange);
}

#[test]
fn books_are_independent() {
    let mut exchange = exchange();
    let agent = exchange.register_local_agent("solo_0");

    let mut order_ids = Vec::new();
    for book_id in [0, 1] {
        let buy = submit(&mut exchange, agent, limit_order(OrderDirection::Buy, dec!(1), dec!(99), book_id), 1);
        let sell = submit(&mut exchange, agent, limit_order(OrderDirection::Sell, dec!(1), dec!(101), book_id), 2);
        order_ids.push((book_id, placed_order_id(&buy), placed_order_id(&sell)));
    }

    let (book_id, buy_id, sell_id) = order_ids[0];
    submit(
        &mut exchange,
        agent,
        ExchangeRequest::CancelOrders {
            book_id,
            cancellations: vec![
                CancellationItem { order_id: buy_id, volume: None },
                CancellationItem { order_id: sell_id, volume: None },
            ],
        },
        3,
    );

    let book0 = exchange.book(0).unwrap();
    assert_eq!(book0.best_bid(), Decimal::ZERO);
    assert_eq!(book0.best_ask(), Decimal::ZERO);

    let book1 = exchange.book(1).unwrap();
    assert_eq!(book1.best_bid(), dec!(99));
    assert_eq!(book1.best_ask(), dec!(101));

    let balances0 = exchange.accounts().get(agent).unwrap().at(0);
    assert_eq!(balances0.base.reserved(), Decimal::ZERO);
    assert_eq!(balances0.quote.reserved(), Decimal::ZERO);
    let balances1 = exchange.accounts().get(agent).unwrap().at(1);
    assert_eq!(balances1.base.reserved(), dec!(1));
    assert_eq!(balances1.quote.reserved(), dec!(99));
    assert_account_invariants(&exchange);
}

#[test]
fn place_then_cancel_is_a_round_trip() {
    let mut exchange = exchange();
    let agent = exchange.register_local_agent("solo_0");

    let placed = submit(&mut exchange, agent, limit_order(OrderDirection::Buy, dec!(1), dec!(99), 0), 1);
    let order_id = placed_order_id(&placed);
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
    assert_eq!(balances.base.total(), dec!(100));
    assert_eq!(balances.quote.total(), dec!(5000));
    assert_eq!(balances.base.reserved(), Decimal::ZERO);
    assert_eq!(balances.quote.reserved(), Decimal::ZERO);
    assert!(balances.quote.reservations().is_empty());
    assert_account_invariants(&exchange);
}

#[test]
fn cancel_of_unknown_id_changes_nothing() {
    let mut exchange = exchange();
    let agent = exchange.register_local_agent("solo_0");
    submit(&mut exchange, agent, limit_order(OrderDirection::Buy, dec!(1), dec!(99), 0), 1);

    let outcome = exchange.handle_request(
        agent,
        ExchangeRequest::CancelOrders {
            book_id: 0,
            cancellations: vec![CancellationItem { order_id: 999, volume: None }],
        },
        2,
    );
    let Ok(ExchangeResponse::ResponseCancelOrders { cancelled, .. }) = outcome.response else {
        panic!("cancel request itself should succeed");
    };
    assert!(cancelled.is_empty());

    let balances = exchange.accounts().get(agent).unwrap().at(0);
    assert_eq!(balances.quote.reserved(), dec!(99));
    assert_eq!(exchange.book(0).unwrap().best_bid(), dec!(99));
}

#[test]
fn unregistered_agents_are_rejected() {
    let mut exchange = exchange();
    let outcome = exchange.handle_request(7, market_order(OrderDirection::Buy, dec!(1), 0), 1);
    let Err(error) = outcome.response else {
        panic!("expected an error response");
    };
    assert_eq!(error.code, OrderErrorCode::NonexistentAccount);
    assert_eq!(error.message, "NONEXISTENT_ACCOUNT");
}

#[test]
fn one_agent_cannot_cancel_anothers_order() {
    let mut exchange = exchange();
    exchange.register_remote_agent(0);
    exchange.register_remote_agent(1);
    let placed = submit(&mut exchange, 0, limit_order(OrderDirection::Buy, dec!(1), dec!(99), 0), 1);
    let order_id = placed_order_id(&placed);

    let outcome = exchange.handle_request(
        1,
        ExchangeRequest::CancelOrders {
            book_id: 0,
            cancellations: vec![CancellationItem { order_id, volume: None }],
        },
        2,
    );
    let Ok(ExchangeResponse::ResponseCancelOrders { cancelled, .. }) = outcome.response else {
        panic!("unexpected response");
    };
    assert!(cancelled.is_empty());
    assert_eq!(exchange.book(0).unwrap().best_bid(), dec!(99));
}

#[test]
fn gtt_orders_expire_through_the_scheduled_cancel() {
    let mut exchange = exchange();
    let agent = exchange.register_local_agent("solo_0");

    let request = ExchangeRequest::PlaceOrderLimit(PlaceOrderLimitPayload {
        direction: OrderDirection::Buy,
        volume: dec!(1),
        price: dec!(99),
        leverage: Decimal::ZERO,
        book_id: 0,
        currency: Currency::Base,
        client_order_id: None,
        post_only: false,
        time_in_force: TimeInForce::Gtt,
        expiry_period: Some(500),
        stp_flag: StpFlag::None,
        settle_flag: SettleFlag::Fifo,
    });
    let outcome = submit(&mut exchange, agent, request, 100);
    let Ok(ExchangeResponse::ResponsePlaceOrderLimit { order_id, expiry_time, .. }) = outcome.response
    else {
        panic!("unexpected response");
    };
    assert_eq!(expiry_time, Some(600));

    assert!(exchange.expire_order(0, order_id, 600));
    assert_eq!(exchange.book(0).unwrap().best_bid(), Decimal::ZERO);
    let balances = exchange.accounts().get(agent).unwrap().at(0);
    assert_eq!(balances.quote.reserved(), Decimal::ZERO);

    // a second expiry of the same id is a no-op
    assert!(!exchange.expire_order(0, order_id, 601));
}

#[test]
fn l3_record_captures_the_full_lifecycle() {
    let mut exchange = exchange();
    exchange.retain_record(true);
    exchange.register_remote_agent(0);
    exchange.register_remote_agent(1);

    submit(&mut exchange, 0, limit_order(OrderDirection::Sell, dec!(1), dec!(101), 0), 1);
    submit(&mut exchange, 1, market_order(OrderDirection::Buy, dec!(1), 0), 2);
    let placed = submit(&mut exchange, 0, limit_order(OrderDirection::Buy, dec!(1), dec!(99), 0), 3);
    submit(
        &mut exchange,
        0,
        ExchangeRequest::CancelOrders {
            book_id: 0,
            cancellations: vec![CancellationItem {
                order_id: placed_order_id(&placed),
                volume: None,
            }],
        },
        4,
    );

    use exchange_sim::exchange::L3Event;
    let record = exchange.l3_record(0).unwrap();
    let kinds: Vec<&str> = record
        .iter()
        .map(|entry| match entry {
            L3Event::Order(_) => "order",
            L3Event::Trade(_) => "trade",
            L3Event::Cancellation(_) => "cancellation",
        })
        .collect();
    assert_eq!(kinds, vec!["order", "order", "trade", "order", "cancellation"]);
}

#[test]
fn trade_events_reach_subscribers() {
    let mut exchange = exchange();
    exchange.register_remote_agent(0);
    exchange.register_remote_agent(1);
    exchange.register_remote_agent(2);

    submit(&mut exchange, 2, ExchangeRequest::SubscribeEventTrade, 1);
    submit(&mut exchange, 0, limit_order(OrderDirection::Sell, dec!(1), dec!(101), 0), 2);
    let outcome = submit(&mut exchange, 1, market_order(OrderDirection::Buy, dec!(1), 0), 3);

    let trade_events: Vec<_> = outcome
        .notifications
        .iter()
        .filter(|n| matches!(n.event, ExchangeEvent::EventTrade { .. }))
        .collect();
    assert_eq!(trade_events.len(), 1);
    assert_eq!(trade_events[0].recipient, 2);
    let ExchangeEvent::EventTrade { trade, context, .. } = &trade_events[0].event else {
        unreachable!();
    };
    assert_eq!(trade.price, dec!(101));
    assert_eq!(context.aggressing_agent_id, 1);
    assert_eq!(context.resting_agent_id, 0);
}
