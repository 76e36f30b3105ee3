//! Fee accrual and tier progression through the exchange.

use crate::common::*;
use exchange_sim::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn tiered_config() -> ExchangeConfig {
    let mut config = config();
    config.books = 1;
    config.fee_policy = FeePolicyConfig {
        history_slots: 2,
        slot_period: 1_000,
        tiers: vec![
            TierConfig {
                volume_required: Decimal::ZERO,
                maker_fee: dec!(0.001),
                taker_fee: dec!(0.002),
            },
            TierConfig {
                volume_required: dec!(150),
                maker_fee: Decimal::ZERO,
                taker_fee: dec!(0.001),
            },
        ],
    };
    config
}

#[test]
fn fees_are_charged_maker_and_taker() {
    let mut exchange = MultiBookExchange::new(tiered_config()).unwrap();
    exchange.register_remote_agent(0);
    exchange.register_remote_agent(1);

    submit(&mut exchange, 0, limit_order(OrderDirection::Sell, dec!(1), dec!(100), 0), 1);
    let outcome = submit(&mut exchange, 1, market_order(OrderDirection::Buy, dec!(1), 0), 2);
    assert!(outcome.response.is_ok());

    // maker receives 100 minus 0.1% maker fee
    let maker = exchange.accounts().get(0).unwrap().at(0);
    assert_eq!(maker.quote.total(), dec!(5000) + dec!(100) - dec!(0.1));
    assert_eq!(maker.base.total(), dec!(99));

    // taker pays 100 plus 0.2% taker fee
    let taker = exchange.accounts().get(1).unwrap().at(0);
    assert_eq!(taker.quote.total(), dec!(5000) - dec!(100) - dec!(0.2));
    assert_eq!(taker.base.total(), dec!(101));
    assert_account_invariants(&exchange);
}

#[test]
fn traded_volume_promotes_the_tier_on_the_slot_boundary() {
    let mut exchange = MultiBookExchange::new(tiered_config()).unwrap();
    exchange.register_remote_agent(0);
    exchange.register_remote_agent(1);

    // 2 units at 100 = 200 quote of volume, above the 150 requirement
    submit(&mut exchange, 0, limit_order(OrderDirection::Sell, dec!(2), dec!(100), 0), 1);
    submit(&mut exchange, 1, market_order(OrderDirection::Buy, dec!(2), 0), 2);

    let before = exchange.fee_state(0, 0);
    assert_eq!(before.tier_index, 0);
    assert_eq!(before.history.iter().copied().sum::<Decimal>(), dec!(200));

    exchange.update_fee_tiers(1_000);

    let maker_state = exchange.fee_state(0, 0);
    assert_eq!(maker_state.tier_index, 1);
    let taker_state = exchange.fee_state(0, 1);
    assert_eq!(taker_state.tier_index, 1);

    // the volume leaves the two-slot window after two more boundaries
    exchange.update_fee_tiers(2_000);
    assert_eq!(exchange.fee_state(0, 0).tier_index, 1);
    exchange.update_fee_tiers(3_000);
    assert_eq!(exchange.fee_state(0, 0).tier_index, 0);
}

#[test]
fn tier_update_off_the_slot_boundary_is_a_noop() {
    let mut exchange = MultiBookExchange::new(tiered_config()).unwrap();
    exchange.register_remote_agent(0);
    exchange.register_remote_agent(1);

    submit(&mut exchange, 0, limit_order(OrderDirection::Sell, dec!(2), dec!(100), 0), 1);
    submit(&mut exchange, 1, market_order(OrderDirection::Buy, dec!(2), 0), 2);

    exchange.update_fee_tiers(1_500);
    assert_eq!(exchange.fee_state(0, 0).tier_index, 0);
}
