//! Orchestration of the order life-cycle: validate, reserve, commit fills,
//! release on cancel, and track margin-call prices.

use crate::accounting::{margin_call_price, AccountRegistry, ReserveError};
use crate::book::{OrderBook, OrderDirection, TradeEmission};
use crate::decimal::{dec1p, round};
use crate::exchange::fees::{Fees, SharedFeePolicy};
use crate::exchange::messages::{PlaceOrderLimitPayload, PlaceOrderMarketPayload};
use crate::exchange::validator::{OrderErrorCode, OrderPlacementValidator, Validation};
use crate::types::{AgentId, BookId, OrderId};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// A live leveraged position tracked under its margin-call price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarginOrderRef {
    pub order_id: OrderId,
    pub agent_id: AgentId,
}

/// A position whose margin-call price was crossed by a reference-price move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarginCall {
    pub book_id: BookId,
    pub order_id: OrderId,
    pub agent_id: AgentId,
    /// Direction of the position's loan; the force-close aggresses the
    /// opposite way.
    pub direction: OrderDirection,
}

/// A placement being cleared, before it reaches the book.
pub enum OrderDesc<'a> {
    Market {
        agent_id: AgentId,
        payload: &'a mut PlaceOrderMarketPayload,
    },
    Limit {
        agent_id: AgentId,
        payload: &'a mut PlaceOrderLimitPayload,
    },
}

/// Per-exchange clearing state: the validator, the shared fee policy, and
/// the per-book margin-call maps.
pub struct ClearingManager {
    validator: OrderPlacementValidator,
    fee_policy: SharedFeePolicy,
    maintenance_margin: Decimal,
    margin_buy: HashMap<BookId, BTreeMap<Decimal, Vec<MarginOrderRef>>>,
    margin_sell: HashMap<BookId, BTreeMap<Decimal, Vec<MarginOrderRef>>>,
}

impl ClearingManager {
    #[must_use]
    pub fn new(
        validator: OrderPlacementValidator,
        fee_policy: SharedFeePolicy,
        maintenance_margin: Decimal,
    ) -> Self {
        Self {
            validator,
            fee_policy,
            maintenance_margin,
            margin_buy: HashMap::new(),
            margin_sell: HashMap::new(),
        }
    }

    #[must_use]
    pub fn validator(&self) -> &OrderPlacementValidator {
        &self.validator
    }

    #[must_use]
    pub fn fee_policy(&self) -> &SharedFeePolicy {
        &self.fee_policy
    }

    /// Margin-call buckets currently tracked for a book side, for
    /// serialization and tests.
    #[must_use]
    pub fn margin_call_prices(&self, book_id: BookId, direction: OrderDirection) -> Vec<Decimal> {
        let map = match direction {
            OrderDirection::Buy => &self.margin_buy,
            OrderDirection::Sell => &self.margin_sell,
        };
        map.get(&book_id)
            .map(|buckets| buckets.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Validate a placement and reserve funds against the id the book will
    /// assign. Validation failures leave no state behind.
    pub fn handle_order(
        &mut self,
        accounts: &mut AccountRegistry,
        book: &OrderBook,
        max_leverage: Decimal,
        max_loan: Decimal,
        desc: OrderDesc<'_>,
    ) -> Result<Validation, OrderErrorCode> {
        let agent_id = match &desc {
            OrderDesc::Market { agent_id, .. } | OrderDesc::Limit { agent_id, .. } => *agent_id,
        };
        let account = accounts
            .get(agent_id)
            .ok_or(OrderErrorCode::NonexistentAccount)?;
        let fee_rates = self
            .fee_policy
            .read()
            .expect("fee policy lock poisoned")
            .get_rates(book.id(), agent_id);

        // the validator rounds the payload in place; the reservation price
        // must be read back afterwards
        let (validation, price) = match desc {
            OrderDesc::Market { payload, .. } => (
                self.validator.validate_market_order_placement(
                    account,
                    book,
                    payload,
                    fee_rates,
                    max_leverage,
                    max_loan,
                    agent_id,
                )?,
                Decimal::ZERO,
            ),
            OrderDesc::Limit { payload, .. } => {
                let validation = self.validator.validate_limit_order_placement(
                    account,
                    book,
                    payload,
                    fee_rates,
                    max_leverage,
                    max_loan,
                    agent_id,
                )?;
                (validation, payload.price)
            }
        };

        let order_id = book.order_factory().counter_state();
        let touch = match validation.direction {
            OrderDirection::Buy => book.best_ask(),
            OrderDirection::Sell => book.best_bid(),
        };
        let reservation_price = if price > Decimal::ZERO { price } else { touch };
        debug!(
            agent = agent_id,
            book = book.id(),
            order = order_id,
            amount = %validation.amount,
            leverage = %validation.leverage,
            direction = %validation.direction,
            "making reservation"
        );
        let balances = accounts
            .get_mut(agent_id)
            .expect("account existed above")
            .at_mut(book.id());
        balances
            .make_reservation(
                order_id,
                reservation_price,
                book.best_bid(),
                book.best_ask(),
                validation.amount,
                validation.leverage,
                validation.direction,
            )
            .map_err(|e| match e {
                ReserveError::NegativeAmount(_) => OrderErrorCode::InvalidVolume,
                ReserveError::Unreservable { .. } => match validation.direction {
                    OrderDirection::Buy => OrderErrorCode::InsufficientQuote,
                    OrderDirection::Sell => OrderErrorCode::InsufficientBase,
                },
            })?;

        Ok(validation)
    }

    /// Clear one emitted trade: fees, both commits, margin-call tracking and
    /// fee-tier history.
    ///
    /// # Panics
    /// When either side cannot be resolved against its owner's active
    /// orders, or a limit aggressor holds no reservation — both indicate the
    /// reservation machine and the book have diverged.
    pub fn handle_trade(
        &mut self,
        accounts: &mut AccountRegistry,
        book_id: BookId,
        emission: &TradeEmission,
    ) -> Fees {
        let trade = &emission.trade;
        let aggressing = &emission.aggressing;
        let resting = &emission.resting;
        let params = *self.validator.params();

        let resting_active = accounts
            .get(resting.agent_id)
            .is_some_and(|a| a.has_active_order(book_id, resting.order_id));
        assert!(
            resting_active,
            "resting order #{} not found in active orders of agent #{}",
            resting.order_id, resting.agent_id,
        );
        let aggressing_active = accounts
            .get(aggressing.agent_id)
            .is_some_and(|a| a.has_active_order(book_id, aggressing.order_id));
        assert!(
            aggressing_active,
            "aggressing order #{} not found in active orders of agent #{}",
            aggressing.order_id, aggressing.agent_id,
        );

        let mut fees = self
            .fee_policy
            .read()
            .expect("fee policy lock poisoned")
            .calculate_fees(
                book_id,
                resting.agent_id,
                aggressing.agent_id,
                trade.volume,
                trade.price,
            );
        fees.maker = round(fees.maker, params.quote_increment_decimals);
        fees.taker = round(fees.taker, params.quote_increment_decimals);

        let best_bid = emission.best_bid;
        let best_ask = emission.best_ask;
        let trade_quote = round(
            trade.volume * trade.price,
            params.quote_increment_decimals,
        );

        match trade.direction {
            OrderDirection::Buy => {
                // aggressing BUY spends quote; resting SELL spends base
                let agg_balances = accounts
                    .get(aggressing.agent_id)
                    .expect("checked above")
                    .at(book_id);
                let agg_leverage =
                    agg_balances.get_leverage(aggressing.order_id, OrderDirection::Buy);
                let reservation = round(
                    agg_balances.reservation_in_quote(aggressing.order_id, best_ask)
                        * dec1p(agg_leverage),
                    params.quote_increment_decimals,
                );

                let total_price = if aggressing.price.is_some() {
                    assert!(
                        reservation > Decimal::ZERO,
                        "no reservation for aggressing BUY order #{}",
                        aggressing.order_id,
                    );
                    if aggressing.fully_filled_by(trade.volume) {
                        reservation - fees.taker
                    } else {
                        round(trade.price, params.price_increment_decimals)
                            * round(trade.volume, params.volume_increment_decimals)
                    }
                } else {
                    round(trade.price, params.price_increment_decimals)
                        * round(trade.volume, params.volume_increment_decimals)
                };

                let agg_margin = self.track_margin(
                    book_id,
                    aggressing,
                    OrderDirection::Buy,
                    trade.price,
                );
                let rest_margin = self.track_margin(
                    book_id,
                    resting,
                    OrderDirection::Sell,
                    trade.price,
                );

                let aggressing_volume = round(total_price, params.quote_increment_decimals);
                let resting_volume = round(trade.volume, params.base_increment_decimals);
                {
                    let mut fee_policy =
                        self.fee_policy.write().expect("fee policy lock poisoned");
                    fee_policy.update_history(book_id, resting.agent_id, trade_quote);
                    fee_policy.update_history(book_id, aggressing.agent_id, aggressing_volume);
                }

                let settled_short = accounts
                    .get_mut(aggressing.agent_id)
                    .expect("checked above")
                    .at_mut(book_id)
                    .commit(
                        aggressing.order_id,
                        OrderDirection::Buy,
                        aggressing_volume,
                        resting_volume,
                        fees.taker,
                        best_bid,
                        best_ask,
                        agg_margin,
                        aggressing.settle_flag,
                    );
                let settled_long = accounts
                    .get_mut(resting.agent_id)
                    .expect("checked above")
                    .at_mut(book_id)
                    .commit(
                        resting.order_id,
                        OrderDirection::Sell,
                        resting_volume,
                        aggressing_volume,
                        fees.maker,
                        best_bid,
                        best_ask,
                        rest_margin,
                        resting.settle_flag,
                    );

                self.remove_margin_orders(book_id, OrderDirection::Buy, &settled_long);
                self.remove_margin_orders(book_id, OrderDirection::Sell, &settled_short);
            }
            OrderDirection::Sell => {
                // aggressing SELL spends base; resting BUY spends quote
                let rest_balances = accounts
                    .get(resting.agent_id)
                    .expect("checked above")
                    .at(book_id);
                let rest_leverage =
                    rest_balances.get_leverage(resting.order_id, OrderDirection::Buy);
                let reservation = round(
                    rest_balances.reservation_in_quote(resting.order_id, best_bid)
                        * dec1p(rest_leverage),
                    params.quote_increment_decimals,
                );
                assert!(
                    reservation > Decimal::ZERO,
                    "no reservation for resting BUY order #{}",
                    resting.order_id,
                );

                let resting_volume = if resting.fully_filled_by(trade.volume) {
                    reservation - fees.maker
                } else {
                    round(
                        trade.price * trade.volume,
                        params.quote_increment_decimals,
                    )
                };

                let agg_margin = self.track_margin(
                    book_id,
                    aggressing,
                    OrderDirection::Sell,
                    trade.price,
                );
                let rest_margin = self.track_margin(
                    book_id,
                    resting,
                    OrderDirection::Buy,
                    trade.price,
                );

                let aggressing_volume = round(trade.volume, params.base_increment_decimals);
                {
                    let mut fee_policy =
                        self.fee_policy.write().expect("fee policy lock poisoned");
                    fee_policy.update_history(book_id, resting.agent_id, trade_quote);
                    fee_policy.update_history(book_id, aggressing.agent_id, resting_volume);
                }

                let settled_long = accounts
                    .get_mut(aggressing.agent_id)
                    .expect("checked above")
                    .at_mut(book_id)
                    .commit(
                        aggressing.order_id,
                        OrderDirection::Sell,
                        aggressing_volume,
                        resting_volume,
                        fees.taker,
                        best_bid,
                        best_ask,
                        agg_margin,
                        aggressing.settle_flag,
                    );
                let settled_short = accounts
                    .get_mut(resting.agent_id)
                    .expect("checked above")
                    .at_mut(book_id)
                    .commit(
                        resting.order_id,
                        OrderDirection::Buy,
                        resting_volume,
                        aggressing_volume,
                        fees.maker,
                        best_bid,
                        best_ask,
                        rest_margin,
                        resting.settle_flag,
                    );

                self.remove_margin_orders(book_id, OrderDirection::Sell, &settled_short);
                self.remove_margin_orders(book_id, OrderDirection::Buy, &settled_long);
            }
        }

        fees
    }

    /// Release the reservation behind a cancellation and enforce the
    /// empty-set postcondition.
    ///
    /// # Panics
    /// When the reservation cannot be freed, or reserved funds remain with
    /// no active orders left on the book.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_cancel_order(
        &mut self,
        accounts: &mut AccountRegistry,
        book: &OrderBook,
        agent_id: AgentId,
        order_id: OrderId,
        direction: OrderDirection,
        price: Decimal,
        volume_cancelled: Decimal,
        removed: bool,
    ) {
        let params = *self.validator.params();
        let maker_rate = self
            .fee_policy
            .read()
            .expect("fee policy lock poisoned")
            .get_rates(book.id(), agent_id)
            .maker;

        let account = accounts.get_mut(agent_id).unwrap_or_else(|| {
            panic!("cancellation for unknown agent #{agent_id}");
        });
        let balances = account.at_mut(book.id());
        let leverage = balances.get_leverage(order_id, direction);

        let amount = if removed {
            None
        } else {
            Some(match direction {
                OrderDirection::Buy => round(
                    round(price, params.price_increment_decimals)
                        * round(volume_cancelled, params.volume_increment_decimals)
                        * dec1p(maker_rate)
                        / dec1p(leverage),
                    params.quote_increment_decimals,
                ),
                OrderDirection::Sell => round(
                    round(volume_cancelled, params.volume_increment_decimals) / dec1p(leverage),
                    params.base_increment_decimals,
                ),
            })
        };

        let freed = balances
            .free_reservation(
                order_id,
                price,
                book.best_bid(),
                book.best_ask(),
                direction,
                amount,
            )
            .unwrap_or_else(|e| {
                panic!("failed to free reservation on cancel of order #{order_id}: {e}");
            });

        if removed {
            account.unregister_order(book.id(), order_id);
        }
        debug!(
            agent = agent_id,
            book = book.id(),
            order = order_id,
            cancelled = %volume_cancelled,
            freed_base = %freed.base,
            freed_quote = %freed.quote,
            "cancelled order"
        );

        if account.active_orders(book.id()).is_empty() {
            let balances = account.at(book.id());
            assert!(
                balances.quote.reserved() == Decimal::ZERO,
                "agent #{agent_id}: reserved quote {} with no active orders after cancelling order #{order_id}",
                balances.quote.reserved(),
            );
            assert!(
                balances.base.reserved() == Decimal::ZERO,
                "agent #{agent_id}: reserved base {} with no active orders after cancelling order #{order_id}",
                balances.base.reserved(),
            );
        }
    }

    /// Release whatever a completed order still holds: rounding dust for
    /// unleveraged orders, the whole reservation and loan for leveraged
    /// orders that never filled.
    pub fn finalize_order(
        &self,
        accounts: &mut AccountRegistry,
        book_id: BookId,
        agent_id: AgentId,
        order_id: OrderId,
        direction: OrderDirection,
        had_fills: bool,
    ) {
        let Some(account) = accounts.get_mut(agent_id) else {
            return;
        };
        let balances = account.at_mut(book_id);
        let leverage = balances.get_leverage(order_id, direction);
        if leverage == Decimal::ZERO {
            match direction {
                OrderDirection::Buy => {
                    balances.quote.try_free_reservation(order_id, None);
                }
                OrderDirection::Sell => {
                    balances.base.try_free_reservation(order_id, None);
                }
            }
        } else if !had_fills {
            let _ = balances.free_reservation(
                order_id,
                Decimal::ZERO,
                Decimal::ZERO,
                Decimal::ZERO,
                direction,
                None,
            );
        }
        account.unregister_order(book_id, order_id);
    }

    /// Positions whose margin-call price is crossed by `reference_price`,
    /// drained from the tracking maps in monotone bucket order.
    pub fn check_margin_call(
        &mut self,
        book_id: BookId,
        reference_price: Decimal,
    ) -> Vec<MarginCall> {
        let mut calls = Vec::new();

        if let Some(buckets) = self.margin_buy.get_mut(&book_id) {
            // long positions liquidate once the price falls to p* or below
            let crossed: Vec<Decimal> = buckets
                .range(reference_price..)
                .map(|(price, _)| *price)
                .collect();
            for price in crossed {
                for entry in buckets.remove(&price).expect("key just seen") {
                    warn!(
                        book = book_id,
                        order = entry.order_id,
                        agent = entry.agent_id,
                        call_price = %price,
                        "margin call on long position"
                    );
                    calls.push(MarginCall {
                        book_id,
                        order_id: entry.order_id,
                        agent_id: entry.agent_id,
                        direction: OrderDirection::Buy,
                    });
                }
            }
            if buckets.is_empty() {
                self.margin_buy.remove(&book_id);
            }
        }

        if let Some(buckets) = self.margin_sell.get_mut(&book_id) {
            // short positions liquidate once the price rises to p* or above
            let crossed: Vec<Decimal> = buckets
                .range(..=reference_price)
                .map(|(price, _)| *price)
                .collect();
            for price in crossed {
                for entry in buckets.remove(&price).expect("key just seen") {
                    warn!(
                        book = book_id,
                        order = entry.order_id,
                        agent = entry.agent_id,
                        call_price = %price,
                        "margin call on short position"
                    );
                    calls.push(MarginCall {
                        book_id,
                        order_id: entry.order_id,
                        agent_id: entry.agent_id,
                        direction: OrderDirection::Sell,
                    });
                }
            }
            if buckets.is_empty() {
                self.margin_sell.remove(&book_id);
            }
        }

        calls
    }

    /// Forward the slot-boundary tier update to the shared policy.
    pub fn update_fee_tiers(&self, time: crate::types::Timestamp) {
        self.fee_policy
            .write()
            .expect("fee policy lock poisoned")
            .update_agents_tiers(time);
    }

    /// Compute and record the margin-call price for a leveraged fill side.
    fn track_margin(
        &mut self,
        book_id: BookId,
        side: &crate::book::OrderFillSnapshot,
        direction: OrderDirection,
        trade_price: Decimal,
    ) -> Decimal {
        if side.leverage <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let call_price =
            margin_call_price(trade_price, side.leverage, direction, self.maintenance_margin);
        let map = match direction {
            OrderDirection::Buy => &mut self.margin_buy,
            OrderDirection::Sell => &mut self.margin_sell,
        };
        map.entry(book_id)
            .or_default()
            .entry(call_price)
            .or_default()
            .push(MarginOrderRef {
                order_id: side.order_id,
                agent_id: side.agent_id,
            });
        call_price
    }

    fn remove_margin_orders(
        &mut self,
        book_id: BookId,
        direction: OrderDirection,
        settled: &[(OrderId, Decimal)],
    ) {
        let map = match direction {
            OrderDirection::Buy => &mut self.margin_buy,
            OrderDirection::Sell => &mut self.margin_sell,
        };
        let Some(buckets) = map.get_mut(&book_id) else {
            return;
        };
        for (order_id, call_price) in settled {
            if let Some(entries) = buckets.get_mut(call_price) {
                entries.retain(|entry| entry.order_id != *order_id);
                if entries.is_empty() {
                    buckets.remove(call_price);
                }
            }
        }
        if buckets.is_empty() {
            map.remove(&book_id);
        }
    }
}
