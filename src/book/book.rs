//! Per-instrument price-time-priority matching engine.
//!
//! The book keeps two price-ascending level queues (best bid is the last
//! buy level, best ask the first sell level), each level a FIFO of resting
//! limit orders. Matching walks the opposite side level by level, order by
//! order, emitting one [`TradeEmission`] per fill. Emissions are collected
//! into a [`MatchOutcome`] that the caller drains synchronously, in order —
//! the clearing guarantees depend on that ordering.

use crate::book::level::{LevelSnapshot, TickLevel};
use crate::book::order::{
    Currency, LimitOrder, OrderClientContext, OrderDirection, OrderFactory, OrderHeader,
    SettleFlag, StpFlag, TimeInForce, TradeFactory,
};
use crate::book::trade::{OrderFillSnapshot, StpCancellation, Trade, TradeEmission};
use crate::decimal::{dec1p, round};
use crate::types::{AgentId, BookId, OrderId, Timestamp};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use tracing::trace;

/// Everything the matching loop produced for one incoming order.
#[derive(Debug, Default, Clone)]
pub struct MatchOutcome {
    /// Fills, in emission order.
    pub trades: Vec<TradeEmission>,
    /// Orders cancelled by self-trade prevention during matching.
    pub stp_cancellations: Vec<StpCancellation>,
    /// Leveraged volume left unmatched when the loop stopped.
    pub remaining_total: Decimal,
    /// Whether the residual was rested on the book.
    pub rested: bool,
}

impl MatchOutcome {
    fn empty() -> Self {
        Self::default()
    }
}

/// Result of an explicit cancellation.
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    /// The order as it stood before the cancellation was applied.
    pub order: LimitOrder,
    /// Leveraged volume removed from the book.
    pub volume_cancelled: Decimal,
    /// Whether the order was removed entirely.
    pub removed: bool,
}

/// Arguments for a limit-order placement, already validated and rounded.
#[derive(Debug, Clone)]
pub struct LimitOrderArgs {
    pub direction: OrderDirection,
    pub timestamp: Timestamp,
    pub volume: Decimal,
    pub price: Decimal,
    pub leverage: Decimal,
    pub stp_flag: StpFlag,
    pub settle_flag: SettleFlag,
    pub post_only: bool,
    pub time_in_force: TimeInForce,
    pub expiry_period: Option<Timestamp>,
}

/// Arguments for a market-order placement, already validated and rounded.
#[derive(Debug, Clone)]
pub struct MarketOrderArgs {
    pub direction: OrderDirection,
    pub timestamp: Timestamp,
    pub volume: Decimal,
    pub leverage: Decimal,
    pub stp_flag: StpFlag,
    pub settle_flag: SettleFlag,
}

/// Best bid/ask view consumed by `RETRIEVE_L1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct L1Snapshot {
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub bid_volume: Decimal,
    pub ask_volume: Decimal,
}

/// A single-instrument limit order book.
pub struct OrderBook {
    book_id: BookId,
    /// Buy levels in ascending price order; best bid is the last element.
    buy_queue: Vec<TickLevel>,
    /// Sell levels in ascending price order; best ask is the first element.
    sell_queue: Vec<TickLevel>,
    order_factory: OrderFactory,
    trade_factory: TradeFactory,
    /// Owner lookup for every order this book has ever created, used by the
    /// validator's STP walk and by clearing.
    contexts: DashMap<OrderId, OrderClientContext>,
    /// Location of currently resting orders.
    locations: HashMap<OrderId, (Decimal, OrderDirection)>,
    volume_decimals: u32,
}

impl OrderBook {
    #[must_use]
    pub fn new(book_id: BookId, volume_decimals: u32) -> Self {
        Self {
            book_id,
            buy_queue: Vec::new(),
            sell_queue: Vec::new(),
            order_factory: OrderFactory::default(),
            trade_factory: TradeFactory::default(),
            contexts: DashMap::new(),
            locations: HashMap::new(),
            volume_decimals,
        }
    }

    #[must_use]
    #[inline]
    pub fn id(&self) -> BookId {
        self.book_id
    }

    /// Best bid price, or zero when the buy side is empty.
    #[must_use]
    pub fn best_bid(&self) -> Decimal {
        self.buy_queue.last().map_or(Decimal::ZERO, TickLevel::price)
    }

    /// Best ask price, or zero when the sell side is empty.
    #[must_use]
    pub fn best_ask(&self) -> Decimal {
        self.sell_queue.first().map_or(Decimal::ZERO, TickLevel::price)
    }

    #[must_use]
    pub fn buy_levels(&self) -> &[TickLevel] {
        &self.buy_queue
    }

    #[must_use]
    pub fn sell_levels(&self) -> &[TickLevel] {
        &self.sell_queue
    }

    #[must_use]
    pub fn order_factory(&self) -> &OrderFactory {
        &self.order_factory
    }

    /// Owner context recorded when the order was created.
    #[must_use]
    pub fn client_context(&self, order_id: OrderId) -> Option<OrderClientContext> {
        self.contexts.get(&order_id).map(|c| *c.value())
    }

    /// A currently resting order, if the id is on the book.
    #[must_use]
    pub fn order(&self, order_id: OrderId) -> Option<LimitOrder> {
        let (price, direction) = *self.locations.get(&order_id)?;
        let queue = self.queue(direction);
        let idx = queue.partition_point(|l| l.price() < price);
        queue
            .get(idx)
            .and_then(|level| level.orders().find(|o| o.header.id == order_id))
            .cloned()
    }

    /// Whether the id is resting on the book.
    #[must_use]
    pub fn contains(&self, order_id: OrderId) -> bool {
        self.locations.contains_key(&order_id)
    }

    /// Ids of every resting order owned by the given agent.
    #[must_use]
    pub fn resting_order_ids_of(&self, agent_id: AgentId) -> Vec<OrderId> {
        self.locations
            .keys()
            .filter(|id| {
                self.contexts
                    .get(id)
                    .is_some_and(|c| c.agent_id == agent_id)
            })
            .copied()
            .collect()
    }

    #[must_use]
    pub fn l1_snapshot(&self) -> L1Snapshot {
        L1Snapshot {
            best_bid: self.best_bid(),
            best_ask: self.best_ask(),
            bid_volume: self.buy_queue.last().map_or(Decimal::ZERO, TickLevel::volume),
            ask_volume: self.sell_queue.first().map_or(Decimal::ZERO, TickLevel::volume),
        }
    }

    /// Bid levels, best first, up to `depth` levels (all when zero).
    #[must_use]
    pub fn bid_levels(&self, depth: usize) -> Vec<LevelSnapshot> {
        let it = self.buy_queue.iter().rev().map(TickLevel::snapshot);
        if depth == 0 { it.collect() } else { it.take(depth).collect() }
    }

    /// Ask levels, best first, up to `depth` levels (all when zero).
    #[must_use]
    pub fn ask_levels(&self, depth: usize) -> Vec<LevelSnapshot> {
        let it = self.sell_queue.iter().map(TickLevel::snapshot);
        if depth == 0 { it.collect() } else { it.take(depth).collect() }
    }

    /// Place a limit order. Crossing volume executes immediately as a
    /// marketable limit bounded by `price`; the residual rests for GTC/GTT
    /// and is dropped otherwise (the validator has already tightened IOC
    /// volumes and rejected violating FOK/post-only requests).
    pub fn place_limit_order(
        &mut self,
        args: LimitOrderArgs,
        ctx: OrderClientContext,
    ) -> (LimitOrder, MatchOutcome) {
        let id = self.order_factory.next_id();
        let order = LimitOrder {
            header: OrderHeader {
                id,
                timestamp: args.timestamp,
                volume: args.volume,
                leverage: args.leverage,
                direction: args.direction,
                stp_flag: args.stp_flag,
                settle_flag: args.settle_flag,
                currency: Currency::Base,
            },
            price: args.price,
            post_only: args.post_only,
            time_in_force: args.time_in_force,
            expiry_period: args.expiry_period,
        };
        self.contexts.insert(id, ctx);
        trace!(
            book = self.book_id,
            order = id,
            price = %args.price,
            volume = %args.volume,
            direction = %args.direction,
            "limit order placed"
        );

        let mut outcome = self.match_incoming(
            id,
            ctx.agent_id,
            args.direction,
            Some(args.price),
            order.total_volume(),
            args.leverage,
            args.stp_flag,
            args.settle_flag,
            args.timestamp,
        );

        if outcome.remaining_total > Decimal::ZERO
            && matches!(args.time_in_force, TimeInForce::Gtc | TimeInForce::Gtt)
        {
            let mut resting = order.clone();
            resting.header.volume = round(
                outcome.remaining_total / dec1p(args.leverage),
                self.volume_decimals,
            );
            self.rest_order(resting);
            outcome.rested = true;
        }

        (order, outcome)
    }

    /// Place a market order: walk the opposite side until the volume is
    /// exhausted or the side empties. The residual never rests.
    pub fn place_market_order(
        &mut self,
        args: MarketOrderArgs,
        ctx: OrderClientContext,
    ) -> (crate::book::order::MarketOrder, MatchOutcome) {
        let id = self.order_factory.next_id();
        let order = crate::book::order::MarketOrder {
            header: OrderHeader {
                id,
                timestamp: args.timestamp,
                volume: args.volume,
                leverage: args.leverage,
                direction: args.direction,
                stp_flag: args.stp_flag,
                settle_flag: args.settle_flag,
                currency: Currency::Base,
            },
        };
        self.contexts.insert(id, ctx);
        trace!(
            book = self.book_id,
            order = id,
            volume = %args.volume,
            direction = %args.direction,
            "market order placed"
        );

        let outcome = self.match_incoming(
            id,
            ctx.agent_id,
            args.direction,
            None,
            order.header.total_volume(),
            args.leverage,
            args.stp_flag,
            args.settle_flag,
            args.timestamp,
        );
        (order, outcome)
    }

    /// Cancel `amount` leveraged units of a resting order, or all of it when
    /// `amount` is omitted or covers the residual. Unknown ids are a no-op
    /// returning `None`.
    pub fn cancel_order(
        &mut self,
        order_id: OrderId,
        amount: Option<Decimal>,
    ) -> Option<CancelOutcome> {
        let (price, direction) = *self.locations.get(&order_id)?;
        let volume_decimals = self.volume_decimals;
        let idx = {
            let queue = self.queue(direction);
            queue.partition_point(|l| l.price() < price)
        };
        let queue = self.queue_mut(direction);
        let level = queue.get_mut(idx)?;
        let order = level.orders().find(|o| o.header.id == order_id).cloned()?;
        let total = order.total_volume();

        let outcome = match amount {
            Some(a) if a < total => {
                level.reduce(order_id, a, volume_decimals);
                CancelOutcome {
                    order,
                    volume_cancelled: a,
                    removed: false,
                }
            }
            _ => {
                level.remove(order_id);
                if level.is_empty() {
                    queue.remove(idx);
                }
                self.locations.remove(&order_id);
                CancelOutcome {
                    order,
                    volume_cancelled: total,
                    removed: true,
                }
            }
        };
        trace!(
            book = self.book_id,
            order = order_id,
            cancelled = %outcome.volume_cancelled,
            removed = outcome.removed,
            "order cancelled"
        );
        Some(outcome)
    }

    fn queue(&self, direction: OrderDirection) -> &Vec<TickLevel> {
        match direction {
            OrderDirection::Buy => &self.buy_queue,
            OrderDirection::Sell => &self.sell_queue,
        }
    }

    fn queue_mut(&mut self, direction: OrderDirection) -> &mut Vec<TickLevel> {
        match direction {
            OrderDirection::Buy => &mut self.buy_queue,
            OrderDirection::Sell => &mut self.sell_queue,
        }
    }

    fn rest_order(&mut self, order: LimitOrder) {
        let id = order.header.id;
        let price = order.price;
        let direction = order.header.direction;
        let queue = self.queue_mut(direction);
        let idx = queue.partition_point(|l| l.price() < price);
        if idx < queue.len() && queue[idx].price() == price {
            queue[idx].push_back(order);
        } else {
            let mut level = TickLevel::new(price);
            level.push_back(order);
            queue.insert(idx, level);
        }
        self.locations.insert(id, (price, direction));
    }

    /// Price of the best opposite level for an incoming order.
    fn opposite_best_price(&self, incoming: OrderDirection) -> Option<Decimal> {
        match incoming {
            OrderDirection::Buy => self.sell_queue.first().map(TickLevel::price),
            OrderDirection::Sell => self.buy_queue.last().map(TickLevel::price),
        }
    }

    fn opposite_front_level_mut(&mut self, incoming: OrderDirection) -> Option<&mut TickLevel> {
        match incoming {
            OrderDirection::Buy => self.sell_queue.first_mut(),
            OrderDirection::Sell => self.buy_queue.last_mut(),
        }
    }

    /// Remove the front order of the best opposite level, dropping the level
    /// when it empties.
    fn remove_resting_front(&mut self, incoming: OrderDirection) -> LimitOrder {
        let order = match incoming {
            OrderDirection::Buy => {
                let level = self.sell_queue.first_mut().expect("non-empty side");
                let order = level.pop_front().expect("non-empty level");
                if level.is_empty() {
                    self.sell_queue.remove(0);
                }
                order
            }
            OrderDirection::Sell => {
                let idx = self.buy_queue.len() - 1;
                let order = self.buy_queue[idx].pop_front().expect("non-empty level");
                if self.buy_queue[idx].is_empty() {
                    self.buy_queue.pop();
                }
                order
            }
        };
        self.locations.remove(&order.header.id);
        order
    }

    #[allow(clippy::too_many_arguments)]
    fn match_incoming(
        &mut self,
        incoming_id: OrderId,
        incoming_agent: AgentId,
        direction: OrderDirection,
        limit_price: Option<Decimal>,
        total_volume: Decimal,
        incoming_leverage: Decimal,
        stp: StpFlag,
        incoming_settle_flag: SettleFlag,
        timestamp: Timestamp,
    ) -> MatchOutcome {
        let mut outcome = MatchOutcome::empty();
        let mut remaining = total_volume;
        let volume_decimals = self.volume_decimals;

        'matching: while remaining > Decimal::ZERO {
            let Some(level_price) = self.opposite_best_price(direction) else {
                break;
            };
            if let Some(limit) = limit_price {
                match direction {
                    OrderDirection::Buy if level_price > limit => break,
                    OrderDirection::Sell if level_price < limit => break,
                    _ => {}
                }
            }

            let (resting_id, resting_total, resting_leverage, resting_direction, resting_settle) = {
                let level = match direction {
                    OrderDirection::Buy => self.sell_queue.first(),
                    OrderDirection::Sell => self.buy_queue.last(),
                }
                .expect("non-empty side");
                let front = level.front().expect("levels are never left empty");
                (
                    front.header.id,
                    front.total_volume(),
                    front.header.leverage,
                    front.header.direction,
                    front.header.settle_flag,
                )
            };
            let resting_agent = self
                .contexts
                .get(&resting_id)
                .map(|c| c.agent_id)
                .expect("resting order has a client context");

            if resting_agent == incoming_agent && stp != StpFlag::None {
                match stp {
                    StpFlag::CancelResting => {
                        self.remove_resting_front(direction);
                        outcome.stp_cancellations.push(StpCancellation {
                            order_id: resting_id,
                            agent_id: resting_agent,
                            direction: resting_direction,
                            volume_cancelled: resting_total,
                            price: Some(level_price),
                            removed: true,
                        });
                        continue 'matching;
                    }
                    StpFlag::CancelAggressing => {
                        outcome.stp_cancellations.push(StpCancellation {
                            order_id: incoming_id,
                            agent_id: incoming_agent,
                            direction,
                            volume_cancelled: remaining,
                            price: None,
                            removed: true,
                        });
                        remaining = Decimal::ZERO;
                        break 'matching;
                    }
                    StpFlag::CancelBoth => {
                        self.remove_resting_front(direction);
                        outcome.stp_cancellations.push(StpCancellation {
                            order_id: resting_id,
                            agent_id: resting_agent,
                            direction: resting_direction,
                            volume_cancelled: resting_total,
                            price: Some(level_price),
                            removed: true,
                        });
                        outcome.stp_cancellations.push(StpCancellation {
                            order_id: incoming_id,
                            agent_id: incoming_agent,
                            direction,
                            volume_cancelled: remaining,
                            price: None,
                            removed: true,
                        });
                        remaining = Decimal::ZERO;
                        break 'matching;
                    }
                    StpFlag::DecrementCancel => {
                        let decrement = remaining.min(resting_total);
                        let resting_removed = decrement == resting_total;
                        if resting_removed {
                            self.remove_resting_front(direction);
                        } else {
                            let level = self
                                .opposite_front_level_mut(direction)
                                .expect("non-empty side");
                            level.reduce(resting_id, decrement, volume_decimals);
                        }
                        outcome.stp_cancellations.push(StpCancellation {
                            order_id: resting_id,
                            agent_id: resting_agent,
                            direction: resting_direction,
                            volume_cancelled: decrement,
                            price: Some(level_price),
                            removed: resting_removed,
                        });
                        outcome.stp_cancellations.push(StpCancellation {
                            order_id: incoming_id,
                            agent_id: incoming_agent,
                            direction,
                            volume_cancelled: decrement,
                            price: None,
                            removed: decrement == remaining,
                        });
                        remaining -= decrement;
                        continue 'matching;
                    }
                    StpFlag::None => unreachable!("checked above"),
                }
            }

            let fill = remaining.min(resting_total);
            let trade = Trade {
                id: self.trade_factory.next_id(),
                timestamp,
                direction,
                aggressing_order_id: incoming_id,
                resting_order_id: resting_id,
                volume: fill,
                price: level_price,
            };
            trace!(
                book = self.book_id,
                trade = trade.id,
                volume = %fill,
                price = %level_price,
                "trade"
            );
            if fill == resting_total {
                self.remove_resting_front(direction);
            } else {
                let level = self
                    .opposite_front_level_mut(direction)
                    .expect("non-empty side");
                level.reduce(resting_id, fill, volume_decimals);
            }
            outcome.trades.push(TradeEmission {
                trade,
                aggressing: OrderFillSnapshot {
                    order_id: incoming_id,
                    agent_id: incoming_agent,
                    direction,
                    leverage: incoming_leverage,
                    total_volume_before: remaining,
                    price: limit_price,
                    settle_flag: incoming_settle_flag,
                },
                resting: OrderFillSnapshot {
                    order_id: resting_id,
                    agent_id: resting_agent,
                    direction: direction.opposite(),
                    leverage: resting_leverage,
                    total_volume_before: resting_total,
                    price: Some(level_price),
                    settle_flag: resting_settle,
                },
                best_bid: self.best_bid(),
                best_ask: self.best_ask(),
            });
            remaining -= fill;
        }

        outcome.remaining_total = remaining;
        outcome
    }
}
