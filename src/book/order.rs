//! Order value types, direction and flag enums, and the per-book id factory.

use crate::decimal::dec1p;
use crate::types::{AgentId, BookId, ClientOrderId, OrderId, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Side of an order or trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderDirection {
    Buy,
    Sell,
}

impl OrderDirection {
    /// The opposite side.
    #[must_use]
    #[inline]
    pub fn opposite(self) -> Self {
        match self {
            OrderDirection::Buy => OrderDirection::Sell,
            OrderDirection::Sell => OrderDirection::Buy,
        }
    }
}

impl fmt::Display for OrderDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderDirection::Buy => write!(f, "BUY"),
            OrderDirection::Sell => write!(f, "SELL"),
        }
    }
}

/// Currency in which a request expresses its volume. Quote-denominated
/// requests are converted to base volume at the touch before validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Currency {
    #[default]
    Base,
    Quote,
}

/// Self-trade-prevention mode carried by an incoming order, determining how
/// collisions with same-owner resting orders are resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StpFlag {
    /// No special handling; self-trades are allowed.
    #[default]
    #[serde(rename = "NONE")]
    None,
    /// Cancel the resting (oldest) order and keep matching against others.
    #[serde(rename = "CO")]
    CancelResting,
    /// Reject the incoming (newest) order on collision.
    #[serde(rename = "CN")]
    CancelAggressing,
    /// Cancel both the touched resting order and the incoming remainder.
    #[serde(rename = "CB")]
    CancelBoth,
    /// Decrement both sides by the smaller residual, cancelling whichever
    /// reaches zero. No trade is printed for the decremented volume.
    #[serde(rename = "DC")]
    DecrementCancel,
}

impl fmt::Display for StpFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StpFlag::None => "NONE",
            StpFlag::CancelResting => "CO",
            StpFlag::CancelAggressing => "CN",
            StpFlag::CancelBoth => "CB",
            StpFlag::DecrementCancel => "DC",
        };
        write!(f, "{s}")
    }
}

/// Time-in-force policy of a limit order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeInForce {
    /// Good till cancelled.
    #[default]
    Gtc,
    /// Good till time; expiry is scheduled by the caller's event queue.
    Gtt,
    /// Immediate or cancel; the unfilled residual never reaches the book.
    Ioc,
    /// Fill or kill; rejected unless the full volume is matchable atomically.
    Fok,
}

impl fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Gtt => "GTT",
            TimeInForce::Ioc => "IOC",
            TimeInForce::Fok => "FOK",
        };
        write!(f, "{s}")
    }
}

/// Which open loan a position-closing fill settles against.
///
/// Both variants are part of the public protocol even though FIFO is the
/// documented default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettleFlag {
    /// Settle the oldest opposite-direction loan first.
    #[default]
    Fifo,
    /// Settle the loan opened by this specific order.
    Order(OrderId),
}

/// Attributes shared by market and limit orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderHeader {
    pub id: OrderId,
    pub timestamp: Timestamp,
    /// Unleveraged volume in base units. The book matches
    /// `total_volume = volume * (1 + leverage)`.
    pub volume: Decimal,
    pub leverage: Decimal,
    pub direction: OrderDirection,
    pub stp_flag: StpFlag,
    pub settle_flag: SettleFlag,
    pub currency: Currency,
}

impl OrderHeader {
    /// The leveraged volume this order trades, `volume * (1 + leverage)`.
    #[must_use]
    #[inline]
    pub fn total_volume(&self) -> Decimal {
        self.volume * dec1p(self.leverage)
    }
}

/// A market order: walks the opposite side, never rests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketOrder {
    #[serde(flatten)]
    pub header: OrderHeader,
}

/// A limit order: matches while crossing, rests at its price otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitOrder {
    #[serde(flatten)]
    pub header: OrderHeader,
    pub price: Decimal,
    pub post_only: bool,
    pub time_in_force: TimeInForce,
    pub expiry_period: Option<Timestamp>,
}

impl LimitOrder {
    /// Remaining leveraged volume of the resting order.
    #[must_use]
    #[inline]
    pub fn total_volume(&self) -> Decimal {
        self.header.total_volume()
    }
}

/// Tagged order variant over the common header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Order {
    Market(MarketOrder),
    Limit(LimitOrder),
}

impl Order {
    /// The shared header of either variant.
    #[must_use]
    pub fn header(&self) -> &OrderHeader {
        match self {
            Order::Market(o) => &o.header,
            Order::Limit(o) => &o.header,
        }
    }

    /// The limit price, if this is a limit order.
    #[must_use]
    pub fn price(&self) -> Option<Decimal> {
        match self {
            Order::Market(_) => None,
            Order::Limit(o) => Some(o.price),
        }
    }
}

/// Owner information the book keeps per order id, used during clearing and
/// for self-trade-prevention checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderClientContext {
    pub agent_id: AgentId,
    pub client_order_id: Option<ClientOrderId>,
}

impl OrderClientContext {
    #[must_use]
    pub fn new(agent_id: AgentId, client_order_id: Option<ClientOrderId>) -> Self {
        Self {
            agent_id,
            client_order_id,
        }
    }
}

/// Full routing context of an order within the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderContext {
    pub agent_id: AgentId,
    pub book_id: BookId,
    pub client_order_id: Option<ClientOrderId>,
}

impl OrderContext {
    #[must_use]
    pub fn new(agent_id: AgentId, book_id: BookId, client_order_id: Option<ClientOrderId>) -> Self {
        Self {
            agent_id,
            book_id,
            client_order_id,
        }
    }
}

/// Monotonic id counter owned by a single book. There is no process-wide
/// counter; each factory is bound to its book.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct OrderFactory {
    counter: OrderId,
}

impl OrderFactory {
    /// The id the next created order will receive, without consuming it.
    ///
    /// The clearing manager pre-allocates reservations against this value;
    /// the book then assigns the same id on creation.
    #[must_use]
    #[inline]
    pub fn counter_state(&self) -> OrderId {
        self.counter
    }

    /// Take the next id.
    #[inline]
    pub fn next_id(&mut self) -> OrderId {
        let id = self.counter;
        self.counter += 1;
        id
    }
}

/// Monotonic trade id counter owned by a single book.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TradeFactory {
    counter: crate::types::TradeId,
}

impl TradeFactory {
    #[inline]
    pub fn next_id(&mut self) -> crate::types::TradeId {
        let id = self.counter;
        self.counter += 1;
        id
    }
}
