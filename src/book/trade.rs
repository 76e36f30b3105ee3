//! Trade records and the emissions produced by the matching loop.

use crate::book::order::{OrderDirection, SettleFlag};
use crate::exchange::fees::Fees;
use crate::types::{AgentId, BookId, OrderId, Timestamp, TradeId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A single execution between an aggressing and a resting order.
///
/// The direction equals that of the aggressing order; the record is immutable
/// once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub timestamp: Timestamp,
    pub direction: OrderDirection,
    pub aggressing_order_id: OrderId,
    pub resting_order_id: OrderId,
    /// Leveraged volume exchanged, in base units.
    pub volume: Decimal,
    /// Execution price, always the resting order's price.
    pub price: Decimal,
}

/// Clearing context attached to a trade event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradeContext {
    pub book_id: BookId,
    pub aggressing_agent_id: AgentId,
    pub resting_agent_id: AgentId,
    pub fees: Fees,
}

/// State of one side of a trade at the instant the fill was produced,
/// captured by the matching loop for the clearing manager.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderFillSnapshot {
    pub order_id: OrderId,
    pub agent_id: AgentId,
    pub direction: OrderDirection,
    pub leverage: Decimal,
    /// Remaining leveraged volume including the fill being reported.
    pub total_volume_before: Decimal,
    /// Limit price; `None` for a market aggressor.
    pub price: Option<Decimal>,
    pub settle_flag: SettleFlag,
}

impl OrderFillSnapshot {
    /// Whether the reported fill consumes the order entirely.
    #[must_use]
    #[inline]
    pub fn fully_filled_by(&self, trade_volume: Decimal) -> bool {
        self.total_volume_before == trade_volume
    }
}

/// One trade as produced by the matching loop, stamped with the book state
/// observed at emission. Processed synchronously, in order, by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeEmission {
    pub trade: Trade,
    pub aggressing: OrderFillSnapshot,
    pub resting: OrderFillSnapshot,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
}

/// A resting or incoming order cancelled by the matching loop itself
/// (self-trade prevention) rather than by an explicit request.
#[derive(Debug, Clone, PartialEq)]
pub struct StpCancellation {
    pub order_id: OrderId,
    pub agent_id: AgentId,
    pub direction: OrderDirection,
    /// Leveraged volume removed from the book.
    pub volume_cancelled: Decimal,
    /// Price the order rested at; `None` when the incoming side is cut.
    pub price: Option<Decimal>,
    /// Whether the order was removed entirely.
    pub removed: bool,
}

/// Listener invoked for every trade cleared by the exchange.
pub type TradeListener = Arc<dyn Fn(&Trade, &TradeContext) + Send + Sync>;
