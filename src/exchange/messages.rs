//! Request and response payloads of the exchange front door.
//!
//! Every request produces exactly one response — a success payload or a
//! typed error echoing the request — plus zero or more event notifications
//! to subscribed agents.

use crate::book::{
    Currency, L1Snapshot, LevelSnapshot, LimitOrder, OrderDirection, SettleFlag, StpFlag,
    TimeInForce, Trade, TradeContext,
};
use crate::exchange::validator::OrderErrorCode;
use crate::types::{AgentId, BookId, ClientOrderId, OrderId, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

fn default_leverage() -> Decimal {
    Decimal::ZERO
}

/// `PLACE_ORDER_MARKET` request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceOrderMarketPayload {
    pub direction: OrderDirection,
    pub volume: Decimal,
    #[serde(default = "default_leverage")]
    pub leverage: Decimal,
    pub book_id: BookId,
    #[serde(default)]
    pub currency: Currency,
    #[serde(default)]
    pub client_order_id: Option<ClientOrderId>,
    #[serde(default)]
    pub stp_flag: StpFlag,
    #[serde(default)]
    pub settle_flag: SettleFlag,
}

/// `PLACE_ORDER_LIMIT` request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceOrderLimitPayload {
    pub direction: OrderDirection,
    pub volume: Decimal,
    pub price: Decimal,
    #[serde(default = "default_leverage")]
    pub leverage: Decimal,
    pub book_id: BookId,
    #[serde(default)]
    pub currency: Currency,
    #[serde(default)]
    pub client_order_id: Option<ClientOrderId>,
    #[serde(default)]
    pub post_only: bool,
    #[serde(default)]
    pub time_in_force: TimeInForce,
    #[serde(default)]
    pub expiry_period: Option<Timestamp>,
    #[serde(default)]
    pub stp_flag: StpFlag,
    #[serde(default)]
    pub settle_flag: SettleFlag,
}

/// One order of a `CANCEL_ORDERS` request; an omitted volume cancels the
/// whole residual.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CancellationItem {
    pub order_id: OrderId,
    #[serde(default)]
    pub volume: Option<Decimal>,
}

/// One position of a `CLOSE_POSITIONS` request; an omitted volume closes
/// the whole outstanding loan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClosePositionItem {
    pub order_id: OrderId,
    #[serde(default)]
    pub volume: Option<Decimal>,
}

/// A request message consumed by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExchangeRequest {
    PlaceOrderMarket(PlaceOrderMarketPayload),
    PlaceOrderLimit(PlaceOrderLimitPayload),
    CancelOrders {
        book_id: BookId,
        cancellations: Vec<CancellationItem>,
    },
    ClosePositions {
        book_id: BookId,
        positions: Vec<ClosePositionItem>,
    },
    RetrieveL1 {
        book_id: BookId,
    },
    RetrieveBook {
        book_id: BookId,
        depth: usize,
    },
    RetrieveOrders {
        book_id: BookId,
        order_ids: Vec<OrderId>,
    },
    ResetAgent {
        agent_ids: Vec<AgentId>,
    },
    SubscribeEventOrderMarket,
    SubscribeEventOrderLimit,
    SubscribeEventTrade,
    SubscribeEventTradeByOrder {
        book_id: BookId,
        order_id: OrderId,
    },
}

/// Success payload of a handled request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExchangeResponse {
    ResponsePlaceOrderMarket {
        book_id: BookId,
        order_id: OrderId,
        client_order_id: Option<ClientOrderId>,
    },
    ResponsePlaceOrderLimit {
        book_id: BookId,
        order_id: OrderId,
        client_order_id: Option<ClientOrderId>,
        /// Scheduled expiry for GTT orders; the caller's event queue turns
        /// it into a cancel message.
        expiry_time: Option<Timestamp>,
    },
    ResponseCancelOrders {
        book_id: BookId,
        cancelled: Vec<OrderId>,
    },
    ResponseClosePositions {
        book_id: BookId,
        closed: Vec<OrderId>,
    },
    ResponseRetrieveL1 {
        book_id: BookId,
        #[serde(flatten)]
        snapshot: L1Snapshot,
    },
    ResponseRetrieveBook {
        book_id: BookId,
        bids: Vec<LevelSnapshot>,
        asks: Vec<LevelSnapshot>,
    },
    ResponseRetrieveOrders {
        book_id: BookId,
        orders: Vec<LimitOrder>,
    },
    ResponseResetAgent {
        agent_ids: Vec<AgentId>,
    },
    ResponseSubscribe,
}

/// Typed failure payload of a handled request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorResponse {
    pub code: OrderErrorCode,
    pub message: String,
}

impl ErrorResponse {
    #[must_use]
    pub fn new(code: OrderErrorCode) -> Self {
        Self {
            message: code.to_string(),
            code,
        }
    }

    #[must_use]
    pub fn with_message(code: OrderErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// An event pushed to subscribed agents.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExchangeEvent {
    EventTrade {
        book_id: BookId,
        trade: Trade,
        context: TradeContext,
        client_order_id: Option<ClientOrderId>,
    },
    EventOrderMarket {
        book_id: BookId,
        order_id: OrderId,
        agent_id: AgentId,
        direction: OrderDirection,
        volume: Decimal,
    },
    EventOrderLimit {
        book_id: BookId,
        order_id: OrderId,
        agent_id: AgentId,
        direction: OrderDirection,
        volume: Decimal,
        price: Decimal,
    },
}

/// An event addressed to one subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub recipient: AgentId,
    pub event: ExchangeEvent,
}

/// The full outcome of one handled request: the request echo, exactly one
/// response or error, and the notifications to dispatch.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub request: ExchangeRequest,
    pub response: Result<ExchangeResponse, ErrorResponse>,
    pub notifications: Vec<Notification>,
}
