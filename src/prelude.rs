//! Convenience re-exports for the common use case: build an exchange,
//! register agents, drive requests.
//!
//! ```
//! use exchange_sim::prelude::*;
//! ```

pub use crate::accounting::{
    Account, AccountRegistry, AccountTemplate, Balance, Balances, Collateral, Loan, RoundParams,
};
pub use crate::book::{
    Currency, LimitOrder, MarketOrder, Order, OrderBook, OrderDirection, SettleFlag, StpFlag,
    TimeInForce, Trade, TradeContext, TradeListener,
};
pub use crate::decimal::{dec1m, dec1p, fma, round};
pub use crate::exchange::{
    CancellationItem, ClosePositionItem, ErrorResponse, ExchangeConfig, ExchangeEvent,
    ExchangeRequest, ExchangeResponse, FeePolicy, FeePolicyConfig, FeePolicyWrapper, Fees,
    MultiBookExchange, Notification, OrderErrorCode, PlaceOrderLimitPayload,
    PlaceOrderMarketPayload, RequestOutcome, TierConfig,
};
pub use crate::types::{AgentId, BookId, ClientOrderId, OrderId, Timestamp, TradeId};
