//! Exchange-level concerns: validation, clearing, fees, configuration and
//! the multi-book front door.

mod clearing;
mod config;
mod events;
pub(crate) mod exchange;
pub(crate) mod fees;
mod messages;
pub(crate) mod validator;

pub use clearing::{ClearingManager, MarginCall, MarginOrderRef, OrderDesc};
pub use config::{ConfigError, ExchangeConfig, FeePolicyConfig, TierConfig};
pub use events::{CancellationEvent, L3Event, L3Record, OrderEvent, TradeEvent};
pub use exchange::{FeeStateSnapshot, MultiBookExchange};
pub use fees::{FeePolicy, FeePolicyError, FeePolicyWrapper, Fees, SharedFeePolicy, Tier};
pub use messages::{
    CancellationItem, ClosePositionItem, ErrorResponse, ExchangeEvent, ExchangeRequest,
    ExchangeResponse, Notification, PlaceOrderLimitPayload, PlaceOrderMarketPayload,
    RequestOutcome,
};
pub use validator::{OrderErrorCode, OrderPlacementValidator, Validation, ValidatorParams};
