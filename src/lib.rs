//! # Multi-Book Exchange Simulation Core
//!
//! A discrete-event simulator core for a multi-book limit-order exchange
//! with margin trading. The crate provides the matching, clearing and
//! accounting machinery of the exchange; schedulers, trader agents and
//! persistence sinks are external collaborators that talk to it through
//! request/response messages.
//!
//! ## Key Features
//!
//! - **Price-time-priority matching**: per-instrument books with two
//!   price-ordered level queues, each level a FIFO of resting limit orders.
//!   Market and limit placements, partial and full cancellations, IOC/FOK/
//!   GTT time-in-force semantics and post-only admission.
//!
//! - **Margin accounts**: per-(agent, book) ledgers enforcing
//!   `free + reserved = total` on every mutation, with loan and collateral
//!   bookkeeping for leveraged positions, closed-form margin-call prices and
//!   force-closing on reference-price moves.
//!
//! - **Self-trade prevention**: per-order STP flags resolving collisions
//!   between an incoming order and same-owner resting orders by cancelling
//!   the resting side, the incoming side, both, or decrementing both without
//!   a print.
//!
//! - **Tiered fees**: rolling per-agent trade-volume history discretised
//!   into maker/taker tiers, with per-agent-class overrides behind a
//!   reader-writer lock shared across parallel simulation instances.
//!
//! - **Authoritative event log**: an append-only per-book L3 record of
//!   placements, trades and cancellations, plus subscription registries for
//!   order and trade events.
//!
//! ## Design Notes
//!
//! All monetary arithmetic uses fixed-precision decimals
//! ([`rust_decimal::Decimal`]); rounding is explicit at every monetary
//! boundary. Within one simulation instance the core is single-threaded and
//! cooperative: matching, validation and balance mutation for a book happen
//! sequentially inside one message handler, and trade clearing runs
//! synchronously in emission order. Recoverable failures are typed errors;
//! breaches of the accounting invariants are bugs and abort the simulation.

pub mod accounting;
pub mod book;
pub mod decimal;
pub mod exchange;
pub mod prelude;
pub mod types;

pub use accounting::{
    Account, AccountRegistry, Balance, Balances, Collateral, FreeError, FreeStatus, Loan,
};
pub use book::{
    LimitOrder, MarketOrder, Order, OrderBook, OrderDirection, SettleFlag, StpFlag, TimeInForce,
    Trade, TradeListener,
};
pub use exchange::{
    ClearingManager, ExchangeConfig, ExchangeRequest, ExchangeResponse, FeePolicy,
    FeePolicyWrapper, Fees, MultiBookExchange, OrderErrorCode, OrderPlacementValidator,
};
pub use types::{AgentId, BookId, OrderId, Timestamp, TradeId};
