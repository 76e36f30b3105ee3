//! Identifier and timestamp newtypes shared across the crate.

/// Monotonic per-book order identifier, assigned by the book's
/// [`OrderFactory`](crate::book::OrderFactory) counter.
pub type OrderId = u64;

/// Client-chosen order identifier echoed through responses and events.
pub type ClientOrderId = u64;

/// Monotonic per-book trade identifier.
pub type TradeId = u64;

/// Agent identifier. Negative values denote locally simulated agents,
/// non-negative values remote agents; the
/// [`AccountRegistry`](crate::accounting::AccountRegistry) keeps the
/// bidirectional mapping between local string names and negative ids.
pub type AgentId = i32;

/// Dense small identifier of an order book within an exchange.
pub type BookId = u32;

/// Simulated time in arbitrary discrete units, totally ordered.
pub type Timestamp = u64;
