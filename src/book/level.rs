//! A single price level: FIFO queue of resting limit orders with a cached
//! aggregate volume.

use crate::book::order::LimitOrder;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::VecDeque;

/// The set of resting orders at one price, in time priority.
///
/// The cached `volume` always equals the sum of the resting orders'
/// leveraged volumes; mutation goes through the methods below to keep it so.
#[derive(Debug, Clone, Default)]
pub struct TickLevel {
    price: Decimal,
    orders: VecDeque<LimitOrder>,
    volume: Decimal,
}

/// Serializable view of a level for depth retrieval and the persisted book
/// layout.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LevelSnapshot {
    pub price: Decimal,
    pub volume: Decimal,
    pub order_count: usize,
}

impl TickLevel {
    #[must_use]
    pub fn new(price: Decimal) -> Self {
        Self {
            price,
            orders: VecDeque::new(),
            volume: Decimal::ZERO,
        }
    }

    #[must_use]
    #[inline]
    pub fn price(&self) -> Decimal {
        self.price
    }

    /// Cached sum of the resting orders' leveraged volumes.
    #[must_use]
    #[inline]
    pub fn volume(&self) -> Decimal {
        self.volume
    }

    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    #[must_use]
    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    pub fn orders(&self) -> impl Iterator<Item = &LimitOrder> {
        self.orders.iter()
    }

    #[must_use]
    pub fn front(&self) -> Option<&LimitOrder> {
        self.orders.front()
    }

    /// Append an order at the back of the time-priority queue.
    pub fn push_back(&mut self, order: LimitOrder) {
        self.volume += order.total_volume();
        self.orders.push_back(order);
    }

    /// Remove and return the order at the front of the queue.
    pub fn pop_front(&mut self) -> Option<LimitOrder> {
        let order = self.orders.pop_front()?;
        self.volume -= order.total_volume();
        Some(order)
    }

    /// Reduce the front order's leveraged volume by `delta`, keeping the
    /// cached level volume in sync. Returns the volume actually removed.
    pub fn reduce_front(&mut self, delta: Decimal, volume_decimals: u32) -> Decimal {
        let Some(order) = self.orders.front_mut() else {
            return Decimal::ZERO;
        };
        let removed = reduce_total(order, delta, volume_decimals);
        self.volume -= removed;
        removed
    }

    /// Remove the order with the given id wherever it sits in the queue.
    pub fn remove(&mut self, order_id: crate::types::OrderId) -> Option<LimitOrder> {
        let pos = self.orders.iter().position(|o| o.header.id == order_id)?;
        let order = self.orders.remove(pos)?;
        self.volume -= order.total_volume();
        Some(order)
    }

    /// Reduce the identified order's leveraged volume by `delta` in place.
    /// Returns the volume actually removed, or `None` for an unknown id.
    pub fn reduce(
        &mut self,
        order_id: crate::types::OrderId,
        delta: Decimal,
        volume_decimals: u32,
    ) -> Option<Decimal> {
        let pos = self.orders.iter().position(|o| o.header.id == order_id)?;
        let order = self.orders.get_mut(pos)?;
        let removed = reduce_total(order, delta, volume_decimals);
        self.volume -= removed;
        Some(removed)
    }

    #[must_use]
    pub fn snapshot(&self) -> LevelSnapshot {
        LevelSnapshot {
            price: self.price,
            volume: self.volume,
            order_count: self.orders.len(),
        }
    }
}

/// Shrink a resting order by `delta` leveraged units, returning the leveraged
/// volume actually removed (equal to `delta` except when it consumes the
/// order, where any rounding residue goes with it).
fn reduce_total(order: &mut LimitOrder, delta: Decimal, volume_decimals: u32) -> Decimal {
    let before = order.total_volume();
    if delta >= before {
        order.header.volume = Decimal::ZERO;
        return before;
    }
    order.header.volume = crate::decimal::round(
        (before - delta) / crate::decimal::dec1p(order.header.leverage),
        volume_decimals,
    );
    before - order.total_volume()
}
