//! Append-only per-book L3 event record: placements, trades, cancellations.

use crate::book::{Order, OrderContext, Trade, TradeContext};
use crate::types::{AgentId, BookId, OrderId, Timestamp};
use rust_decimal::Decimal;
use serde::Serialize;

/// An order placement entering the record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderEvent {
    pub timestamp: Timestamp,
    pub order: Order,
    pub context: OrderContext,
}

/// A trade entering the record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeEvent {
    pub trade: Trade,
    pub context: TradeContext,
}

/// A cancellation entering the record: explicit, self-trade-prevention or
/// expiry driven.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancellationEvent {
    pub timestamp: Timestamp,
    pub book_id: BookId,
    pub order_id: OrderId,
    pub agent_id: AgentId,
    pub volume: Decimal,
}

/// A single tagged entry of the L3 record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum L3Event {
    Order(OrderEvent),
    Trade(TradeEvent),
    Cancellation(CancellationEvent),
}

/// Time-ordered log of everything that happened on one book.
#[derive(Debug, Clone, Default, Serialize)]
pub struct L3Record {
    entries: Vec<L3Event>,
}

impl L3Record {
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, entry: L3Event) {
        self.entries.push(entry);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &L3Event> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::OrderDirection;
    use rust_decimal_macros::dec;

    #[test]
    fn entries_serialize_with_their_tag() {
        let mut record = L3Record::default();
        record.push(L3Event::Cancellation(CancellationEvent {
            timestamp: 5,
            book_id: 0,
            order_id: 3,
            agent_id: -1,
            volume: dec!(1.5),
        }));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["entries"][0]["event"], "CANCELLATION");
        assert_eq!(json["entries"][0]["order_id"], 3);
    }

    #[test]
    fn record_is_append_only_in_order() {
        let mut record = L3Record::default();
        for id in 0..3 {
            record.push(L3Event::Trade(TradeEvent {
                trade: Trade {
                    id,
                    timestamp: id,
                    direction: OrderDirection::Buy,
                    aggressing_order_id: 1,
                    resting_order_id: 0,
                    volume: dec!(1),
                    price: dec!(100),
                },
                context: TradeContext {
                    book_id: 0,
                    aggressing_agent_id: -1,
                    resting_agent_id: -2,
                    fees: Default::default(),
                },
            }));
        }
        let ids: Vec<_> = record
            .iter()
            .map(|e| match e {
                L3Event::Trade(t) => t.trade.id,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }
}
