//! Order-book event and row types
//!
//! A raw order-book message carries `(order_id, price, amount)`: the sign of
//! `amount` encodes the side (positive bid, negative ask) and a zero encodes
//! deletion.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ids::{ChannelId, OrderId, PairId};
use crate::numeric::Timestamp;

/// Which field of a raw book tuple signals an order deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionSentinel {
    /// `amount == 0` marks a deletion.
    #[default]
    ZeroAmount,
    /// `price == 0` marks a deletion (the raw-book wire convention).
    ZeroPrice,
}

impl DeletionSentinel {
    /// Whether `level` is a deletion under this convention.
    pub fn is_deletion(&self, level: &DeltaLevel) -> bool {
        match self {
            DeletionSentinel::ZeroAmount => level.amount.is_zero(),
            DeletionSentinel::ZeroPrice => level.price.is_zero(),
        }
    }
}

/// The raw `(order_id, price, amount)` triple of one book mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaLevel {
    pub order_id: OrderId,
    pub price: Decimal,
    pub amount: Decimal,
}

impl DeltaLevel {
    pub fn new(order_id: OrderId, price: Decimal, amount: Decimal) -> Self {
        Self {
            order_id,
            price,
            amount,
        }
    }
}

/// One order-book mutation as received, tagged with both clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaEvent {
    pub level: DeltaLevel,
    /// Timestamp of the message that carried this event.
    pub exchange_timestamp: Timestamp,
    /// Local arrival time.
    pub receive_timestamp: Timestamp,
}

impl DeltaEvent {
    pub fn new(level: DeltaLevel, exchange_timestamp: Timestamp, receive_timestamp: Timestamp) -> Self {
        Self {
            level,
            exchange_timestamp,
            receive_timestamp,
        }
    }

    pub fn order_id(&self) -> OrderId {
        self.level.order_id
    }
}

/// Flattened order-book row as persisted.
///
/// Field order matches the bulk-insert column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookRow {
    /// Timestamp under which the owning episode is recorded.
    pub episode_timestamp: Timestamp,
    pub order_id: OrderId,
    pub price: Decimal,
    pub amount: Decimal,
    pub pair_id: PairId,
    pub receive_timestamp: Timestamp,
    pub channel_id: ChannelId,
    /// The member event's own message timestamp.
    pub exchange_timestamp: Timestamp,
}

impl BookRow {
    pub fn from_event(
        event: &DeltaEvent,
        episode_timestamp: Timestamp,
        pair_id: PairId,
        channel_id: ChannelId,
    ) -> Self {
        Self {
            episode_timestamp,
            order_id: event.level.order_id,
            price: event.level.price,
            amount: event.level.amount,
            pair_id,
            receive_timestamp: event.receive_timestamp,
            channel_id,
            exchange_timestamp: event.exchange_timestamp,
        }
    }
}

/// Audit record proving a snapshot episode boundary was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeMarker {
    pub episode_timestamp: Timestamp,
    pub pair_id: PairId,
    pub channel_id: ChannelId,
}
