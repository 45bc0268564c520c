//! Trade execution types

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ids::{ChannelId, PairId, TradeId};
use crate::numeric::Timestamp;

/// A trade as published on a trade channel, already normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: TradeId,
    pub executed_at: Timestamp,
    /// Signed quantity: positive when the taker bought.
    pub quantity: Decimal,
    pub price: Decimal,
}

/// Trade row as persisted. Field order matches the trade table columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeRow {
    pub trade_id: TradeId,
    pub quantity: Decimal,
    pub price: Decimal,
    pub receive_timestamp: Timestamp,
    pub exchange_timestamp: Timestamp,
    pub pair_id: PairId,
    pub channel_id: ChannelId,
}

impl TradeRow {
    pub fn new(trade: &Trade, receive_timestamp: Timestamp, pair_id: PairId, channel_id: ChannelId) -> Self {
        Self {
            trade_id: trade.trade_id,
            quantity: trade.quantity,
            price: trade.price,
            receive_timestamp,
            exchange_timestamp: trade.executed_at,
            pair_id,
            channel_id,
        }
    }
}
