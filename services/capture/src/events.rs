//! Inbound feed message definitions and decoding
//!
//! Frames arrive as JSON text in one of two shapes:
//! - control events: objects tagged by `"event"` (info, conf, subscribed, ...)
//! - data frames: arrays `[chanId, body..., ts_ms]` whose meaning depends on
//!   the kind of channel `chanId` was subscribed as
//!
//! The trailing element of every non-heartbeat data frame is the message
//! timestamp, requested through the timestamp connection flag.

use serde::Deserialize;
use serde_json::Value;
use types::book::DeltaLevel;
use types::errors::ProtocolError;
use types::ids::{ChannelId, OrderId, TradeId};
use types::numeric::{decimal_from_value, integer_from_value, timestamp_from_value, Timestamp};
use types::trade::Trade;

pub const HEARTBEAT: &str = "hb";
pub const TRADE_UPDATE: &str = "tu";
pub const TRADE_EXECUTED: &str = "te";

/// Server asks clients to reconnect.
pub const INFO_RECONNECT: u32 = 20051;
/// Exchange entered maintenance.
pub const INFO_MAINTENANCE_START: u32 = 20060;
/// Exchange left maintenance; subscriptions must be re-established.
pub const INFO_MAINTENANCE_END: u32 = 20061;

/// Kind of a subscribed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Book,
    Trades,
}

impl ChannelKind {
    /// Parse the channel name used in subscription acknowledgements.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "book" => Some(ChannelKind::Book),
            "trades" => Some(ChannelKind::Trades),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Book => "book",
            ChannelKind::Trades => "trades",
        }
    }
}

/// Acknowledgement that a subscription was accepted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscriptionAck {
    pub channel: String,
    #[serde(rename = "chanId")]
    pub channel_id: ChannelId,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub pair: Option<String>,
    #[serde(default)]
    pub prec: Option<String>,
}

/// Control events, tagged by their `event` field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ControlEvent {
    Info {
        #[serde(default)]
        version: Option<u32>,
        #[serde(default)]
        code: Option<u32>,
        #[serde(default)]
        msg: Option<String>,
    },
    Conf {
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        flags: Option<u64>,
    },
    Subscribed(SubscriptionAck),
    Unsubscribed {
        #[serde(rename = "chanId")]
        channel_id: ChannelId,
        #[serde(default)]
        status: Option<String>,
    },
    Error {
        #[serde(default)]
        code: Option<u32>,
        #[serde(default)]
        msg: Option<String>,
    },
}

impl ControlEvent {
    /// Info code, if this is an info event carrying one.
    pub fn info_code(&self) -> Option<u32> {
        match self {
            ControlEvent::Info { code, .. } => *code,
            _ => None,
        }
    }
}

/// A data frame with its leading channel id split off.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    pub channel_id: ChannelId,
    /// Everything after the channel id, timestamp included.
    pub body: Vec<Value>,
}

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Control(ControlEvent),
    Data(DataFrame),
}

impl FeedMessage {
    /// Decode a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::malformed(format!("invalid JSON: {e}")))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        match value {
            Value::Object(_) => serde_json::from_value(value)
                .map(FeedMessage::Control)
                .map_err(|e| ProtocolError::malformed(format!("control event: {e}"))),
            Value::Array(mut items) => {
                if items.is_empty() {
                    return Err(ProtocolError::malformed("empty data frame"));
                }
                let body = items.split_off(1);
                let channel_id = integer_from_value(&items[0])
                    .map_err(|_| ProtocolError::malformed("channel id is not an integer"))?;
                Ok(FeedMessage::Data(DataFrame {
                    channel_id: ChannelId::new(channel_id),
                    body,
                }))
            }
            other => Err(ProtocolError::malformed(format!(
                "unexpected top-level value: {other}"
            ))),
        }
    }
}

/// Decoded payload of an order-book channel frame.
#[derive(Debug, Clone, PartialEq)]
pub enum BookEvent {
    Heartbeat,
    /// Full book state delivered as one message; always one complete episode.
    Snapshot {
        levels: Vec<DeltaLevel>,
        timestamp: Timestamp,
    },
    Delta {
        level: DeltaLevel,
        timestamp: Timestamp,
    },
}

impl BookEvent {
    pub fn decode(body: &[Value]) -> Result<Self, ProtocolError> {
        let first = body
            .first()
            .ok_or_else(|| ProtocolError::malformed("empty book message"))?;
        if is_heartbeat(first) {
            return Ok(BookEvent::Heartbeat);
        }

        let timestamp = match body {
            [_, ts] => timestamp_from_value(ts)?,
            _ => {
                return Err(ProtocolError::malformed(format!(
                    "book message must be [payload, timestamp], got {} elements",
                    body.len()
                )))
            }
        };

        match first {
            Value::Array(items) if items.is_empty() || items[0].is_array() => {
                let levels = items
                    .iter()
                    .map(decode_level)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(BookEvent::Snapshot { levels, timestamp })
            }
            Value::Array(_) => Ok(BookEvent::Delta {
                level: decode_level(first)?,
                timestamp,
            }),
            other => Err(ProtocolError::malformed(format!(
                "unexpected book payload: {other}"
            ))),
        }
    }
}

/// Decoded payload of a trade channel frame.
#[derive(Debug, Clone, PartialEq)]
pub enum TradeEvent {
    Heartbeat,
    Update {
        trade: Trade,
        timestamp: Timestamp,
    },
    /// Execution notice preceding the `Update` for the same fill.
    ExecutionOnly {
        trade_id: TradeId,
    },
    /// Initial batch of historical trades.
    Snapshot {
        trades: Vec<Trade>,
        timestamp: Timestamp,
    },
}

impl TradeEvent {
    pub fn decode(body: &[Value]) -> Result<Self, ProtocolError> {
        let first = body
            .first()
            .ok_or_else(|| ProtocolError::malformed("empty trade message"))?;

        match first {
            Value::String(tag) if tag == HEARTBEAT => Ok(TradeEvent::Heartbeat),
            Value::String(tag) if tag == TRADE_UPDATE => match body {
                [_, raw, ts] => Ok(TradeEvent::Update {
                    trade: decode_trade(raw)?,
                    timestamp: timestamp_from_value(ts)?,
                }),
                _ => Err(ProtocolError::malformed("trade update must be [tu, trade, timestamp]")),
            },
            Value::String(tag) if tag == TRADE_EXECUTED => match body {
                [_, raw, _] => Ok(TradeEvent::ExecutionOnly {
                    trade_id: decode_trade(raw)?.trade_id,
                }),
                _ => Err(ProtocolError::malformed("trade execution must be [te, trade, timestamp]")),
            },
            Value::String(tag) => Err(ProtocolError::malformed(format!(
                "unknown trade discriminator: {tag}"
            ))),
            Value::Array(items) => match body {
                [_, ts] => Ok(TradeEvent::Snapshot {
                    trades: items.iter().map(decode_trade).collect::<Result<Vec<_>, _>>()?,
                    timestamp: timestamp_from_value(ts)?,
                }),
                _ => Err(ProtocolError::malformed("trade snapshot must be [trades, timestamp]")),
            },
            other => Err(ProtocolError::malformed(format!(
                "unexpected trade payload: {other}"
            ))),
        }
    }
}

fn is_heartbeat(value: &Value) -> bool {
    value.as_str() == Some(HEARTBEAT)
}

/// `[order_id, price, amount]`
fn decode_level(value: &Value) -> Result<DeltaLevel, ProtocolError> {
    match value.as_array().map(Vec::as_slice) {
        Some([order_id, price, amount]) => Ok(DeltaLevel::new(
            OrderId::new(integer_from_value(order_id)?),
            decimal_from_value(price)?,
            decimal_from_value(amount)?,
        )),
        _ => Err(ProtocolError::malformed(format!(
            "book entry must be [order_id, price, amount], got {value}"
        ))),
    }
}

/// `[id, mts, amount, price]`
fn decode_trade(value: &Value) -> Result<Trade, ProtocolError> {
    match value.as_array().map(Vec::as_slice) {
        Some([id, mts, amount, price]) => Ok(Trade {
            trade_id: TradeId::new(integer_from_value(id)?),
            executed_at: timestamp_from_value(mts)?,
            quantity: decimal_from_value(amount)?,
            price: decimal_from_value(price)?,
        }),
        _ => Err(ProtocolError::malformed(format!(
            "trade entry must be [id, mts, amount, price], got {value}"
        ))),
    }
}
