//! Channel dispatcher
//!
//! Owns every channel handler of one connection. Subscription
//! acknowledgements register handlers, data frames are routed by their
//! leading channel id, and `close` flushes everything still buffered.
//!
//! ```text
//!   text frame ──► FeedMessage ──┬─ subscribed ──► register handler
//!                                ├─ unsubscribed ─► close + remove
//!                                ├─ other control ─► returned to caller
//!                                └─ data ─► lookup ─┬─ Book   ─► EpisodeAccumulator
//!                                                   └─ Trades ─► TradeRecorder
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{error, info, warn};
use types::errors::ProtocolError;
use types::ids::{ChannelId, PairId};
use types::numeric::Timestamp;

use crate::book::{BookOutcome, BookSettings, CloseReport, EpisodeAccumulator};
use crate::error::{CaptureError, FlushError};
use crate::events::{BookEvent, ChannelKind, ControlEvent, DataFrame, FeedMessage, SubscriptionAck, TradeEvent};
use crate::sink::StorageSink;
use crate::trades::{TradeOutcome, TradeRecorder};

/// Handler registered for one channel.
pub enum ChannelHandler {
    Book(EpisodeAccumulator),
    Trades(TradeRecorder),
}

impl ChannelHandler {
    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelHandler::Book(_) => ChannelKind::Book,
            ChannelHandler::Trades(_) => ChannelKind::Trades,
        }
    }

    async fn close(&mut self) -> Result<CloseReport, FlushError> {
        match self {
            ChannelHandler::Book(book) => book.close().await,
            ChannelHandler::Trades(trades) => {
                trades.close();
                Ok(CloseReport::default())
            }
        }
    }
}

/// What a routed message did.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    Subscribed {
        channel_id: ChannelId,
        kind: ChannelKind,
    },
    Book {
        channel_id: ChannelId,
        outcome: BookOutcome,
    },
    Trades {
        channel_id: ChannelId,
        outcome: TradeOutcome,
    },
    Unsubscribed {
        channel_id: ChannelId,
        report: Option<CloseReport>,
    },
    /// A control event the dispatcher does not act on (info, conf, error).
    Control(ControlEvent),
}

/// Totals over all handlers closed by [`ChannelDispatcher::close`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseSummary {
    pub channels: usize,
    pub flushed_rows: usize,
    pub dropped_events: usize,
}

/// Routes one connection's frames to per-channel handlers.
pub struct ChannelDispatcher {
    pair_id: PairId,
    settings: BookSettings,
    sink: Arc<dyn StorageSink>,
    channels: BTreeMap<ChannelId, ChannelHandler>,
}

impl ChannelDispatcher {
    pub fn new(pair_id: PairId, settings: BookSettings, sink: Arc<dyn StorageSink>) -> Self {
        Self {
            pair_id,
            settings,
            sink,
            channels: BTreeMap::new(),
        }
    }

    /// Decode a text frame received at `receive_timestamp` and route it.
    pub async fn on_message(
        &mut self,
        receive_timestamp: Timestamp,
        text: &str,
    ) -> Result<Dispatched, CaptureError> {
        match FeedMessage::parse(text)? {
            FeedMessage::Control(ControlEvent::Subscribed(ack)) => self.on_subscribed(ack).await,
            FeedMessage::Control(ControlEvent::Unsubscribed { channel_id, .. }) => {
                self.on_unsubscribed(channel_id).await
            }
            FeedMessage::Control(event) => Ok(Dispatched::Control(event)),
            FeedMessage::Data(frame) => self.on_data(receive_timestamp, frame).await,
        }
    }

    /// Register a handler for an acknowledged subscription.
    ///
    /// A handler already registered under the same channel id is closed
    /// first; its flush failure is reported after the new handler is in
    /// place.
    pub async fn on_subscribed(&mut self, ack: SubscriptionAck) -> Result<Dispatched, CaptureError> {
        let kind = ChannelKind::parse(&ack.channel).ok_or_else(|| ProtocolError::UnknownSubscription {
            channel: ack.channel.clone(),
        })?;
        let channel_id = ack.channel_id;

        let handler = match kind {
            ChannelKind::Book => ChannelHandler::Book(EpisodeAccumulator::new(
                channel_id,
                self.pair_id,
                self.settings,
                Arc::clone(&self.sink),
            )),
            ChannelKind::Trades => {
                ChannelHandler::Trades(TradeRecorder::new(channel_id, self.pair_id, Arc::clone(&self.sink)))
            }
        };

        let replaced = match self.channels.remove(&channel_id) {
            Some(mut previous) => {
                warn!(
                    channel_id = %channel_id,
                    previous = previous.kind().as_str(),
                    "Channel re-subscribed, closing previous handler"
                );
                previous.close().await.map(|_| ())
            }
            None => Ok(()),
        };

        info!(
            channel_id = %channel_id,
            channel = kind.as_str(),
            symbol = ack.symbol.as_deref().unwrap_or(""),
            "Subscribed"
        );
        self.channels.insert(channel_id, handler);
        replaced?;

        Ok(Dispatched::Subscribed { channel_id, kind })
    }

    async fn on_unsubscribed(&mut self, channel_id: ChannelId) -> Result<Dispatched, CaptureError> {
        let report = match self.channels.remove(&channel_id) {
            Some(mut handler) => Some(handler.close().await?),
            None => {
                warn!(channel_id = %channel_id, "Unsubscribed from a channel with no handler");
                None
            }
        };
        info!(channel_id = %channel_id, "Unsubscribed");
        Ok(Dispatched::Unsubscribed { channel_id, report })
    }

    /// Route a data frame to its channel's handler.
    ///
    /// An unknown channel is rejected before the payload is inspected.
    pub async fn on_data(
        &mut self,
        receive_timestamp: Timestamp,
        frame: DataFrame,
    ) -> Result<Dispatched, CaptureError> {
        let channel_id = frame.channel_id;
        let handler = self
            .channels
            .get_mut(&channel_id)
            .ok_or(ProtocolError::UnknownChannel { channel_id })?;

        match handler {
            ChannelHandler::Book(book) => {
                let event = BookEvent::decode(&frame.body)?;
                let outcome = book.process(receive_timestamp, event).await?;
                Ok(Dispatched::Book { channel_id, outcome })
            }
            ChannelHandler::Trades(trades) => {
                let event = TradeEvent::decode(&frame.body)?;
                let outcome = trades.process(receive_timestamp, event).await;
                Ok(Dispatched::Trades { channel_id, outcome })
            }
        }
    }

    /// Close every handler in channel-id order and forget them.
    ///
    /// Every handler is closed even when an earlier one fails to flush.
    pub async fn close(&mut self) -> Result<CloseSummary, CaptureError> {
        let mut summary = CloseSummary::default();
        let mut failures = Vec::new();

        for (channel_id, mut handler) in std::mem::take(&mut self.channels) {
            summary.channels += 1;
            match handler.close().await {
                Ok(report) => {
                    summary.flushed_rows += report.flushed_rows;
                    summary.dropped_events += report.dropped_events;
                }
                Err(e) => {
                    error!(channel_id = %channel_id, error = %e, "Channel flush failed during close");
                    failures.push(e);
                }
            }
        }

        if !failures.is_empty() {
            return Err(CaptureError::CloseIncomplete(failures));
        }

        info!(
            channels = summary.channels,
            flushed_rows = summary.flushed_rows,
            dropped_events = summary.dropped_events,
            "Dispatcher closed"
        );
        Ok(summary)
    }

    pub fn handler(&self, channel_id: ChannelId) -> Option<&ChannelHandler> {
        self.channels.get(&channel_id)
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
