//! Trade channel handler
//!
//! Trades are persisted one row per insert as they arrive. An execution-only
//! notice (`te`) is skipped: the matching update (`tu`) follows and carries
//! the final trade. A failed insert is logged and the channel moves on.

use std::sync::Arc;

use tracing::{debug, info, warn};
use types::ids::{ChannelId, PairId};
use types::numeric::Timestamp;
use types::trade::{Trade, TradeRow};

use crate::events::TradeEvent;
use crate::sink::{Row, StorageSink};

/// Rows attempted by one call to [`TradeRecorder::process`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TradeOutcome {
    pub persisted: usize,
    pub failed: usize,
}

/// Trade recorder bound to one trade channel.
pub struct TradeRecorder {
    channel_id: ChannelId,
    pair_id: PairId,
    sink: Arc<dyn StorageSink>,
}

impl TradeRecorder {
    pub fn new(channel_id: ChannelId, pair_id: PairId, sink: Arc<dyn StorageSink>) -> Self {
        info!(channel_id = %channel_id, pair_id = %pair_id, "Trades handler created");
        Self {
            channel_id,
            pair_id,
            sink,
        }
    }

    pub async fn process(&self, receive_timestamp: Timestamp, event: TradeEvent) -> TradeOutcome {
        match event {
            TradeEvent::Heartbeat => TradeOutcome::default(),
            TradeEvent::ExecutionOnly { trade_id } => {
                debug!(channel_id = %self.channel_id, trade_id = %trade_id, "Skipping execution notice");
                TradeOutcome::default()
            }
            TradeEvent::Update { trade, .. } => self.persist(receive_timestamp, &[trade]).await,
            TradeEvent::Snapshot { trades, .. } => {
                info!(channel_id = %self.channel_id, trades = trades.len(), "Trade snapshot received");
                self.persist(receive_timestamp, &trades).await
            }
        }
    }

    async fn persist(&self, receive_timestamp: Timestamp, trades: &[Trade]) -> TradeOutcome {
        let mut outcome = TradeOutcome::default();

        for trade in trades {
            let row = TradeRow::new(trade, receive_timestamp, self.pair_id, self.channel_id);
            match self.sink.insert_row(&Row::Trade(row)).await {
                Ok(()) => {
                    outcome.persisted += 1;
                    debug!(
                        channel_id = %self.channel_id,
                        trade_id = %trade.trade_id,
                        price = %trade.price,
                        quantity = %trade.quantity,
                        "Trade saved"
                    );
                }
                Err(e) => {
                    outcome.failed += 1;
                    warn!(
                        channel_id = %self.channel_id,
                        trade_id = %trade.trade_id,
                        error = %e,
                        "Failed to save trade"
                    );
                }
            }
        }

        outcome
    }

    /// Trades are never buffered, so closing only logs.
    pub fn close(&self) {
        info!(channel_id = %self.channel_id, "Closed trades handler");
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn pair_id(&self) -> PairId {
        self.pair_id
    }
}
