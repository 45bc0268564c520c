//! Order-book channel handler
//!
//! Groups deltas into episodes (see [`crate::episode`]), converts completed
//! episodes into rows, and bulk-writes the record buffer once the flush
//! policy says so. Rows are only ever produced from completed episodes.
//!
//! Flushes are awaited inline, so at most one flush per channel is in
//! flight and the channel's next event waits for it.

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use types::book::{BookRow, DeletionSentinel, DeltaEvent, EpisodeMarker};
use types::ids::{ChannelId, PairId};
use types::numeric::Timestamp;

use crate::buffer::{FlushPolicy, RecordBuffer};
use crate::episode::DeltaGrouper;
use crate::error::FlushError;
use crate::events::BookEvent;
use crate::sink::{Row, StorageSink, BOOK_EVENTS};

/// Per-channel settings for book handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookSettings {
    pub flush: FlushPolicy,
    pub sentinel: DeletionSentinel,
}

/// What one call to [`EpisodeAccumulator::process`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookOutcome {
    pub episode_completed: bool,
    /// Rows produced by the completed episode.
    pub completed_rows: usize,
    /// Rows written by a flush this call triggered.
    pub flushed_rows: usize,
}

/// Result of closing a handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseReport {
    pub flushed_rows: usize,
    /// Events of the unterminated episode that were intentionally dropped.
    pub dropped_events: usize,
}

/// Episode accumulator bound to one order-book channel.
pub struct EpisodeAccumulator {
    channel_id: ChannelId,
    pair_id: PairId,
    grouper: DeltaGrouper,
    records: RecordBuffer,
    policy: FlushPolicy,
    sink: Arc<dyn StorageSink>,
}

impl EpisodeAccumulator {
    pub fn new(
        channel_id: ChannelId,
        pair_id: PairId,
        settings: BookSettings,
        sink: Arc<dyn StorageSink>,
    ) -> Self {
        info!(
            channel_id = %channel_id,
            pair_id = %pair_id,
            flush_threshold = settings.flush.threshold,
            sentinel = ?settings.sentinel,
            "Book handler created"
        );

        Self {
            channel_id,
            pair_id,
            grouper: DeltaGrouper::new(settings.sentinel),
            records: RecordBuffer::new(),
            policy: settings.flush,
            sink,
        }
    }

    /// Process one decoded book event received at `receive_timestamp`.
    pub async fn process(
        &mut self,
        receive_timestamp: Timestamp,
        event: BookEvent,
    ) -> Result<BookOutcome, FlushError> {
        let completed = match event {
            BookEvent::Heartbeat => return Ok(BookOutcome::default()),
            BookEvent::Snapshot { levels, timestamp } => {
                info!(
                    channel_id = %self.channel_id,
                    levels = levels.len(),
                    %timestamp,
                    "Book snapshot received"
                );
                self.record_marker(timestamp).await;
                let members = levels
                    .into_iter()
                    .map(|level| DeltaEvent::new(level, timestamp, receive_timestamp))
                    .collect();
                Some(self.grouper.snapshot(members, timestamp))
            }
            BookEvent::Delta { level, timestamp } => self
                .grouper
                .push(DeltaEvent::new(level, timestamp, receive_timestamp)),
        };

        let Some(episode) = completed else {
            return Ok(BookOutcome::default());
        };

        let mut outcome = BookOutcome {
            episode_completed: true,
            completed_rows: episode.len(),
            flushed_rows: 0,
        };
        self.records
            .extend(episode.into_rows(self.pair_id, self.channel_id));

        if self.policy.should_flush(self.records.len()) {
            outcome.flushed_rows = self.flush().await?;
        } else {
            debug!(
                channel_id = %self.channel_id,
                buffered = self.records.len(),
                "Accumulated an episode to be saved"
            );
        }

        Ok(outcome)
    }

    /// Flush whatever is buffered and abandon the unterminated episode.
    pub async fn close(&mut self) -> Result<CloseReport, FlushError> {
        let dropped = self.grouper.take_incomplete();
        if !dropped.is_empty() {
            info!(
                channel_id = %self.channel_id,
                events = dropped.len(),
                "Incomplete episode not saved"
            );
        }

        let flushed_rows = if self.records.is_empty() {
            0
        } else {
            let count = self.flush().await?;
            info!(
                channel_id = %self.channel_id,
                pair_id = %self.pair_id,
                rows = count,
                "Finally saved raw book events"
            );
            count
        };

        info!(channel_id = %self.channel_id, "Closed book handler");
        Ok(CloseReport {
            flushed_rows,
            dropped_events: dropped.len(),
        })
    }

    /// Detach the buffer and write it in one bulk insert.
    async fn flush(&mut self) -> Result<usize, FlushError> {
        let rows = self.records.take();
        let count = rows.len();

        match self.sink.bulk_insert(&BOOK_EVENTS, &rows).await {
            Ok(()) => {
                debug!(
                    channel_id = %self.channel_id,
                    rows = count,
                    first = ?rows.first().map(|r| r.episode_timestamp),
                    last = ?rows.last().map(|r| r.episode_timestamp),
                    "Saved raw book events"
                );
                Ok(count)
            }
            Err(source) => {
                error!(
                    channel_id = %self.channel_id,
                    rows = count,
                    error = %source,
                    "Bulk flush failed"
                );
                Err(FlushError {
                    channel_id: self.channel_id,
                    rows,
                    source,
                })
            }
        }
    }

    /// Eagerly write the snapshot boundary marker; failures are logged only.
    async fn record_marker(&self, episode_timestamp: Timestamp) {
        let marker = Row::EpisodeMarker(EpisodeMarker {
            episode_timestamp,
            pair_id: self.pair_id,
            channel_id: self.channel_id,
        });
        if let Err(e) = self.sink.insert_row(&marker).await {
            warn!(
                channel_id = %self.channel_id,
                error = %e,
                "Failed to record episode marker"
            );
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn pair_id(&self) -> PairId {
        self.pair_id
    }

    pub fn is_episode_open(&self) -> bool {
        self.grouper.is_episode_open()
    }

    pub fn accumulated(&self) -> &[DeltaEvent] {
        self.grouper.accumulated()
    }

    pub fn buffered_rows(&self) -> &[BookRow] {
        self.records.rows()
    }

    pub fn last_episode_timestamp(&self) -> Option<Timestamp> {
        self.grouper.last_episode_timestamp()
    }
}
