//! Top-level error types for the capture service

use thiserror::Error;
use types::book::BookRow;
use types::errors::{ProtocolError, StorageError};
use types::ids::ChannelId;

/// A bulk flush failed; the detached batch travels with the error so a
/// higher-level policy can retry it unchanged.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Flush of {} rows on channel {channel_id} failed: {source}", .rows.len())]
pub struct FlushError {
    pub channel_id: ChannelId,
    pub rows: Vec<BookRow>,
    #[source]
    pub source: StorageError,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Flush error: {0}")]
    Flush(#[from] FlushError),

    #[error("{} channel flushes failed during close", .0.len())]
    CloseIncomplete(Vec<FlushError>),
}
