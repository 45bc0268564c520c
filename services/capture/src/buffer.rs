//! Record buffer and flush policy for completed order-book episodes
//!
//! Rows accumulate across episodes and are written in one bulk insert once
//! the buffer grows past the threshold. Episodes are appended whole, so a
//! flush never splits an episode's rows.

use std::mem;

use types::book::BookRow;

/// Default number of buffered rows tolerated before a flush.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 1000;

/// Decides when a record buffer is flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Flush once the buffer holds strictly more rows than this.
    pub threshold: usize,
}

impl FlushPolicy {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    pub fn should_flush(&self, buffered: usize) -> bool {
        buffered > self.threshold
    }
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_FLUSH_THRESHOLD)
    }
}

/// Ordered rows awaiting a bulk write.
#[derive(Debug, Default)]
pub struct RecordBuffer {
    rows: Vec<BookRow>,
}

impl RecordBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append all rows of one completed episode.
    pub fn extend(&mut self, rows: Vec<BookRow>) {
        self.rows.extend(rows);
    }

    /// Detach the whole buffer, leaving it empty.
    pub fn take(&mut self) -> Vec<BookRow> {
        mem::take(&mut self.rows)
    }

    pub fn rows(&self) -> &[BookRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
