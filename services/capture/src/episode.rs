//! Episode reconstruction from raw order-book deltas
//!
//! The exchange never tags episode boundaries. A deletion is overloaded: when
//! an open group already exists it also means "this group is now closed".
//!
//! Per delta:
//! 1. Deletion while a group is open: the events accumulated *before* it
//!    become a completed episode and the group closes.
//! 2. Deletion while no group is open: nothing completes.
//! 3. Any other event opens (or continues) a group.
//! 4. The event is then appended to the accumulation, so a closing deletion
//!    always seeds the next episode.
//! 5. The newest observed message timestamp is tracked as the episode
//!    timestamp for the next completion.
//!
//! Snapshots bypass grouping entirely: one snapshot is one episode.

use std::mem;

use types::book::{BookRow, DeletionSentinel, DeltaEvent};
use types::ids::{ChannelId, PairId};
use types::numeric::Timestamp;

/// A completed, immutable group of deltas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Episode {
    members: Vec<DeltaEvent>,
    episode_timestamp: Timestamp,
}

impl Episode {
    pub fn new(members: Vec<DeltaEvent>, episode_timestamp: Timestamp) -> Self {
        Self {
            members,
            episode_timestamp,
        }
    }

    pub fn members(&self) -> &[DeltaEvent] {
        &self.members
    }

    pub fn episode_timestamp(&self) -> Timestamp {
        self.episode_timestamp
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Flatten into persistable rows, preserving member order.
    pub fn into_rows(self, pair_id: PairId, channel_id: ChannelId) -> Vec<BookRow> {
        let episode_timestamp = self.episode_timestamp;
        self.members
            .iter()
            .map(|event| BookRow::from_event(event, episode_timestamp, pair_id, channel_id))
            .collect()
    }
}

/// Per-channel grouping state machine.
#[derive(Debug, Clone)]
pub struct DeltaGrouper {
    sentinel: DeletionSentinel,
    is_episode_open: bool,
    accumulated: Vec<DeltaEvent>,
    last_episode_timestamp: Option<Timestamp>,
}

impl DeltaGrouper {
    pub fn new(sentinel: DeletionSentinel) -> Self {
        Self {
            sentinel,
            is_episode_open: false,
            accumulated: Vec::new(),
            last_episode_timestamp: None,
        }
    }

    /// Feed one delta; returns the episode it completed, if any.
    pub fn push(&mut self, event: DeltaEvent) -> Option<Episode> {
        let timestamp = event.exchange_timestamp;
        let mut completed = None;

        if self.sentinel.is_deletion(&event.level) {
            if self.is_episode_open {
                let members = mem::take(&mut self.accumulated);
                self.is_episode_open = false;
                // Recorded under the newest timestamp seen before this event
                let episode_timestamp = self.last_episode_timestamp.unwrap_or(timestamp);
                completed = Some(Episode::new(members, episode_timestamp));
            }
        } else {
            self.is_episode_open = true;
        }

        self.accumulated.push(event);
        self.observe(timestamp);
        completed
    }

    /// Turn a snapshot into a complete episode without touching the open group.
    pub fn snapshot(&mut self, members: Vec<DeltaEvent>, timestamp: Timestamp) -> Episode {
        self.last_episode_timestamp = Some(timestamp);
        Episode::new(members, timestamp)
    }

    fn observe(&mut self, timestamp: Timestamp) {
        if self.last_episode_timestamp.map_or(true, |last| timestamp > last) {
            self.last_episode_timestamp = Some(timestamp);
        }
    }

    pub fn is_episode_open(&self) -> bool {
        self.is_episode_open
    }

    pub fn accumulated(&self) -> &[DeltaEvent] {
        &self.accumulated
    }

    pub fn last_episode_timestamp(&self) -> Option<Timestamp> {
        self.last_episode_timestamp
    }

    /// Abandon the unterminated group, returning what it held.
    pub fn take_incomplete(&mut self) -> Vec<DeltaEvent> {
        self.is_episode_open = false;
        mem::take(&mut self.accumulated)
    }
}
