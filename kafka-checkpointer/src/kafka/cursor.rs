//! Partition Cursor - next-to-read and last-committed offsets for one partition.
//!
//! Offsets follow the Kafka convention: a committed offset is the *next*
//! offset to consume, so a cursor that has been fully flushed has
//! `last_committed_offset == Some(next_offset)`.

use tracing::warn;

use crate::kafka::message::Record;
use crate::kafka::types::{Partition, PartitionState};

#[derive(Debug, Clone)]
pub struct Cursor {
    partition: Partition,
    next_offset: i64,
    last_committed_offset: Option<i64>,
    // offset the cursor was seeded at; progress is measured against it
    // until the first commit lands
    baseline: i64,
    state: PartitionState,
    realignment: Option<Realignment>,
}

/// The broker was caught fetching ahead of the cursor and sought back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Realignment {
    /// Offset the broker was sought back to
    pub seek_target: i64,
    /// First offset seen ahead of the cursor before the seek
    pub first_seen: i64,
}

impl Cursor {
    /// Seed a cursor from a durable checkpoint.
    pub fn from_checkpoint(partition: Partition, committed_offset: i64) -> Self {
        Self {
            partition,
            next_offset: committed_offset,
            last_committed_offset: Some(committed_offset),
            baseline: committed_offset,
            state: PartitionState::Active,
            realignment: None,
        }
    }

    /// Seed a cursor from the start policy (no checkpoint exists). Nothing is
    /// committable until a record has been delivered.
    pub fn from_start_offset(partition: Partition, next_offset: i64) -> Self {
        Self {
            partition,
            next_offset,
            last_committed_offset: None,
            baseline: next_offset,
            state: PartitionState::Active,
            realignment: None,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn next_offset(&self) -> i64 {
        self.next_offset
    }

    pub fn last_committed_offset(&self) -> Option<i64> {
        self.last_committed_offset
    }

    pub fn state(&self) -> PartitionState {
        self.state
    }

    pub fn set_state(&mut self, state: PartitionState) {
        self.state = state;
    }

    pub fn is_active(&self) -> bool {
        self.state == PartitionState::Active
    }

    pub fn set_realignment(&mut self, realignment: Realignment) {
        self.realignment = Some(realignment);
    }

    /// Whether a fetch that starts at `first_offset` may be delivered.
    ///
    /// A start behind or at `next_offset` always is. A start ahead of it is
    /// only accepted after the broker was sought back to `next_offset` and
    /// still does not return anything earlier, which is a real hole in the
    /// log (compaction, transaction markers).
    pub fn accepts_fetch_from(&self, first_offset: i64) -> bool {
        if first_offset <= self.next_offset {
            return true;
        }
        self.realignment.is_some_and(|realignment| {
            realignment.seek_target == self.next_offset && first_offset <= realignment.first_seen
        })
    }

    /// Move past a record whose delivery has completed successfully.
    /// Never moves backwards.
    pub fn advance(&mut self, record: &Record) {
        debug_assert_eq!(record.partition(), &self.partition);
        let next = record.offset() + 1;
        if next > self.next_offset {
            self.next_offset = next;
        } else {
            warn!(
                partition = %self.partition,
                offset = record.offset(),
                next_offset = self.next_offset,
                "Ignoring advance to an offset behind the cursor"
            );
        }
    }

    /// Record a durable commit. Never moves backwards.
    pub fn mark_committed(&mut self, offset: i64) {
        match self.last_committed_offset {
            Some(current) if current >= offset => {}
            _ => self.last_committed_offset = Some(offset),
        }
    }

    /// Offset to commit, if there is progress not yet durably recorded.
    pub fn pending_commit(&self) -> Option<i64> {
        let committed = self.last_committed_offset.unwrap_or(self.baseline);
        (self.next_offset > committed).then_some(self.next_offset)
    }
}
