//! Assignment Tracker - owns the cursors of every partition assigned to this
//! process.
//!
//! Cursors live in a slot arena indexed by partition, so dispatch touches a
//! stable slot instead of re-hashing into a map of heap-allocated cursors on
//! every record. The arena sits behind a single short-lived mutex: it is the
//! serialization point for assignment changes and the section the commit
//! scheduler snapshots under. The lock is never held across an await.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::kafka::cursor::{Cursor, Realignment};
use crate::kafka::message::Record;
use crate::kafka::types::{Partition, PartitionOffset, PartitionState};
use crate::metrics_consts::OWNED_PARTITIONS;

#[derive(Default)]
struct CursorArena {
    slots: Vec<Option<Cursor>>,
    index: HashMap<Partition, usize>,
    free: Vec<usize>,
}

impl CursorArena {
    fn get(&self, partition: &Partition) -> Option<&Cursor> {
        self.index
            .get(partition)
            .and_then(|&slot| self.slots[slot].as_ref())
    }

    fn get_mut(&mut self, partition: &Partition) -> Option<&mut Cursor> {
        match self.index.get(partition) {
            Some(&slot) => self.slots[slot].as_mut(),
            None => None,
        }
    }

    fn insert(&mut self, cursor: Cursor) {
        let partition = cursor.partition().clone();
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(cursor);
                slot
            }
            None => {
                self.slots.push(Some(cursor));
                self.slots.len() - 1
            }
        };
        self.index.insert(partition, slot);
    }

    fn remove(&mut self, partition: &Partition) -> Option<Cursor> {
        let slot = self.index.remove(partition)?;
        self.free.push(slot);
        self.slots[slot].take()
    }

    fn cursors(&self) -> impl Iterator<Item = &Cursor> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

#[derive(Default)]
pub struct AssignmentTracker {
    arena: Mutex<CursorArena>,
}

impl AssignmentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CursorArena> {
        self.arena.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Take ownership of a partition. Returns false and keeps the existing
    /// cursor if the partition is already owned.
    pub fn insert(&self, cursor: Cursor) -> bool {
        let mut arena = self.lock();
        if arena.index.contains_key(cursor.partition()) {
            warn!(
                partition = %cursor.partition(),
                "Partition already owned, keeping existing cursor"
            );
            return false;
        }
        debug!(
            partition = %cursor.partition(),
            next_offset = cursor.next_offset(),
            "Tracking cursor"
        );
        arena.insert(cursor);
        metrics::gauge!(OWNED_PARTITIONS).set(arena.len() as f64);
        true
    }

    /// Release partitions and hand back their final cursors.
    pub fn remove(&self, partitions: &[Partition]) -> Vec<Cursor> {
        let mut arena = self.lock();
        let removed: Vec<Cursor> = partitions
            .iter()
            .filter_map(|partition| arena.remove(partition))
            .collect();
        metrics::gauge!(OWNED_PARTITIONS).set(arena.len() as f64);
        removed
    }

    /// Stop dispatch for the given partitions ahead of their release.
    /// Returns how many owned partitions were fenced.
    pub fn fence(&self, partitions: &[Partition]) -> usize {
        let mut arena = self.lock();
        let mut fenced = 0;
        for partition in partitions {
            if let Some(cursor) = arena.get_mut(partition) {
                cursor.set_state(PartitionState::Fenced);
                fenced += 1;
            }
        }
        fenced
    }

    pub fn set_state(&self, partition: &Partition, state: PartitionState) -> bool {
        match self.lock().get_mut(partition) {
            Some(cursor) => {
                cursor.set_state(state);
                true
            }
            None => false,
        }
    }

    pub fn state(&self, partition: &Partition) -> Option<PartitionState> {
        self.lock().get(partition).map(Cursor::state)
    }

    pub fn next_offset(&self, partition: &Partition) -> Option<i64> {
        self.lock().get(partition).map(Cursor::next_offset)
    }

    /// Snapshot of one cursor
    pub fn cursor(&self, partition: &Partition) -> Option<Cursor> {
        self.lock().get(partition).cloned()
    }

    /// Remember that the broker was sought back to the cursor. Returns false
    /// if the partition is no longer owned.
    pub fn set_realignment(&self, partition: &Partition, realignment: Realignment) -> bool {
        match self.lock().get_mut(partition) {
            Some(cursor) => {
                cursor.set_realignment(realignment);
                true
            }
            None => false,
        }
    }

    /// Advance the partition's cursor past a delivered record. Returns false
    /// if the partition is no longer owned.
    pub fn advance(&self, record: &Record) -> bool {
        match self.lock().get_mut(record.partition()) {
            Some(cursor) => {
                cursor.advance(record);
                true
            }
            None => false,
        }
    }

    /// Copy out every offset with uncommitted progress. `scope` limits the
    /// snapshot to the listed partitions.
    pub fn pending_commits(&self, scope: Option<&[Partition]>) -> Vec<PartitionOffset> {
        let arena = self.lock();
        let snapshot = |cursor: &Cursor| {
            cursor
                .pending_commit()
                .map(|offset| PartitionOffset::new(cursor.partition().clone(), offset))
        };
        match scope {
            Some(partitions) => partitions
                .iter()
                .filter_map(|partition| arena.get(partition))
                .filter_map(snapshot)
                .collect(),
            None => arena.cursors().filter_map(snapshot).collect(),
        }
    }

    /// Record durable commits. Partitions released in the meantime are skipped.
    pub fn mark_committed(&self, offsets: &[PartitionOffset]) {
        let mut arena = self.lock();
        for committed in offsets {
            if let Some(cursor) = arena.get_mut(committed.partition()) {
                cursor.mark_committed(committed.offset());
            }
        }
    }

    pub fn owned_partitions(&self) -> Vec<Partition> {
        let mut owned: Vec<Partition> = self.lock().index.keys().cloned().collect();
        owned.sort();
        owned
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
