//! Undo/redo history at two granularities.
//!
//! - The **user stack** holds a snapshot of the durable board after every
//!   local user mutation. Undo and redo hand back the snapshot to restore.
//! - The **timeline** records every batch. Global and AI-turn undo/redo
//!   move along it and produce a [`ReplayPlan`]: clear the board and replay
//!   the retained batches in order.
//!
//! While a replay runs, nothing is captured or recorded.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::actions::ActionBatch;
use crate::object::{ObjectId, WhiteboardObject};

/// Maximum number of user snapshots kept, the initial one included.
pub const MAX_USER_SNAPSHOTS: usize = 100;

/// History errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HistoryError {
    #[error("Nothing to undo")]
    NothingToUndo,
    #[error("Nothing to redo")]
    NothingToRedo,
    #[error("An AI batch is still in flight")]
    BatchInFlight,
    #[error("A replay is in progress")]
    ReplayInProgress,
}

/// The durable board at a batch boundary.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HistorySnapshot {
    pub objects: BTreeMap<ObjectId, WhiteboardObject>,
}

impl HistorySnapshot {
    pub fn new(objects: BTreeMap<ObjectId, WhiteboardObject>) -> Self {
        Self { objects }
    }
}

/// One recorded batch.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub batch: ActionBatch,
    /// Board state right after the batch was applied.
    pub snapshot: HistorySnapshot,
    /// Set by AI-turn undo; the batch is skipped on replay.
    pub undone: bool,
}

/// Batches to replay, in order, onto a cleared board.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayPlan {
    pub batches: Vec<ActionBatch>,
    /// Timeline position once the replay is done.
    pub target_index: usize,
}

/// Tracks user snapshots and the batch timeline.
#[derive(Debug)]
pub struct HistoryManager {
    user_snapshots: Vec<HistorySnapshot>,
    user_index: usize,
    max_user_snapshots: usize,
    timeline: Vec<TimelineEntry>,
    /// Number of timeline entries currently applied.
    global_index: usize,
    /// Timeline positions undone by AI-turn undo, most recent last.
    ai_redo: Vec<usize>,
    replaying: bool,
    batch_in_flight: bool,
}

impl Default for HistoryManager {
    fn default() -> Self {
        Self::new(MAX_USER_SNAPSHOTS)
    }
}

impl HistoryManager {
    pub fn new(max_user_snapshots: usize) -> Self {
        Self {
            user_snapshots: vec![HistorySnapshot::default()],
            user_index: 0,
            max_user_snapshots: max_user_snapshots.max(2),
            timeline: Vec::new(),
            global_index: 0,
            ai_redo: Vec::new(),
            replaying: false,
            batch_in_flight: false,
        }
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    /// Mark an AI batch as open. Undo and redo are rejected until cleared.
    pub fn set_batch_in_flight(&mut self, in_flight: bool) {
        self.batch_in_flight = in_flight;
    }

    fn guard(&self) -> Result<(), HistoryError> {
        if self.batch_in_flight {
            return Err(HistoryError::BatchInFlight);
        }
        if self.replaying {
            return Err(HistoryError::ReplayInProgress);
        }
        Ok(())
    }

    // --- User stack ---

    /// Record the board after a local user mutation.
    pub fn capture(&mut self, snapshot: HistorySnapshot) {
        if self.replaying {
            return;
        }
        if self.user_snapshots.get(self.user_index) == Some(&snapshot) {
            return;
        }
        self.user_snapshots.truncate(self.user_index + 1);
        self.user_snapshots.push(snapshot);
        self.user_index += 1;

        if self.user_snapshots.len() > self.max_user_snapshots {
            // Index 0 is the empty board and always stays
            self.user_snapshots.remove(1);
            self.user_index -= 1;
        }
    }

    pub fn can_undo_user(&self) -> bool {
        self.user_index > 0
    }

    pub fn can_redo_user(&self) -> bool {
        self.user_index + 1 < self.user_snapshots.len()
    }

    pub fn user_snapshot_count(&self) -> usize {
        self.user_snapshots.len()
    }

    /// Step back; returns the snapshot to restore.
    pub fn undo_user(&mut self) -> Result<HistorySnapshot, HistoryError> {
        self.guard()?;
        if !self.can_undo_user() {
            return Err(HistoryError::NothingToUndo);
        }
        self.user_index -= 1;
        Ok(self.user_snapshots[self.user_index].clone())
    }

    /// Step forward; returns the snapshot to restore.
    pub fn redo_user(&mut self) -> Result<HistorySnapshot, HistoryError> {
        self.guard()?;
        if !self.can_redo_user() {
            return Err(HistoryError::NothingToRedo);
        }
        self.user_index += 1;
        Ok(self.user_snapshots[self.user_index].clone())
    }

    // --- Timeline ---

    /// Append a batch. Drops any redo tail.
    pub fn record_batch(&mut self, batch: ActionBatch, snapshot: HistorySnapshot) {
        if self.replaying {
            return;
        }
        self.timeline.truncate(self.global_index);
        self.ai_redo.clear();
        self.timeline.push(TimelineEntry {
            batch,
            snapshot,
            undone: false,
        });
        self.global_index = self.timeline.len();
    }

    pub fn timeline(&self) -> &[TimelineEntry] {
        &self.timeline
    }

    pub fn global_index(&self) -> usize {
        self.global_index
    }

    /// Snapshot recorded after the entry at `index - 1`, or the empty board.
    pub fn snapshot_at(&self, index: usize) -> Option<HistorySnapshot> {
        match index {
            0 => Some(HistorySnapshot::default()),
            i => self.timeline.get(i - 1).map(|entry| entry.snapshot.clone()),
        }
    }

    fn plan(&mut self, target_index: usize) -> ReplayPlan {
        self.global_index = target_index;
        self.replaying = true;
        let batches = self.timeline[..target_index]
            .iter()
            .filter(|entry| !entry.undone)
            .map(|entry| entry.batch.clone())
            .collect();
        ReplayPlan { batches, target_index }
    }

    pub fn undo_global(&mut self) -> Result<ReplayPlan, HistoryError> {
        self.guard()?;
        if self.global_index == 0 {
            return Err(HistoryError::NothingToUndo);
        }
        Ok(self.plan(self.global_index - 1))
    }

    pub fn redo_global(&mut self) -> Result<ReplayPlan, HistoryError> {
        self.guard()?;
        if self.global_index >= self.timeline.len() {
            return Err(HistoryError::NothingToRedo);
        }
        Ok(self.plan(self.global_index + 1))
    }

    /// Undo the most recent applied AI batch, keeping later user batches.
    pub fn undo_ai(&mut self) -> Result<ReplayPlan, HistoryError> {
        self.guard()?;
        let position = self.timeline[..self.global_index]
            .iter()
            .rposition(|entry| entry.batch.is_ai() && !entry.undone)
            .ok_or(HistoryError::NothingToUndo)?;
        self.timeline[position].undone = true;
        self.ai_redo.push(position);
        Ok(self.plan(self.global_index))
    }

    /// Redo the most recently undone AI batch.
    pub fn redo_ai(&mut self) -> Result<ReplayPlan, HistoryError> {
        self.guard()?;
        while let Some(position) = self.ai_redo.pop() {
            if position < self.global_index && self.timeline[position].undone {
                self.timeline[position].undone = false;
                return Ok(self.plan(self.global_index));
            }
        }
        Err(HistoryError::NothingToRedo)
    }

    /// Move to an arbitrary timeline position.
    pub fn replay_to(&mut self, index: usize) -> Result<ReplayPlan, HistoryError> {
        self.guard()?;
        if index > self.timeline.len() {
            return Err(HistoryError::NothingToRedo);
        }
        Ok(self.plan(index))
    }

    /// Leave replay mode. Call once every batch of the plan was applied.
    pub fn finish_replay(&mut self) {
        self.replaying = false;
    }
}
