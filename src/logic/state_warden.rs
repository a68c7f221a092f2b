//! `StateWarden`: a scoped reservation over one slot's stage task-lock.
//!
//! Constructed only by `SlotRegister::reserve_slot_for_task`. On drop it
//! commits (marks the reserved range done, and advances the slot's state if
//! the stage is now fully complete) unless the caller called `.fail(..)`
//! first, in which case the range is returned to the free pool and the
//! slot's state is left unchanged. A guard whose `Drop` does the bookkeeping
//! a context manager would otherwise hide.

use std::sync::Arc;

use tracing::warn;

use crate::logic::chunk_slot::{ChunkSlot, SlotState, TaskLock};

/// Which stage a `StateWarden` was reserved for, determining which
/// task-lock it releases into and which state it advances to on
/// completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Segment,
    Extract,
}

pub struct StateWarden {
    slot: Arc<ChunkSlot>,
    stage: Stage,
    start: usize,
    stop: usize,
    failed: bool,
}

impl StateWarden {
    pub(crate) fn new(slot: Arc<ChunkSlot>, stage: Stage, start: usize, stop: usize) -> Self {
        Self {
            slot,
            stage,
            start,
            stop,
            failed: false,
        }
    }

    /// The reserved frame range, relative to the slot's current load.
    pub fn range(&self) -> (usize, usize) {
        (self.start, self.stop)
    }

    pub fn slot(&self) -> &ChunkSlot {
        &self.slot
    }

    /// Force the rollback path: the reserved range is returned to the free
    /// pool and the slot's state is left unchanged.
    pub fn fail(mut self, reason: &str) {
        warn!(reason, start = self.start, stop = self.stop, "stage batch failed");
        self.failed = true;
        // Dropping `self` now runs `Drop::drop`, which takes the rollback path.
    }

    fn task_lock(&self) -> &TaskLock {
        match self.stage {
            Stage::Segment => &self.slot.segment_lock,
            Stage::Extract => &self.slot.extract_lock,
        }
    }
}

impl Drop for StateWarden {
    fn drop(&mut self) {
        let lock = match self.stage {
            Stage::Segment => &self.slot.segment_lock,
            Stage::Extract => &self.slot.extract_lock,
        };
        if self.failed {
            lock.release_failed(self.start, self.stop);
            return;
        }
        lock.release_done(self.start, self.stop);
        if lock.all_done() {
            let next = match self.stage {
                Stage::Segment => SlotState::Segmented,
                Stage::Extract => SlotState::Written,
            };
            self.slot.set_state(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> Arc<ChunkSlot> {
        let s = Arc::new(ChunkSlot::new(4, 1, 1, false, false));
        s.load(0, 4, &[1, 2, 3, 4], None).unwrap();
        s
    }

    #[test]
    fn commit_advances_state_when_stage_completes() {
        let s = slot();
        let (start, stop) = s.segment_lock.acquire(4);
        let warden = StateWarden::new(s.clone(), Stage::Segment, start, stop);
        drop(warden);
        assert_eq!(s.state(), SlotState::Segmented);
    }

    #[test]
    fn commit_does_not_advance_state_until_all_frames_done() {
        let s = slot();
        let (start, stop) = s.segment_lock.acquire(2);
        let warden = StateWarden::new(s.clone(), Stage::Segment, start, stop);
        drop(warden);
        assert_eq!(s.state(), SlotState::Loaded);
    }

    #[test]
    fn fail_rolls_back_and_leaves_state_unchanged() {
        let s = slot();
        let (start, stop) = s.segment_lock.acquire(4);
        let warden = StateWarden::new(s.clone(), Stage::Segment, start, stop);
        warden.fail("forced test failure");
        assert_eq!(s.state(), SlotState::Loaded);
        let (start2, stop2) = s.segment_lock.acquire(4);
        assert_eq!((start2, stop2), (0, 4));
    }
}
