//! `SlotRegister`: owner of all chunk slots, exposing find/reserve
//! operations, the counters that drive progress and backpressure, and the
//! global run state. Grounded in
//! `original_source/src/dcnum/logic/slot_register.py`'s `SlotRegister`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::data::input::InputData;
use crate::error::Result;
use crate::logic::chunk_slot::{ChunkSlot, SlotState};
use crate::logic::state_warden::{Stage, StateWarden};
use crate::logic::GlobalState;

/// Owns every slot for one job: `num_slots` regular slots, plus one
/// "remainder" slot if the input doesn't divide evenly into chunks.
pub struct SlotRegister {
    slots: Vec<Arc<ChunkSlot>>,
    num_chunks: usize,
    chunk_size: usize,
    global: GlobalState,
    chunks_loaded: AtomicU64,
    chunks_loaded_lock: Mutex<()>,
    masks_dropped: AtomicU64,
    write_queue_size: AtomicU64,
}

impl SlotRegister {
    /// Build a register sized for `input`'s image shape (`height`/`width`
    /// come from the caller since `InputData` doesn't expose them directly
    /// — the job runner reads them off the first chunk before constructing
    /// this register).
    pub fn new(
        input: &dyn InputData,
        num_slots: usize,
        height: usize,
        width: usize,
    ) -> Result<Self> {
        let chunk_size = input.chunk_size();
        let num_chunks = input.num_chunks();
        let num_frames = input.num_frames() as usize;
        // `keys()` enumerates scalar per-frame features, not the image
        // background stream, so background availability is checked by
        // actually asking for the first chunk's background instead.
        let has_bg = num_chunks > 0 && input.get_bg_chunk(0).is_some();
        let has_remainder = num_chunks > 0 && num_frames % chunk_size != 0;

        let mut slots = Vec::with_capacity(num_slots + has_remainder as usize);
        for _ in 0..num_slots {
            slots.push(Arc::new(ChunkSlot::new(chunk_size, height, width, has_bg, false)));
        }
        if has_remainder {
            let tail = num_frames % chunk_size;
            slots.push(Arc::new(ChunkSlot::new(tail, height, width, has_bg, true)));
        }

        Ok(Self {
            slots,
            num_chunks,
            chunk_size,
            global: GlobalState::new(),
            chunks_loaded: AtomicU64::new(0),
            chunks_loaded_lock: Mutex::new(()),
            masks_dropped: AtomicU64::new(0),
            write_queue_size: AtomicU64::new(0),
        })
    }

    pub fn num_chunks(&self) -> usize {
        self.num_chunks
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Called by the collector once it has durably accepted every frame in
    /// `[first_frame, first_frame+num_frames)`: any `Written` slot whose
    /// entire frame range now falls inside that accepted window is free to
    /// be reloaded, so it flips back to `AwaitingLoad` (the design's
    /// `w → i` edge, performed by the collector rather than the extractor
    /// that produced `w`).
    pub fn reclaim_written(&self, first_frame: u64, num_frames: u64) {
        if self.chunk_size == 0 {
            return;
        }
        let end_frame = first_frame + num_frames;
        for slot in &self.slots {
            if slot.state() != SlotState::Written {
                continue;
            }
            let Some(c) = slot.chunk() else { continue };
            let slot_start = c as u64 * self.chunk_size as u64;
            let slot_end = slot_start + slot.length() as u64;
            if slot_start >= first_frame && slot_end <= end_frame {
                slot.set_state(SlotState::AwaitingLoad);
            }
        }
    }

    pub fn global(&self) -> &GlobalState {
        &self.global
    }

    pub fn close(&self) {
        self.global.set(crate::logic::RunState::Quitting);
    }

    pub fn chunks_loaded(&self) -> u64 {
        self.chunks_loaded.load(Ordering::Acquire)
    }

    pub fn masks_dropped(&self) -> u64 {
        self.masks_dropped.load(Ordering::Acquire)
    }

    pub fn record_masks_dropped(&self, n: u64) {
        self.masks_dropped.fetch_add(n, Ordering::AcqRel);
    }

    pub fn write_queue_size(&self) -> u64 {
        self.write_queue_size.load(Ordering::Acquire)
    }

    pub fn set_write_queue_size(&self, v: u64) {
        self.write_queue_size.store(v, Ordering::Release);
    }

    pub fn add_write_queue_size(&self, delta: i64) {
        if delta >= 0 {
            self.write_queue_size.fetch_add(delta as u64, Ordering::AcqRel);
        } else {
            self.write_queue_size.fetch_sub((-delta) as u64, Ordering::AcqRel);
        }
    }

    /// Slots sorted ascending by `chunk` (unbound slots sort last), ties
    /// broken by slot index, so older work drains first.
    fn slots_sorted(&self) -> Vec<&Arc<ChunkSlot>> {
        let mut v: Vec<&Arc<ChunkSlot>> = self.slots.iter().collect();
        v.sort_by_key(|s| s.chunk().unwrap_or(u32::MAX));
        v
    }

    /// First slot matching `state` (and `chunk`, if given).
    pub fn find_slot(&self, state: SlotState, chunk: Option<u32>) -> Option<Arc<ChunkSlot>> {
        self.slots_sorted()
            .into_iter()
            .find(|s| s.state() == state && chunk.map(|c| s.chunk() == Some(c)).unwrap_or(true))
            .cloned()
    }

    /// Atomically bind a slot whose state is `current_state`, acquire up to
    /// `batch_size` frames of its `stage` task-lock, and return a
    /// `StateWarden`. `None` if no such slot exists or the lock yielded an
    /// empty range.
    pub fn reserve_slot_for_task(
        &self,
        current_state: SlotState,
        stage: Stage,
        chunk: Option<u32>,
        batch_size: Option<usize>,
    ) -> Option<StateWarden> {
        for slot in self.slots_sorted() {
            if slot.state() != current_state {
                continue;
            }
            if let Some(c) = chunk {
                if slot.chunk() != Some(c) {
                    continue;
                }
            }
            let lock = match stage {
                Stage::Segment => &slot.segment_lock,
                Stage::Extract => &slot.extract_lock,
            };
            let batch = batch_size.unwrap_or_else(|| slot.length());
            let (start, stop) = lock.acquire(batch);
            if stop > start {
                return Some(StateWarden::new(slot.clone(), stage, start, stop));
            }
        }
        None
    }

    /// Load as many `AwaitingLoad` slots as are ready for the next
    /// sequential chunk index, respecting the remainder-slot rule: the
    /// remainder slot is eligible iff `chunks_loaded == num_chunks - 1`.
    /// Returns whether any slot was loaded.
    pub fn task_load_all(&self, input: &dyn InputData) -> Result<bool> {
        let _guard = self.chunks_loaded_lock.lock();
        let mut did_something = false;
        loop {
            let next_chunk = self.chunks_loaded.load(Ordering::Acquire) as usize;
            if next_chunk >= self.num_chunks {
                break;
            }
            let wants_remainder = next_chunk == self.num_chunks - 1
                && self.slots.iter().any(|s| s.is_remainder);
            let slot = self
                .slots
                .iter()
                .find(|s| s.state() == SlotState::AwaitingLoad && s.is_remainder == wants_remainder);
            let slot = match slot {
                Some(s) => s,
                None => break,
            };
            let chunk = input.get_chunk(next_chunk)?;
            let bg = input.get_bg_chunk(next_chunk).transpose()?;
            let image_bytes: Vec<u8> = chunk.frames.concat();
            let bg_bytes: Option<Vec<u8>> = bg.map(|b| b.frames.concat());
            slot.load(next_chunk as u32, chunk.len(), &image_bytes, bg_bytes.as_deref())?;
            self.chunks_loaded.fetch_add(1, Ordering::AcqRel);
            did_something = true;
            debug!(chunk = next_chunk, "loaded chunk into slot");
        }
        Ok(did_something)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::input::MemoryInputData;

    fn frame(v: u8) -> Vec<u8> {
        vec![v; 4]
    }

    #[test]
    fn remainder_slot_created_for_uneven_chunking() {
        let images: Vec<_> = (0..5u8).map(frame).collect();
        let input = MemoryInputData::new(images, 2, 2, 2);
        let reg = SlotRegister::new(&input, 2, 2, 2).unwrap();
        assert_eq!(reg.slots.len(), 3);
        assert!(reg.slots.iter().any(|s| s.is_remainder));
    }

    #[test]
    fn task_load_all_respects_sequential_order_and_remainder_rule() {
        let images: Vec<_> = (0..5u8).map(frame).collect();
        let input = MemoryInputData::new(images, 2, 2, 2);
        let reg = SlotRegister::new(&input, 1, 2, 2).unwrap();
        // only one regular slot + one remainder slot; chunks_loaded starts at 0
        assert!(reg.task_load_all(&input).unwrap());
        assert_eq!(reg.chunks_loaded(), 1);
        let loaded = reg.find_slot(SlotState::Loaded, Some(0));
        assert!(loaded.is_some());

        // regular slot is occupied (state Loaded, not AwaitingLoad), so the
        // remainder chunk (index 1, the last) cannot load until it frees up
        assert!(!reg.task_load_all(&input).unwrap());
        assert_eq!(reg.chunks_loaded(), 1);

        // free the regular slot, then the remainder chunk becomes loadable
        loaded.unwrap().set_state(SlotState::AwaitingLoad);
        assert!(reg.task_load_all(&input).unwrap());
        assert_eq!(reg.chunks_loaded(), 2);
        let remainder = reg.find_slot(SlotState::Loaded, Some(1)).unwrap();
        assert!(remainder.is_remainder);
        assert_eq!(remainder.length(), 1);
    }
}
