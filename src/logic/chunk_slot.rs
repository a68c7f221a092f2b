//! `ChunkSlot`: a reusable shared buffer sized to one input chunk, carrying
//! the image/background/corrected-image/mask/labels views plus a small
//! state/progress word, grounded in
//! `original_source/src/dcnum/logic/chunk_slot.py`'s `ChunkSlotBase`/`ChunkSlot`
//! (there backed by `multiprocessing.Value`/`RawArray`; here by `SharedRegion`
//! and atomics).

use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{DcnumError, Result};
use crate::shared::SharedRegion;

/// A slot's local state, following the design's `i/s/e/w/d` letters. The
/// state stays put while a stage's task-lock is being worked through by
/// possibly several workers; it only advances once every frame in
/// `[0, length)` for that stage is done (see `StateWarden`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    /// Awaiting the next chunk load (the diagram's initial `0` and its
    /// recycled-after-`d` state are the same thing from a scheduling
    /// standpoint, so they share this variant).
    AwaitingLoad = 0,
    /// Loaded; ready for, or undergoing, segmentation.
    Loaded = 1,
    /// Segmentation complete; ready for, or undergoing, extraction.
    Segmented = 2,
    /// Extraction complete; events published, awaiting collector write-ack.
    Written = 3,
    /// Collector has accepted every frame in this slot.
    Done = 4,
}

impl SlotState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SlotState::Loaded,
            2 => SlotState::Segmented,
            3 => SlotState::Written,
            4 => SlotState::Done,
            _ => SlotState::AwaitingLoad,
        }
    }

    /// Single-letter mnemonic matching the design's `i/s/e/w/d` notation.
    pub fn letter(self) -> char {
        match self {
            SlotState::AwaitingLoad => 'i',
            SlotState::Loaded => 's',
            SlotState::Segmented => 'e',
            SlotState::Written => 'w',
            SlotState::Done => 'd',
        }
    }
}

/// Reserves a contiguous sub-range of a slot's frames for one stage. Not
/// itself a lock over the buffer's bytes (there is none); it hands out
/// disjoint frame ranges so concurrent workers never touch the same frame.
#[derive(Debug, Default)]
pub struct TaskLock {
    next: AtomicUsize,
    length: AtomicUsize,
    done: Mutex<Vec<bool>>,
}

impl TaskLock {
    fn reset(&self, length: usize) {
        self.next.store(0, Ordering::SeqCst);
        self.length.store(length, Ordering::SeqCst);
        *self.done.lock() = vec![false; length];
    }

    /// Atomically reserve up to `batch_size` frames. Returns `(0, 0)` (an
    /// empty range) if nothing remains.
    pub fn acquire(&self, batch_size: usize) -> (usize, usize) {
        let length = self.length.load(Ordering::SeqCst);
        loop {
            let start = self.next.load(Ordering::SeqCst);
            if start >= length {
                return (0, 0);
            }
            let stop = (start + batch_size).min(length);
            if self
                .next
                .compare_exchange(start, stop, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return (start, stop);
            }
        }
    }

    /// Mark `[start, stop)` as done (or return it to the free pool on
    /// failure by leaving `done` unset, which a later `acquire` cannot
    /// re-issue since `next` has already advanced past it — callers that
    /// fail a batch must report it via `release_failed` instead).
    pub fn release_done(&self, start: usize, stop: usize) {
        let mut done = self.done.lock();
        for d in &mut done[start..stop] {
            *d = true;
        }
    }

    /// Roll a failed batch back so a subsequent `acquire` can reissue it.
    pub fn release_failed(&self, start: usize, stop: usize) {
        self.next.store(start, Ordering::SeqCst);
        let _ = stop;
    }

    /// True once every frame `[0, length)` has been marked done.
    pub fn all_done(&self) -> bool {
        self.done.lock().iter().all(|d| *d)
    }

    pub fn progress(&self) -> f64 {
        let done = self.done.lock();
        if done.is_empty() {
            return 1.0;
        }
        done.iter().filter(|d| **d).count() as f64 / done.len() as f64
    }
}

/// Byte-offset layout of a slot's typed views within its `SharedRegion`.
struct Layout {
    image: (usize, usize),
    image_bg: Option<(usize, usize)>,
    image_corr: Option<(usize, usize)>,
    bg_off: Option<(usize, usize)>,
    mask: (usize, usize),
    labels: (usize, usize),
}

impl Layout {
    fn compute(length: usize, h: usize, w: usize, has_bg: bool) -> Self {
        let pixels = length * h * w;
        let mut offset = 0usize;
        let mut place = |nbytes: usize| {
            let start = offset;
            offset += nbytes;
            (start, nbytes)
        };
        let image = place(pixels); // u8
        let (image_bg, image_corr, bg_off) = if has_bg {
            let bg = place(pixels); // u8
            let corr = place(pixels * 2); // i16
            let off = place(length * 8); // f64
            (Some(bg), Some(corr), Some(off))
        } else {
            (None, None, None)
        };
        let mask = place(pixels); // bool stored as u8
        let labels = place(pixels * 2); // u16
        Self {
            image,
            image_bg,
            image_corr,
            bg_off,
            mask,
            labels,
        }
    }

    fn total_len(&self) -> usize {
        [
            Some(self.image),
            self.image_bg,
            self.image_corr,
            self.bg_off,
            Some(self.mask),
            Some(self.labels),
        ]
        .into_iter()
        .flatten()
        .map(|(start, len)| start + len)
        .max()
        .unwrap_or(0)
    }
}

/// A reusable shared buffer for one chunk's worth of frames.
pub struct ChunkSlot {
    region: SharedRegion,
    layout: Layout,
    /// Number of frames this slot is sized for (`C`, or the tail size for
    /// the designated remainder slot).
    capacity: usize,
    /// Number of frames actually valid in the current load (`capacity` for
    /// regular chunks, possibly less for a short final chunk).
    length: AtomicUsize,
    height: usize,
    width: usize,
    state: AtomicU8,
    chunk: AtomicU32,
    pub is_remainder: bool,
    pub segment_lock: TaskLock,
    pub extract_lock: TaskLock,
}

impl ChunkSlot {
    pub fn new(capacity: usize, height: usize, width: usize, has_bg: bool, is_remainder: bool) -> Self {
        let layout = Layout::compute(capacity, height, width, has_bg);
        let region = SharedRegion::heap(layout.total_len());
        Self {
            region,
            layout,
            capacity,
            length: AtomicUsize::new(0),
            height,
            width,
            state: AtomicU8::new(SlotState::AwaitingLoad as u8),
            chunk: AtomicU32::new(u32::MAX),
            is_remainder,
            segment_lock: TaskLock::default(),
            extract_lock: TaskLock::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn length(&self) -> usize {
        self.length.load(Ordering::SeqCst)
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        (self.length(), self.height, self.width)
    }

    pub fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, s: SlotState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn chunk(&self) -> Option<u32> {
        let c = self.chunk.load(Ordering::Acquire);
        if c == u32::MAX {
            None
        } else {
            Some(c)
        }
    }

    /// Load frames for `chunk_idx` into this slot: sets `length`, `chunk`,
    /// resets both task-locks, copies `image` (and `image_bg` plus the
    /// derived `image_corr = image - image_bg` as i16, exactly as
    /// `ChunkSlot.load` in the original computes it).
    pub fn load(&self, chunk_idx: u32, length: usize, image: &[u8], image_bg: Option<&[u8]>) -> Result<()> {
        if length > self.capacity {
            return Err(DcnumError::SlotState(format!(
                "chunk {length} frames exceeds slot capacity {}",
                self.capacity
            )));
        }
        let pixels = length * self.height * self.width;
        if image.len() < pixels {
            return Err(DcnumError::SlotState("image buffer shorter than expected".into()));
        }
        unsafe {
            self.region.slice_mut(self.layout.image.0, pixels).copy_from_slice(&image[..pixels]);
        }
        if let (Some(bg_off), Some(image_bg)) = (self.layout.image_bg, image_bg) {
            unsafe {
                self.region
                    .slice_mut(bg_off.0, pixels)
                    .copy_from_slice(&image_bg[..pixels]);
            }
            self.compute_image_corr(length, pixels);
        }
        self.segment_lock.reset(length);
        self.extract_lock.reset(length);
        self.length.store(length, Ordering::SeqCst);
        self.chunk.store(chunk_idx, Ordering::SeqCst);
        self.set_state(SlotState::Loaded);
        Ok(())
    }

    fn compute_image_corr(&self, length: usize, pixels: usize) {
        let (corr_off, _) = match self.layout.image_corr {
            Some(v) => v,
            None => return,
        };
        let (bg_off, _) = self.layout.image_bg.unwrap();
        unsafe {
            let image = self.region.slice(self.layout.image.0, pixels);
            let bg = self.region.slice(bg_off, pixels);
            let corr = self.region.slice_mut(corr_off, pixels * 2);
            for i in 0..pixels {
                let diff = image[i] as i16 - bg[i] as i16;
                let bytes = diff.to_le_bytes();
                corr[i * 2] = bytes[0];
                corr[i * 2 + 1] = bytes[1];
            }
        }
        let _ = length;
    }

    pub fn image(&self) -> &[u8] {
        let (off, len) = self.layout.image;
        unsafe { self.region.slice(off, len.min(self.length() * self.height * self.width)) }
    }

    pub fn image_bg(&self) -> Option<&[u8]> {
        let (off, _) = self.layout.image_bg?;
        let len = self.length() * self.height * self.width;
        Some(unsafe { self.region.slice(off, len) })
    }

    pub fn image_corr(&self) -> Option<&[i16]> {
        let (off, _) = self.layout.image_corr?;
        let n = self.length() * self.height * self.width;
        let bytes = unsafe { self.region.slice(off, n * 2) };
        Some(bytemuck_i16(bytes))
    }

    pub fn mask_mut(&self) -> &mut [u8] {
        let (off, _) = self.layout.mask;
        let len = self.length() * self.height * self.width;
        unsafe { self.region.slice_mut(off, len) }
    }

    pub fn labels_mut(&self) -> &mut [u16] {
        let (off, _) = self.layout.labels;
        let n = self.length() * self.height * self.width;
        let bytes = unsafe { self.region.slice_mut(off, n * 2) };
        bytemuck_u16_mut(bytes)
    }

    pub fn labels(&self) -> &[u16] {
        let (off, _) = self.layout.labels;
        let n = self.length() * self.height * self.width;
        let bytes = unsafe { self.region.slice(off, n * 2) };
        bytemuck_u16(bytes)
    }
}

fn bytemuck_i16(bytes: &[u8]) -> &[i16] {
    unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const i16, bytes.len() / 2) }
}

fn bytemuck_u16(bytes: &[u8]) -> &[u16] {
    unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const u16, bytes.len() / 2) }
}

fn bytemuck_u16_mut(bytes: &mut [u8]) -> &mut [u16] {
    unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut u16, bytes.len() / 2) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_computes_corrected_image() {
        let slot = ChunkSlot::new(2, 1, 2, true, false);
        let image = vec![100u8, 150, 120, 130];
        let bg = vec![90u8, 140, 100, 140];
        slot.load(0, 2, &image, Some(&bg)).unwrap();
        let corr = slot.image_corr().unwrap();
        assert_eq!(corr, &[10, 10, 20, -10]);
    }

    #[test]
    fn task_lock_issues_disjoint_ranges() {
        let lock = TaskLock::default();
        lock.reset(10);
        let (s1, e1) = lock.acquire(4);
        let (s2, e2) = lock.acquire(4);
        let (s3, e3) = lock.acquire(4);
        assert_eq!((s1, e1), (0, 4));
        assert_eq!((s2, e2), (4, 8));
        assert_eq!((s3, e3), (8, 10));
        assert!(!lock.all_done());
        lock.release_done(0, 4);
        lock.release_done(4, 8);
        lock.release_done(8, 10);
        assert!(lock.all_done());
    }

    #[test]
    fn failed_batch_can_be_reacquired() {
        let lock = TaskLock::default();
        lock.reset(4);
        let (s, e) = lock.acquire(4);
        assert_eq!((s, e), (0, 4));
        lock.release_failed(s, e);
        let (s2, e2) = lock.acquire(4);
        assert_eq!((s2, e2), (0, 4));
    }

    #[test]
    fn state_round_trips_through_letters() {
        assert_eq!(SlotState::AwaitingLoad.letter(), 'i');
        assert_eq!(SlotState::Loaded.letter(), 's');
        assert_eq!(SlotState::Written.letter(), 'w');
        assert_eq!(SlotState::Done.letter(), 'd');
    }
}
