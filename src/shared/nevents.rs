//! `NEventsTable`: `feat_nevents` shared across every extractor and the
//! collector without a lock. `-1` means "not yet known"; once a slot is set
//! it is never written to again, so plain atomic loads/stores are enough.

use std::sync::atomic::{AtomicI64, Ordering};

pub struct NEventsTable {
    values: Vec<AtomicI64>,
}

impl NEventsTable {
    pub fn new(num_frames: usize) -> Self {
        Self {
            values: (0..num_frames).map(|_| AtomicI64::new(-1)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, frame: usize) -> i64 {
        self.values[frame].load(Ordering::Acquire)
    }

    /// Records the event count for `frame`. Written exactly once per frame
    /// by the extractor that owns it.
    pub fn set(&self, frame: usize, count: i64) {
        self.values[frame].store(count, Ordering::Release);
    }

    /// `feat_nevents[start..end]` as a plain `Vec`, for windowing by the
    /// collector.
    pub fn window(&self, start: usize, end: usize) -> Vec<i64> {
        let end = end.min(self.values.len());
        if start >= end {
            return Vec::new();
        }
        self.values[start..end]
            .iter()
            .map(|v| v.load(Ordering::Acquire))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_frames_report_negative_one() {
        let t = NEventsTable::new(4);
        assert_eq!(t.get(2), -1);
        t.set(2, 3);
        assert_eq!(t.get(2), 3);
    }

    #[test]
    fn window_clamps_to_table_length() {
        let t = NEventsTable::new(3);
        t.set(0, 1);
        t.set(1, 2);
        assert_eq!(t.window(0, 10), vec![1, 2, -1]);
    }
}
