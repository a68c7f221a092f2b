//! `EventStash`: per-write-window sorter. Owns dense output arrays sized for
//! the window, filled in as out-of-order `(frame_index, events)` messages
//! arrive from extractors, and reports completion once every frame in the
//! window has reported in (including frames that contributed zero events).

use std::collections::HashMap;

use crate::data::{EventData, FrameIndex, TypedArray};
use crate::error::{DcnumError, Result};

pub struct EventStash {
    index_offset: u64,
    nev_idx: Vec<usize>,
    size: usize,
    events: HashMap<String, TypedArray>,
    indices_for_data: Vec<u32>,
    done: Vec<bool>,
    done_count: usize,
}

impl EventStash {
    /// `feat_nevents` is the window `[index_offset, index_offset+K)`; `-1`
    /// entries are not allowed here, the caller must wait until every
    /// count in the window is known before constructing a stash.
    pub fn new(index_offset: u64, feat_nevents: &[i64]) -> Self {
        let mut nev_idx = Vec::with_capacity(feat_nevents.len());
        let mut running = 0usize;
        for &n in feat_nevents {
            running += n.max(0) as usize;
            nev_idx.push(running);
        }
        let size = running;
        Self {
            index_offset,
            nev_idx,
            size,
            events: HashMap::new(),
            indices_for_data: vec![0u32; size],
            done: vec![false; feat_nevents.len()],
            done_count: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn num_frames(&self) -> usize {
        self.done.len()
    }

    /// Lazily allocates the dense output array for `name` from the dtype and
    /// per-event shape of `sample`, the first event this run has seen for
    /// that feature.
    pub fn require_feature(&mut self, name: &str, sample: &TypedArray) -> &mut TypedArray {
        self.events
            .entry(name.to_string())
            .or_insert_with(|| sample.zeros_like(self.size))
    }

    /// Places one frame's events into the window. Errors if `frame_index`
    /// falls outside the window or has already been recorded.
    pub fn add_events(&mut self, frame_index: FrameIndex, events: &EventData) -> Result<()> {
        if frame_index < self.index_offset {
            return Err(DcnumError::Data(format!(
                "frame {frame_index} is before this window's offset {}",
                self.index_offset
            )));
        }
        let loc = (frame_index - self.index_offset) as usize;
        if loc >= self.done.len() {
            return Err(DcnumError::Data(format!(
                "frame {frame_index} falls outside this window"
            )));
        }
        if self.done[loc] {
            return Err(DcnumError::Data(format!(
                "frame {frame_index} was already recorded in this window"
            )));
        }

        let stop = self.nev_idx[loc];
        let start = if loc == 0 { 0 } else { self.nev_idx[loc - 1] };
        let n = stop - start;

        for (feat, sample) in events {
            let per_event = sample.per_event_len();
            let dense = self.require_feature(feat, sample);
            for i in 0..n {
                dense.place_event(start + i, sample, i, per_event);
            }
        }
        for idx in &mut self.indices_for_data[start..stop] {
            *idx = (self.index_offset + loc as u64) as u32;
        }

        self.done[loc] = true;
        self.done_count += 1;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.done_count == self.done.len()
    }

    /// Consumes the stash, returning the ordered feature arrays and the
    /// per-event frame index map, ready to be handed to the writer.
    pub fn into_parts(self) -> (HashMap<String, TypedArray>, Vec<u32>) {
        (self.events, self.indices_for_data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar_event(v: f64) -> EventData {
        let mut ev = EventData::new();
        ev.insert(
            "area_um".to_string(),
            TypedArray::F64 {
                data: vec![v],
                shape: vec![1],
            },
        );
        ev
    }

    #[test]
    fn completes_once_every_frame_in_window_reports() {
        let mut stash = EventStash::new(10, &[1, 0, 2]);
        assert_eq!(stash.size(), 3);
        stash.add_events(10, &scalar_event(1.0)).unwrap();
        assert!(!stash.is_complete());
        stash.add_events(11, &EventData::new()).unwrap();
        assert!(!stash.is_complete());

        let mut two = EventData::new();
        two.insert(
            "area_um".to_string(),
            TypedArray::F64 {
                data: vec![2.0, 3.0],
                shape: vec![2],
            },
        );
        stash.add_events(12, &two).unwrap();
        assert!(stash.is_complete());

        let (events, indices) = stash.into_parts();
        match &events["area_um"] {
            TypedArray::F64 { data, .. } => assert_eq!(data, &[1.0, 2.0, 3.0]),
            _ => panic!("wrong dtype"),
        }
        assert_eq!(indices, vec![10, 12, 12]);
    }

    #[test]
    fn rejects_duplicate_frame() {
        let mut stash = EventStash::new(0, &[1]);
        stash.add_events(0, &scalar_event(1.0)).unwrap();
        assert!(stash.add_events(0, &scalar_event(2.0)).is_err());
    }

    #[test]
    fn rejects_frame_outside_window() {
        let mut stash = EventStash::new(5, &[1, 1]);
        assert!(stash.add_events(20, &scalar_event(1.0)).is_err());
    }
}
