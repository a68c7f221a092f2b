//! `QueueCollector`: the long-running task that turns the unordered event
//! channel into ordered, per-window writer messages. Shaped like the
//! teacher's `writer_loop` (`src/storage/global_writer.rs`): a single
//! consumer task draining one channel and publishing structured blocks
//! onward, generalized from "one append per segment" to "one `EventStash`
//! per write-window".

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::data::{EventData, FrameIndex, TypedArray};
use crate::error::Result;
use crate::logic::SlotRegister;
use crate::shared::NEventsTable;
use crate::write::event_stash::EventStash;

/// One message destined for the `ChunkWriter`.
pub enum WriterMessage {
    Feature(String, TypedArray),
    Finished,
}

pub struct QueueCollector {
    write_threshold: usize,
    nevents: Arc<NEventsTable>,
    events_rx: mpsc::Receiver<(FrameIndex, EventData)>,
    writer_tx: mpsc::Sender<WriterMessage>,
    write_queue_size: Arc<std::sync::atomic::AtomicU64>,
    slot_register: Arc<SlotRegister>,
}

pub struct CollectorStats {
    pub written_events: u64,
    pub written_frames: u64,
}

impl QueueCollector {
    pub fn new(
        write_threshold: usize,
        nevents: Arc<NEventsTable>,
        events_rx: mpsc::Receiver<(FrameIndex, EventData)>,
        writer_tx: mpsc::Sender<WriterMessage>,
        write_queue_size: Arc<std::sync::atomic::AtomicU64>,
        slot_register: Arc<SlotRegister>,
    ) -> Self {
        Self {
            write_threshold,
            nevents,
            events_rx,
            writer_tx,
            write_queue_size,
            slot_register,
        }
    }

    /// Runs until `feat_nevents` is exhausted (an empty window), then
    /// returns final counts. Cancel-safe only at window boundaries, which is
    /// sufficient since the caller joins this task as part of orderly
    /// shutdown, never a forced abort.
    pub async fn run(mut self) -> Result<CollectorStats> {
        let mut buffer_dq: VecDeque<(FrameIndex, EventData)> = VecDeque::new();
        let mut last: usize = 0;
        let mut written_events: u64 = 0;
        let mut written_frames: u64 = 0;
        let w = self.write_threshold;

        loop {
            let window = self.nevents.window(last, last + w);
            if window.iter().any(|&n| n < 0) {
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
            if window.is_empty() {
                break;
            }

            let mut stash = EventStash::new(last as u64, &window);

            let mut still_buffered = VecDeque::new();
            while let Some((idx, ev)) = buffer_dq.pop_front() {
                if in_window(idx, last, window.len()) {
                    stash.add_events(idx, &ev)?;
                } else {
                    still_buffered.push_back((idx, ev));
                }
            }
            buffer_dq = still_buffered;

            while !stash.is_complete() {
                match tokio::time::timeout(Duration::from_millis(300), self.events_rx.recv())
                    .await
                {
                    Ok(Some((idx, ev))) => {
                        if in_window(idx, last, window.len()) {
                            stash.add_events(idx, &ev)?;
                        } else {
                            buffer_dq.push_back((idx, ev));
                        }
                    }
                    Ok(None) => {
                        // channel closed with the window incomplete: treat
                        // remaining unreported frames as zero-event frames
                        // so the collector can finish rather than hang.
                        break;
                    }
                    Err(_elapsed) => continue,
                }
            }

            let size = stash.size();
            let num_frames = stash.num_frames();
            let (events, indices_for_data) = stash.into_parts();
            for (feat, arr) in events {
                self.writer_tx
                    .send(WriterMessage::Feature(feat, arr))
                    .await
                    .ok();
            }
            let per_event_nevents: Vec<i16> = indices_for_data
                .iter()
                .map(|&idx| window[idx as usize - last] as i16)
                .collect();

            self.writer_tx
                .send(WriterMessage::Feature(
                    "index_unmapped".to_string(),
                    TypedArray::U32 {
                        data: indices_for_data.clone(),
                        shape: vec![indices_for_data.len()],
                    },
                ))
                .await
                .ok();
            self.writer_tx
                .send(WriterMessage::Feature(
                    "nevents".to_string(),
                    TypedArray::I16 {
                        data: per_event_nevents,
                        shape: vec![indices_for_data.len()],
                    },
                ))
                .await
                .ok();

            written_events += size as u64;
            written_frames += num_frames as u64;
            self.slot_register
                .reclaim_written(last as u64, window.len() as u64);
            last += window.len();

            self.write_queue_size
                .store(written_events, std::sync::atomic::Ordering::Release);
            debug!(written_events, written_frames, last, "flushed write window");
        }

        self.writer_tx.send(WriterMessage::Finished).await.ok();
        Ok(CollectorStats {
            written_events,
            written_frames,
        })
    }
}

fn in_window(idx: FrameIndex, start: usize, len: usize) -> bool {
    let idx = idx as usize;
    idx >= start && idx < start + len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::input::MemoryInputData;

    #[tokio::test]
    async fn drains_events_in_window_order_despite_arrival_order() {
        let nevents = Arc::new(NEventsTable::new(3));
        nevents.set(0, 1);
        nevents.set(1, 1);
        nevents.set(2, 1);
        let (events_tx, events_rx) = mpsc::channel(8);
        let (writer_tx, mut writer_rx) = mpsc::channel(16);
        let write_queue_size = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let images: Vec<_> = (0..3u8).map(|v| vec![v]).collect();
        let input = MemoryInputData::new(images, 3, 1, 1);
        let registers = Arc::new(SlotRegister::new(&input, 1, 1, 1).unwrap());

        let collector =
            QueueCollector::new(3, nevents, events_rx, writer_tx, write_queue_size, registers);
        let handle = tokio::spawn(collector.run());

        let mut ev = |v: f64| {
            let mut e = EventData::new();
            e.insert(
                "area_um".to_string(),
                TypedArray::F64 {
                    data: vec![v],
                    shape: vec![1],
                },
            );
            e
        };
        // send out of order: 2, 0, 1
        events_tx.send((2, ev(2.0))).await.unwrap();
        events_tx.send((0, ev(0.0))).await.unwrap();
        events_tx.send((1, ev(1.0))).await.unwrap();
        drop(events_tx);

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.written_events, 3);
        assert_eq!(stats.written_frames, 3);

        let mut got_area = None;
        while let Some(msg) = writer_rx.recv().await {
            if let WriterMessage::Feature(name, TypedArray::F64 { data, .. }) = msg {
                if name == "area_um" {
                    got_area = Some(data);
                }
            }
        }
        assert_eq!(got_area, Some(vec![0.0, 1.0, 2.0]));
    }

    #[tokio::test]
    async fn multi_event_frames_get_per_event_indices_and_nevents() {
        // frame 0: 1 event, frame 1: 0 events, frame 2: 2 events, frame 3: 1 event
        let nevents = Arc::new(NEventsTable::new(4));
        nevents.set(0, 1);
        nevents.set(1, 0);
        nevents.set(2, 2);
        nevents.set(3, 1);
        let (events_tx, events_rx) = mpsc::channel(8);
        let (writer_tx, mut writer_rx) = mpsc::channel(16);
        let write_queue_size = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let images: Vec<_> = (0..4u8).map(|v| vec![v]).collect();
        let input = MemoryInputData::new(images, 4, 1, 1);
        let registers = Arc::new(SlotRegister::new(&input, 1, 1, 1).unwrap());

        let collector =
            QueueCollector::new(4, nevents, events_rx, writer_tx, write_queue_size, registers);
        let handle = tokio::spawn(collector.run());

        let ev = |vals: &[f64]| {
            let mut e = EventData::new();
            e.insert(
                "area_um".to_string(),
                TypedArray::F64 {
                    data: vals.to_vec(),
                    shape: vec![vals.len()],
                },
            );
            e
        };
        events_tx.send((0, ev(&[0.0]))).await.unwrap();
        events_tx.send((1, EventData::new())).await.unwrap();
        events_tx.send((2, ev(&[2.0, 3.0]))).await.unwrap();
        events_tx.send((3, ev(&[4.0]))).await.unwrap();
        drop(events_tx);

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.written_events, 4);
        assert_eq!(stats.written_frames, 4);

        let mut got_area = None;
        let mut got_index = None;
        let mut got_nevents = None;
        while let Some(msg) = writer_rx.recv().await {
            match msg {
                WriterMessage::Feature(name, TypedArray::F64 { data, .. }) if name == "area_um" => {
                    got_area = Some(data);
                }
                WriterMessage::Feature(name, TypedArray::U32 { data, .. })
                    if name == "index_unmapped" =>
                {
                    got_index = Some(data);
                }
                WriterMessage::Feature(name, TypedArray::I16 { data, .. }) if name == "nevents" => {
                    got_nevents = Some(data);
                }
                _ => {}
            }
        }
        assert_eq!(got_area, Some(vec![0.0, 2.0, 3.0, 4.0]));
        assert_eq!(got_index, Some(vec![0, 2, 2, 3]));
        assert_eq!(got_nevents, Some(vec![1, 2, 2, 1]));
    }
}
