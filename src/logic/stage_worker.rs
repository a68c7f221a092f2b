//! `StageWorker`: one pure loop body, two launchers. Grounded in
//! `original_source/src/dcnum/logic/ctrl.py`'s worker loop shape, reworked
//! for worker polymorphism: the loop itself is synchronous (shared memory,
//! not async I/O) and is launched either as a native OS thread or as a
//! child process of the same binary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::data::input::InputData;
use crate::data::{EventData, FrameIndex, ImageBatch, TypedArray};
use crate::error::Result;
use crate::feat::FeatureExtractor;
use crate::gate::Gate;
use crate::logic::chunk_slot::SlotState;
use crate::logic::slot_register::SlotRegister;
use crate::logic::state_warden::Stage;
use crate::logic::RunState;
use crate::segm::Segmenter;
use crate::shared::NEventsTable;

pub struct WorkerContext {
    pub registers: Arc<SlotRegister>,
    pub input: Arc<dyn InputData>,
    pub segmenter: Arc<dyn Segmenter>,
    pub extractor: Arc<dyn FeatureExtractor>,
    pub gate: Arc<dyn Gate>,
    pub nevents: Arc<NEventsTable>,
    pub events_tx: mpsc::Sender<(FrameIndex, EventData)>,
    pub write_queue_size: Arc<AtomicU64>,
    pub backpressure_high: u64,
    pub backpressure_low: u64,
    /// Max frames reserved per task-lock acquisition; `None` reserves a
    /// whole slot at once.
    pub batch_size: Option<usize>,
}

/// The uniform loop body: `while state != q { ... }`. Returns once the
/// global state is `Quitting`.
pub fn run_worker(ctx: &WorkerContext) -> Result<()> {
    loop {
        match ctx.registers.global().get() {
            RunState::Quitting => return Ok(()),
            RunState::Paused => {
                std::thread::sleep(Duration::from_millis(500));
                continue;
            }
            RunState::Running => {}
        }

        let mut did = ctx.registers.task_load_all(ctx.input.as_ref())?;
        did |= try_segment(ctx)?;
        did |= try_extract(ctx)?;

        if !did {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

fn try_segment(ctx: &WorkerContext) -> Result<bool> {
    let warden = match ctx.registers.reserve_slot_for_task(
        SlotState::Loaded,
        Stage::Segment,
        None,
        ctx.batch_size,
    ) {
        Some(w) => w,
        None => return Ok(false),
    };
    let (start, stop) = warden.range();
    let slot = warden.slot();
    let (_, h, w) = slot.shape();
    let n = stop - start;
    let per_frame = h * w;

    let samples: Vec<i16> = match slot.image_corr() {
        Some(corr) => corr[start * per_frame..stop * per_frame].to_vec(),
        None => slot.image()[start * per_frame..stop * per_frame]
            .iter()
            .map(|&b| b as i16)
            .collect(),
    };
    let batch = ImageBatch::from_slice(&samples, n, h, w);

    match ctx.segmenter.segment_batch(&batch) {
        Ok(labels) => {
            let flat = labels
                .data
                .as_slice()
                .expect("label batch must be contiguous");
            slot.labels_mut()[start * per_frame..stop * per_frame].copy_from_slice(flat);
            Ok(true)
        }
        Err(e) => {
            let msg = e.to_string();
            warden.fail(&msg);
            Err(e)
        }
    }
}

fn try_extract(ctx: &WorkerContext) -> Result<bool> {
    let warden = match ctx.registers.reserve_slot_for_task(
        SlotState::Segmented,
        Stage::Extract,
        None,
        ctx.batch_size,
    ) {
        Some(w) => w,
        None => return Ok(false),
    };

    wait_for_backpressure(ctx);

    let (start, stop) = warden.range();
    let slot = warden.slot();
    let (_, h, w) = slot.shape();
    let per_frame = h * w;
    let chunk = slot.chunk().expect("reserved slot must be assigned a chunk");
    let chunk_size = ctx.registers.chunk_size() as u64;

    for local in start..stop {
        let abs_frame = chunk as u64 * chunk_size + local as u64;

        let image_raw: Vec<i16> = match slot.image_corr() {
            Some(corr) => corr[local * per_frame..(local + 1) * per_frame].to_vec(),
            None => slot.image()[local * per_frame..(local + 1) * per_frame]
                .iter()
                .map(|&b| b as i16)
                .collect(),
        };
        let images = ImageBatch::from_slice(&image_raw, 1, h, w);

        let mut labels = crate::data::LabelBatch::zeros(1, h, w);
        labels
            .frame_mut(0)
            .assign(&ndarray::ArrayView2::from_shape(
                (h, w),
                &slot.labels()[local * per_frame..(local + 1) * per_frame],
            )
            .expect("label frame must reshape cleanly"));

        let raw_events = match ctx.extractor.extract(&labels, &images) {
            Ok(events) => events,
            Err(e) => {
                warden.fail(&e.to_string());
                return Err(e);
            }
        };

        let total = raw_events.len();
        let accepted: Vec<EventData> = raw_events.into_iter().filter(|e| ctx.gate.accept(e)).collect();
        let dropped = (total - accepted.len()) as u64;
        if dropped > 0 {
            ctx.registers.record_masks_dropped(dropped);
            warn!(dropped, frame = abs_frame, "gate rejected events");
        }

        ctx.nevents.set(abs_frame as usize, accepted.len() as i64);

        let merged = merge_events(accepted);
        if let Err(e) = ctx.events_tx.blocking_send((abs_frame, merged)) {
            error!(frame = abs_frame, "event channel closed: {e}");
            warden.fail("event channel closed");
            return Ok(true);
        }
    }

    debug!(chunk, start, stop, "extracted batch");
    Ok(true)
}

fn wait_for_backpressure(ctx: &WorkerContext) {
    loop {
        let size = ctx.write_queue_size.load(Ordering::Acquire);
        if size <= ctx.backpressure_high {
            return;
        }
        if ctx.registers.global().is_quitting() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
        if ctx.write_queue_size.load(Ordering::Acquire) < ctx.backpressure_low {
            return;
        }
    }
}

/// Combines the per-label events produced for one frame into a single
/// events-dict whose arrays have outer length equal to the event count,
/// preserving the extractor's intra-frame order.
fn merge_events(events: Vec<EventData>) -> EventData {
    let mut merged = EventData::new();
    for ev in events {
        for (feat, value) in ev {
            match merged.get_mut(&feat) {
                Some(existing) => existing.append(&value).expect("extractor produced consistent dtypes"),
                None => {
                    merged.insert(feat, value);
                }
            }
        }
    }
    merged
}

/// Launches `run_worker` on a dedicated OS thread.
pub fn spawn_thread(ctx: WorkerContext) -> std::thread::JoinHandle<Result<()>> {
    std::thread::Builder::new()
        .name("dcnum-worker".into())
        .spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| run_worker(&ctx)));
            match result {
                Ok(r) => r,
                Err(_) => Err(crate::error::DcnumError::WorkerFatal(
                    "worker thread panicked".into(),
                )),
            }
        })
        .expect("failed to spawn worker thread")
}

/// Launches a worker as a child process running this same binary with the
/// hidden `--worker-slave` subcommand, which attaches to the named shared
/// memory region rather than receiving `WorkerContext` directly (trait
/// objects and channels don't cross a process boundary). The parent's
/// `WorkerContext` is used only to describe what the child should attach to.
pub fn spawn_process(shared_region_path: &std::path::Path) -> std::io::Result<std::process::Child> {
    let exe = std::env::current_exe()?;
    std::process::Command::new(exe)
        .arg("--worker-slave")
        .arg(shared_region_path)
        .spawn()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_events_concatenates_in_order() {
        let mut a = EventData::new();
        a.insert(
            "area_um".to_string(),
            TypedArray::F64 {
                data: vec![1.0],
                shape: vec![1],
            },
        );
        let mut b = EventData::new();
        b.insert(
            "area_um".to_string(),
            TypedArray::F64 {
                data: vec![2.0],
                shape: vec![1],
            },
        );
        let merged = merge_events(vec![a, b]);
        match &merged["area_um"] {
            TypedArray::F64 { data, .. } => assert_eq!(data, &[1.0, 2.0]),
            _ => panic!("wrong dtype"),
        }
    }
}
