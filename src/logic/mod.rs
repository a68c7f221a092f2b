//! The pipeline runtime core: shared chunk slots, the slot register, the
//! RAII state guard, the uniform stage-worker loop, the pluggable-stage
//! registry, and the job orchestrator.

pub mod chunk_slot;
pub mod job_runner;
pub mod registry;
pub mod slot_register;
pub mod stage_worker;
pub mod state_warden;

pub use chunk_slot::{ChunkSlot, SlotState};
pub use job_runner::{JobReport, JobRunner};
pub use registry::Registry;
pub use slot_register::SlotRegister;
pub use stage_worker::{spawn_process, spawn_thread, run_worker, WorkerContext};
pub use state_warden::StateWarden;

use std::sync::atomic::{AtomicU8, Ordering};

/// Global run state, observed by every blocking point in the worker loop
/// within a bounded number of milliseconds so a shutdown request never
/// stalls behind a long-running slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused,
    Quitting,
}

impl RunState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => RunState::Paused,
            2 => RunState::Quitting,
            _ => RunState::Running,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            RunState::Running => 0,
            RunState::Paused => 1,
            RunState::Quitting => 2,
        }
    }
}

/// Shared global state word: single writer (the orchestrator), many readers
/// (every worker and the collector).
#[derive(Debug, Default)]
pub struct GlobalState(AtomicU8);

impl GlobalState {
    pub fn new() -> Self {
        Self(AtomicU8::new(RunState::Running.to_u8()))
    }

    pub fn get(&self) -> RunState {
        RunState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: RunState) {
        self.0.store(state.to_u8(), Ordering::Release);
    }

    pub fn is_quitting(&self) -> bool {
        self.get() == RunState::Quitting
    }
}
