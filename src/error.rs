use thiserror::Error;

/// Error taxonomy for the pipeline runtime, matching the policy table in the
/// design: each variant has a fixed handling policy (fail fast, retry, drop
/// the event, etc.) enforced by its caller, not by this type.
#[derive(Debug, Error)]
pub enum DcnumError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Input error: {0}")]
    Input(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Slot state error: {0}")]
    SlotState(String),

    #[error("Timed out waiting for the event queue")]
    QueueTimeout,

    #[error("Worker failed: {0}")]
    WorkerFatal(String),

    #[error("Worker join error: {0}")]
    Join(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Pipeline identifier error: {0}")]
    Ppid(String),
}

pub type Result<T> = std::result::Result<T, DcnumError>;
