//! Data model shared across the pipeline: typed feature arrays, event
//! payloads, and the `InputData` reading interface.

pub mod batch;
pub mod input;
pub mod typed_array;

pub use batch::{ImageBatch, LabelBatch};
pub use input::{BasinPath, BasinRef, InputData, Metadata, RawStreamInputData, StoredIdentifiers};
pub use typed_array::{DType, EventData, TypedArray};

/// Frame index within the full input stream.
pub type FrameIndex = u64;

/// Chunk index within the full input stream.
pub type ChunkIndex = usize;
