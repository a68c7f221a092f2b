//! Output side of the pipeline: the per-window sorter, the ordering
//! collector task, and the chunked container writer.

pub mod event_stash;
pub mod queue_collector;
pub mod writer;

pub use event_stash::EventStash;
pub use queue_collector::{CollectorStats, QueueCollector, WriterMessage};
pub use writer::{create_with_basins, read_feature, read_header, ChunkWriter, FileChunkWriter, FinalAttributes};
