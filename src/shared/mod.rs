//! Shared memory regions backing `ChunkSlot` buffers, and the lock-free
//! per-frame event-count table.

pub mod nevents;
pub mod region;

pub use nevents::NEventsTable;
pub use region::SharedRegion;
