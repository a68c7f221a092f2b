//! Pipeline identifier (PPID) construction and parsing.

pub mod ppid;

pub use ppid::{PipelineId, SubId};
