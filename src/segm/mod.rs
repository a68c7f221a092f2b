//! Pluggable segmentation: turns a batch of (corrected) images into a batch
//! of integer label masks. Mirrors the narrow trait shape used for
//! `BackgroundComputer`/`FeatureExtractor`/`Gate`, replacing the original's
//! subclass-enumeration registry (`original_source/dcnum/segm/segmenter.py`)
//! with one boxed trait object per registered code.

pub mod legacy;

use crate::data::{ImageBatch, LabelBatch};
use crate::error::Result;

pub trait Segmenter: Send + Sync {
    fn ppid_code(&self) -> &'static str;
    fn segment_batch(&self, images: &ImageBatch) -> Result<LabelBatch>;
}

pub use legacy::LegacyThresholdSegmenter;
