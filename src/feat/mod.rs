//! Pluggable background computation and feature extraction. Mirrors the
//! narrow-trait treatment given to `Segmenter`/`Gate`.

pub mod background;
pub mod moments;

use crate::data::{EventData, ImageBatch, LabelBatch};
use crate::data::input::InputData;
use crate::error::Result;
use crate::write::writer::ChunkWriter;

pub trait BackgroundComputer: Send + Sync {
    fn ppid_code(&self) -> &'static str;
    fn compute(&self, input: &dyn InputData, out: &mut dyn ChunkWriter) -> Result<()>;
}

pub trait FeatureExtractor: Send + Sync {
    fn ppid_code(&self) -> &'static str;
    fn extract(&self, labels: &LabelBatch, images: &ImageBatch) -> Result<Vec<EventData>>;
}

pub use background::SparseMedianBackground;
pub use moments::LegacyMomentsExtractor;
