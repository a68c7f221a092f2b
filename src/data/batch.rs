//! Per-batch image and label views handed across the segmenter/extractor
//! boundary. A batch is always one contiguous frame range reserved from a
//! single `ChunkSlot` by a `StateWarden`; `ndarray` gives the pluggable-stage
//! implementations 2-D per-frame views without copying.

use ndarray::{Array3, ArrayView2};

/// `n` frames of corrected (or raw, if no background) pixel data, `height` by
/// `width` each, row-major.
#[derive(Debug, Clone)]
pub struct ImageBatch {
    pub data: Array3<i16>,
}

impl ImageBatch {
    pub fn from_slice(frames: &[i16], n: usize, height: usize, width: usize) -> Self {
        let arr = Array3::from_shape_vec((n, height, width), frames.to_vec())
            .expect("frame buffer length must match n*height*width");
        Self { data: arr }
    }

    pub fn len(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn frame(&self, i: usize) -> ArrayView2<'_, i16> {
        self.data.index_axis(ndarray::Axis(0), i)
    }
}

/// `n` label masks, one `u16` per pixel, `0` reserved for background.
#[derive(Debug, Clone)]
pub struct LabelBatch {
    pub data: Array3<u16>,
}

impl LabelBatch {
    pub fn zeros(n: usize, height: usize, width: usize) -> Self {
        Self {
            data: Array3::zeros((n, height, width)),
        }
    }

    pub fn len(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn frame(&self, i: usize) -> ArrayView2<'_, u16> {
        self.data.index_axis(ndarray::Axis(0), i)
    }

    pub fn frame_mut(&mut self, i: usize) -> ndarray::ArrayViewMut2<'_, u16> {
        self.data.index_axis_mut(ndarray::Axis(0), i)
    }

    /// Highest label value present in frame `i`, or 0 if the frame is empty.
    pub fn max_label(&self, i: usize) -> u16 {
        self.frame(i).iter().copied().max().unwrap_or(0)
    }
}
