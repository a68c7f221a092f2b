//! Threshold + fill-holes + connected-component labeling, grounded in
//! `original_source/dcnum/segm/segmenter.py`'s `process_mask`/`segment_frame`
//! shape. The original uses `cv2`/`scipy.ndimage`/`skimage.morphology`; this
//! implementation uses `imageproc`'s connected-component labeling plus a
//! hand-rolled border flood fill for hole filling, since OpenCV/scikit-image
//! have no idiomatic Rust equivalent in this ecosystem.

use image::{GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};
use ndarray::Array2;

use crate::data::{ImageBatch, LabelBatch};
use crate::error::Result;
use crate::segm::Segmenter;

/// Pixels darker than `threshold` below the image's own mean are foreground
/// (cells show up darker than background once the background is
/// subtracted), mirroring the legacy approach's "thresh" keyword.
#[derive(Debug, Clone, Copy)]
pub struct LegacyThresholdSegmenter {
    pub threshold: i16,
}

impl Default for LegacyThresholdSegmenter {
    fn default() -> Self {
        Self { threshold: -6 }
    }
}

impl LegacyThresholdSegmenter {
    pub fn new(threshold: i16) -> Self {
        Self { threshold }
    }

    fn threshold_frame(&self, frame: ndarray::ArrayView2<'_, i16>) -> Array2<bool> {
        frame.mapv(|v| v <= self.threshold)
    }

    /// Flood-fills background from the border; any `false` pixel not
    /// reached by the flood fill is an enclosed hole and gets set `true`.
    fn fill_holes(&self, mask: &Array2<bool>) -> Array2<bool> {
        let (h, w) = (mask.nrows(), mask.ncols());
        let mut reached = Array2::from_elem((h, w), false);
        let mut stack = Vec::new();
        for x in 0..w {
            for &y in &[0, h.saturating_sub(1)] {
                if !mask[[y, x]] && !reached[[y, x]] {
                    reached[[y, x]] = true;
                    stack.push((y, x));
                }
            }
        }
        for y in 0..h {
            for &x in &[0, w.saturating_sub(1)] {
                if !mask[[y, x]] && !reached[[y, x]] {
                    reached[[y, x]] = true;
                    stack.push((y, x));
                }
            }
        }
        while let Some((y, x)) = stack.pop() {
            let neighbors = [
                (y.wrapping_sub(1), x),
                (y + 1, x),
                (y, x.wrapping_sub(1)),
                (y, x + 1),
            ];
            for (ny, nx) in neighbors {
                if ny < h && nx < w && !mask[[ny, nx]] && !reached[[ny, nx]] {
                    reached[[ny, nx]] = true;
                    stack.push((ny, nx));
                }
            }
        }
        let mut filled = mask.clone();
        for y in 0..h {
            for x in 0..w {
                if !mask[[y, x]] && !reached[[y, x]] {
                    filled[[y, x]] = true;
                }
            }
        }
        filled
    }
}

impl Segmenter for LegacyThresholdSegmenter {
    fn ppid_code(&self) -> &'static str {
        "legacy"
    }

    fn segment_batch(&self, images: &ImageBatch) -> Result<LabelBatch> {
        let n = images.len();
        let shape = images.data.shape();
        let (height, width) = (shape[1], shape[2]);
        let mut labels = LabelBatch::zeros(n, height, width);

        for i in 0..n {
            let frame = images.frame(i);
            let binary = self.fill_holes(&self.threshold_frame(frame));

            let mut gray = GrayImage::new(width as u32, height as u32);
            for y in 0..height {
                for x in 0..width {
                    let v = if binary[[y, x]] { 255u8 } else { 0u8 };
                    gray.put_pixel(x as u32, y as u32, Luma([v]));
                }
            }
            let cc = connected_components(&gray, Connectivity::Eight, Luma([0u8]));

            let mut out = labels.frame_mut(i);
            for y in 0..height {
                for x in 0..width {
                    let label = cc.get_pixel(x as u32, y as u32).0[0];
                    out[[y, x]] = label.min(u16::MAX as u32) as u16;
                }
            }
        }
        Ok(labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolated_dark_blob_gets_one_label() {
        // 5x5 frame, all background (0) except a 2x2 dark blob.
        let mut data = vec![0i16; 25];
        for &(y, x) in &[(1, 1), (1, 2), (2, 1), (2, 2)] {
            data[y * 5 + x] = -10;
        }
        let batch = ImageBatch::from_slice(&data, 1, 5, 5);
        let segmenter = LegacyThresholdSegmenter::default();
        let labels = segmenter.segment_batch(&batch).unwrap();
        assert_eq!(labels.max_label(0), 1);
        assert_eq!(labels.frame(0)[[1, 1]], 1);
        assert_eq!(labels.frame(0)[[0, 0]], 0);
    }

    #[test]
    fn empty_frame_has_no_labels() {
        let data = vec![0i16; 16];
        let batch = ImageBatch::from_slice(&data, 1, 4, 4);
        let segmenter = LegacyThresholdSegmenter::default();
        let labels = segmenter.segment_batch(&batch).unwrap();
        assert_eq!(labels.max_label(0), 0);
    }

    #[test]
    fn fill_holes_closes_enclosed_background_pixel() {
        let segmenter = LegacyThresholdSegmenter::default();
        // 5x5 ring of foreground with one background pixel enclosed.
        let mut mask = Array2::from_elem((5, 5), false);
        for y in 1..4 {
            for x in 1..4 {
                mask[[y, x]] = true;
            }
        }
        mask[[2, 2]] = false; // hole
        let filled = segmenter.fill_holes(&mask);
        assert!(filled[[2, 2]]);
    }
}
