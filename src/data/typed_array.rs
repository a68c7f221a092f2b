//! `TypedArray`: a tagged union over the handful of dtypes the pipeline
//! ever moves around (image planes, labels, masks, scalar features), each
//! stored as a flat buffer plus a shape tail describing the per-event
//! layout (`()` for a scalar, `(H, W)` for an image).

use std::collections::HashMap;

use crate::error::{DcnumError, Result};

/// Per-frame event payload: feature name to its value(s) for that event.
pub type EventData = HashMap<String, TypedArray>;

#[derive(Debug, Clone, PartialEq)]
pub enum TypedArray {
    U8 { data: Vec<u8>, shape: Vec<usize> },
    I16 { data: Vec<i16>, shape: Vec<usize> },
    U16 { data: Vec<u16>, shape: Vec<usize> },
    U32 { data: Vec<u32>, shape: Vec<usize> },
    F64 { data: Vec<f64>, shape: Vec<usize> },
    Bool { data: Vec<bool>, shape: Vec<usize> },
}

/// Name of the dtype, used for basin/log bookkeeping and the reference
/// container format's dataset table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    U8,
    I16,
    U16,
    U32,
    F64,
    Bool,
}

impl TypedArray {
    pub fn dtype(&self) -> DType {
        match self {
            TypedArray::U8 { .. } => DType::U8,
            TypedArray::I16 { .. } => DType::I16,
            TypedArray::U16 { .. } => DType::U16,
            TypedArray::U32 { .. } => DType::U32,
            TypedArray::F64 { .. } => DType::F64,
            TypedArray::Bool { .. } => DType::Bool,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            TypedArray::U8 { shape, .. } => shape,
            TypedArray::I16 { shape, .. } => shape,
            TypedArray::U16 { shape, .. } => shape,
            TypedArray::U32 { shape, .. } => shape,
            TypedArray::F64 { shape, .. } => shape,
            TypedArray::Bool { shape, .. } => shape,
        }
    }

    /// Number of events (leading axis) represented by this array.
    pub fn len(&self) -> usize {
        self.shape().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-event element count (product of all axes after the leading one),
    /// used when allocating a dense array for a new feature in `EventStash`.
    pub fn per_event_len(&self) -> usize {
        self.shape().iter().skip(1).product::<usize>().max(1)
    }

    /// Allocate a zeroed array with the same dtype and per-event shape as
    /// `self`, sized for `n` events. Used by `EventStash::require_feature`
    /// to build a dense array from the first observed sample.
    pub fn zeros_like(&self, n: usize) -> TypedArray {
        let mut tail = self.shape().to_vec();
        if tail.is_empty() {
            tail.push(n);
        } else {
            tail[0] = n;
        }
        let total: usize = tail.iter().copied().product::<usize>().max(n);
        match self {
            TypedArray::U8 { .. } => TypedArray::U8 {
                data: vec![0u8; total],
                shape: tail,
            },
            TypedArray::I16 { .. } => TypedArray::I16 {
                data: vec![0i16; total],
                shape: tail,
            },
            TypedArray::U16 { .. } => TypedArray::U16 {
                data: vec![0u16; total],
                shape: tail,
            },
            TypedArray::U32 { .. } => TypedArray::U32 {
                data: vec![0u32; total],
                shape: tail,
            },
            TypedArray::F64 { .. } => TypedArray::F64 {
                data: vec![0.0f64; total],
                shape: tail,
            },
            TypedArray::Bool { .. } => TypedArray::Bool {
                data: vec![false; total],
                shape: tail,
            },
        }
    }

    /// Write event `src_idx` of `src` (a dense array holding one or more
    /// events) into slot `dst_idx` of `self`, a dense array previously built
    /// by `zeros_like`. Dtypes must match; panics on mismatch, which would
    /// be a bug in the extractor rather than recoverable input data.
    pub fn place_event(&mut self, dst_idx: usize, src: &TypedArray, src_idx: usize, per_event: usize) {
        let at = dst_idx * per_event;
        let from = src_idx * per_event;
        match (self, src) {
            (TypedArray::U8 { data, .. }, TypedArray::U8 { data: s, .. }) => {
                data[at..at + per_event].copy_from_slice(&s[from..from + per_event]);
            }
            (TypedArray::I16 { data, .. }, TypedArray::I16 { data: s, .. }) => {
                data[at..at + per_event].copy_from_slice(&s[from..from + per_event]);
            }
            (TypedArray::U16 { data, .. }, TypedArray::U16 { data: s, .. }) => {
                data[at..at + per_event].copy_from_slice(&s[from..from + per_event]);
            }
            (TypedArray::U32 { data, .. }, TypedArray::U32 { data: s, .. }) => {
                data[at..at + per_event].copy_from_slice(&s[from..from + per_event]);
            }
            (TypedArray::F64 { data, .. }, TypedArray::F64 { data: s, .. }) => {
                data[at..at + per_event].copy_from_slice(&s[from..from + per_event]);
            }
            (TypedArray::Bool { data, .. }, TypedArray::Bool { data: s, .. }) => {
                data[at..at + per_event].clone_from_slice(&s[from..from + per_event]);
            }
            _ => panic!("place_event: dtype mismatch between stash and sample"),
        }
    }

    /// Extend `self` along the leading axis with another array of the same
    /// dtype and per-event shape. Used by `ChunkWriter::store_feature_chunk`
    /// to accumulate successive chunks into one growing dataset.
    pub fn append(&mut self, other: &TypedArray) -> Result<()> {
        if self.dtype() != other.dtype() {
            return Err(DcnumError::Data(format!(
                "cannot append {:?} data onto a {:?} feature",
                other.dtype(),
                self.dtype()
            )));
        }
        if self.shape().get(1..) != other.shape().get(1..) {
            return Err(DcnumError::Data(
                "cannot append array with a different per-event shape".into(),
            ));
        }
        match (self, other) {
            (TypedArray::U8 { data, shape }, TypedArray::U8 { data: o, .. }) => {
                data.extend_from_slice(o);
                shape[0] += o_len(shape, o.len());
            }
            (TypedArray::I16 { data, shape }, TypedArray::I16 { data: o, .. }) => {
                data.extend_from_slice(o);
                shape[0] += o_len(shape, o.len());
            }
            (TypedArray::U16 { data, shape }, TypedArray::U16 { data: o, .. }) => {
                data.extend_from_slice(o);
                shape[0] += o_len(shape, o.len());
            }
            (TypedArray::U32 { data, shape }, TypedArray::U32 { data: o, .. }) => {
                data.extend_from_slice(o);
                shape[0] += o_len(shape, o.len());
            }
            (TypedArray::F64 { data, shape }, TypedArray::F64 { data: o, .. }) => {
                data.extend_from_slice(o);
                shape[0] += o_len(shape, o.len());
            }
            (TypedArray::Bool { data, shape }, TypedArray::Bool { data: o, .. }) => {
                data.extend_from_slice(o);
                shape[0] += o_len(shape, o.len());
            }
            _ => unreachable!("dtype checked above"),
        }
        Ok(())
    }
}

/// Number of leading-axis elements newly added, given the per-event size
/// implied by the destination's own (already-updated) tail shape.
fn o_len(shape: &[usize], raw_len: usize) -> usize {
    let per_event: usize = shape.iter().skip(1).product::<usize>().max(1);
    raw_len / per_event
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_len_from_leading_axis() {
        let a = TypedArray::F64 {
            data: vec![1.0, 2.0, 3.0],
            shape: vec![3],
        };
        assert_eq!(a.len(), 3);
        assert_eq!(a.per_event_len(), 1);
    }

    #[test]
    fn image_shape_reports_per_event_pixels() {
        let a = TypedArray::U8 {
            data: vec![0; 3 * 4 * 5],
            shape: vec![3, 4, 5],
        };
        assert_eq!(a.len(), 3);
        assert_eq!(a.per_event_len(), 20);
    }

    #[test]
    fn place_event_writes_into_the_right_slot() {
        let sample = TypedArray::F64 {
            data: vec![42.0],
            shape: vec![1],
        };
        let mut dense = sample.zeros_like(3);
        dense.place_event(1, &sample, 0, 1);
        match dense {
            TypedArray::F64 { data, .. } => assert_eq!(data, vec![0.0, 42.0, 0.0]),
            _ => panic!("wrong dtype"),
        }
    }

    #[test]
    fn place_event_reads_the_matching_source_event_for_multi_event_frames() {
        let sample = TypedArray::F64 {
            data: vec![2.0, 3.0],
            shape: vec![2],
        };
        let mut dense = sample.zeros_like(2);
        dense.place_event(0, &sample, 0, 1);
        dense.place_event(1, &sample, 1, 1);
        match dense {
            TypedArray::F64 { data, .. } => assert_eq!(data, vec![2.0, 3.0]),
            _ => panic!("wrong dtype"),
        }
    }

    #[test]
    fn append_grows_leading_axis_and_keeps_tail_shape() {
        let mut a = TypedArray::F64 {
            data: vec![1.0, 2.0],
            shape: vec![2],
        };
        let b = TypedArray::F64 {
            data: vec![3.0],
            shape: vec![1],
        };
        a.append(&b).unwrap();
        match a {
            TypedArray::F64 { data, shape } => {
                assert_eq!(data, vec![1.0, 2.0, 3.0]);
                assert_eq!(shape, vec![3]);
            }
            _ => panic!("wrong dtype"),
        }
    }

    #[test]
    fn append_rejects_dtype_mismatch() {
        let mut a = TypedArray::F64 {
            data: vec![1.0],
            shape: vec![1],
        };
        let b = TypedArray::U8 {
            data: vec![1],
            shape: vec![1],
        };
        assert!(a.append(&b).is_err());
    }

    #[test]
    fn zeros_like_preserves_dtype_and_tail_shape() {
        let sample = TypedArray::I16 {
            data: vec![7, 8, 9, 10],
            shape: vec![1, 2, 2],
        };
        let grown = sample.zeros_like(5);
        match grown {
            TypedArray::I16 { data, shape } => {
                assert_eq!(shape, vec![5, 2, 2]);
                assert_eq!(data.len(), 20);
            }
            _ => panic!("wrong dtype"),
        }
    }
}
