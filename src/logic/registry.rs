//! `Registry`: resolves a `code:k=v^k=v` pipeline-identifier sub-string to a
//! constructed trait object. Replaces the original's module-level singleton
//! registries built by enumerating `Segmenter`/`Background`/... subclasses
//! (`original_source/src/dcnum/segm/segmenter.py::get_available_segmenters`)
//! with one fixed, explicit list per stage, built once at startup.

use std::sync::Arc;

use crate::error::{DcnumError, Result};
use crate::feat::{BackgroundComputer, FeatureExtractor, LegacyMomentsExtractor, SparseMedianBackground};
use crate::gate::{Gate, NoOpGate, SizeGate};
use crate::meta::SubId;
use crate::segm::{LegacyThresholdSegmenter, Segmenter};

/// Colon-separated search path for segmenter model files
/// (`DCNUM_MODEL_SEARCH_PATH`). Unused by the CPU reference segmenters
/// shipped here, but plumbed through per the environment contract.
#[derive(Debug, Default, Clone)]
pub struct ModelSearchPath(pub Vec<String>);

impl ModelSearchPath {
    pub fn from_env() -> Self {
        match std::env::var("DCNUM_MODEL_SEARCH_PATH") {
            Ok(v) => Self(v.split(':').filter(|s| !s.is_empty()).map(String::from).collect()),
            Err(_) => Self(Vec::new()),
        }
    }
}

pub struct Registry {
    model_search_path: ModelSearchPath,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            model_search_path: ModelSearchPath::from_env(),
        }
    }

    pub fn model_search_path(&self) -> &ModelSearchPath {
        &self.model_search_path
    }

    pub fn resolve_segmenter(&self, ppid: &str) -> Result<Arc<dyn Segmenter>> {
        let sub = SubId::from_ppid(ppid, &["thresh"])?;
        match sub.code.as_str() {
            "legacy" => {
                let threshold = sub
                    .kwargs
                    .get("thresh")
                    .map(|v| v.parse::<i16>())
                    .transpose()
                    .map_err(|e| DcnumError::Ppid(format!("invalid thresh: {e}")))?
                    .unwrap_or(-6);
                Ok(Arc::new(LegacyThresholdSegmenter::new(threshold)))
            }
            other => Err(DcnumError::Ppid(format!("unknown segmenter code '{other}'"))),
        }
    }

    pub fn resolve_background(&self, ppid: &str) -> Result<Arc<dyn BackgroundComputer>> {
        let sub = SubId::from_ppid(ppid, &["kernel_size"])?;
        match sub.code.as_str() {
            "sparsemed" => {
                let kernel_size = sub
                    .kwargs
                    .get("kernel_size")
                    .map(|v| v.parse::<usize>())
                    .transpose()
                    .map_err(|e| DcnumError::Ppid(format!("invalid kernel_size: {e}")))?
                    .unwrap_or(100);
                Ok(Arc::new(SparseMedianBackground { kernel_size }))
            }
            other => Err(DcnumError::Ppid(format!("unknown background code '{other}'"))),
        }
    }

    pub fn resolve_feature(&self, ppid: &str) -> Result<Arc<dyn FeatureExtractor>> {
        let sub = SubId::from_ppid(ppid, &["pixel_size"])?;
        match sub.code.as_str() {
            "legacy" => {
                let pixel_size = sub
                    .kwargs
                    .get("pixel_size")
                    .map(|v| v.parse::<f64>())
                    .transpose()
                    .map_err(|e| DcnumError::Ppid(format!("invalid pixel_size: {e}")))?
                    .unwrap_or(0.34);
                Ok(Arc::new(LegacyMomentsExtractor { pixel_size }))
            }
            other => Err(DcnumError::Ppid(format!("unknown feature code '{other}'"))),
        }
    }

    pub fn resolve_gate(&self, ppid: &str) -> Result<Arc<dyn Gate>> {
        let sub = SubId::from_ppid(ppid, &["min_area", "max_area"])?;
        match sub.code.as_str() {
            "norm" => Ok(Arc::new(NoOpGate)),
            "size" => {
                let parse = |k: &str, default: f64| -> Result<f64> {
                    sub.kwargs
                        .get(k)
                        .map(|v| v.parse::<f64>())
                        .transpose()
                        .map_err(|e| DcnumError::Ppid(format!("invalid {k}: {e}")))
                        .map(|v| v.unwrap_or(default))
                };
                let min_area = parse("min_area", 0.0)?;
                let max_area = parse("max_area", f64::MAX)?;
                Ok(Arc::new(SizeGate::new(min_area, max_area)))
            }
            other => Err(DcnumError::Ppid(format!("unknown gate code '{other}'"))),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_legacy_segmenter_with_default_threshold() {
        let reg = Registry::new();
        let seg = reg.resolve_segmenter("legacy").unwrap();
        assert_eq!(seg.ppid_code(), "legacy");
    }

    #[test]
    fn resolves_size_gate_with_kwargs() {
        let reg = Registry::new();
        let gate = reg.resolve_gate("size:min_area=1^max_area=50").unwrap();
        assert_eq!(gate.ppid_code(), "size");
    }

    #[test]
    fn unknown_code_is_a_ppid_error() {
        let reg = Registry::new();
        assert!(reg.resolve_segmenter("nonexistent").is_err());
    }
}
