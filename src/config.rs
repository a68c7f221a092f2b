//! Job configuration loaded from CLI arguments (and optionally a TOML file).
//!
//! Mirrors the shape of a recorder's `Config`/`StorageConfig` split: one
//! section for the pipeline runtime's resource knobs, one for the pluggable
//! algorithm codes that make up the pipeline identifier.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{DcnumError, Result};

/// How basins are enforced when the input already carries feature data that
/// the output could reference instead of copying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BasinStrategy {
    /// Reference the input file as a basin; write only newly computed data.
    #[default]
    Tap,
    /// Copy all basin-supplied data into the output (no dangling reference).
    Drain,
}

/// Top-level run configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Input file path.
    pub input: PathBuf,
    /// Output file path. Defaults to `<input>_dcn.rtdc` when absent.
    #[serde(default)]
    pub output: Option<PathBuf>,
    /// Overwrite an existing output file.
    #[serde(default)]
    pub overwrite: bool,
    /// Runtime resource knobs.
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Pipeline algorithm identifiers (segmenter/background/feature/gate).
    #[serde(default)]
    pub pipeline: PipelineCodes,
    /// How to handle basins copied/referenced from the input.
    #[serde(default)]
    pub basin_strategy: BasinStrategy,
    /// Keep temporary files and the log file around after the run.
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Number of regular chunk slots (3 is a reasonable default).
    #[serde(default = "default_num_slots")]
    pub num_slots: usize,
    /// Number of stage workers. `None` means "CPUs minus one for the
    /// collector/writer", overridable via `DCNUM_CPU_COUNT`.
    #[serde(default)]
    pub num_workers: Option<usize>,
    /// Frames collected per write-window.
    #[serde(default = "default_write_threshold")]
    pub write_threshold: usize,
    /// Backpressure high watermark for `write_queue_size`.
    #[serde(default)]
    pub backpressure_high: Option<u64>,
    /// Backpressure low watermark for `write_queue_size`.
    #[serde(default)]
    pub backpressure_low: Option<u64>,
    /// Worker join retry count.
    #[serde(default = "default_join_retries")]
    pub join_retries: u32,
    /// Worker join timeout per retry, in seconds.
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_slots: default_num_slots(),
            num_workers: None,
            write_threshold: default_write_threshold(),
            backpressure_high: None,
            backpressure_low: None,
            join_retries: default_join_retries(),
            join_timeout_secs: default_join_timeout_secs(),
        }
    }
}

fn default_num_slots() -> usize {
    3
}

fn default_write_threshold() -> usize {
    500
}

fn default_join_retries() -> u32 {
    30
}

fn default_join_timeout_secs() -> u64 {
    2
}

impl RuntimeConfig {
    /// Builder helper for CLI wiring: overrides `num_workers` when the flag
    /// was actually passed, leaves the "auto" default otherwise.
    pub fn with_num_workers(mut self, num_workers: Option<usize>) -> Self {
        if num_workers.is_some() {
            self.num_workers = num_workers;
        }
        self
    }

    pub fn backpressure_high(&self) -> u64 {
        self.backpressure_high
            .unwrap_or_else(|| 4 * self.write_threshold as u64)
    }

    pub fn backpressure_low(&self) -> u64 {
        self.backpressure_low
            .unwrap_or_else(|| 2 * self.write_threshold as u64)
    }
}

/// Pipeline algorithm codes, each `code[:k1=v1^k2=v2...]` as described by
/// the pipeline identifier grammar in `meta::ppid`.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct PipelineCodes {
    #[serde(default = "default_background")]
    pub background: String,
    #[serde(default = "default_segmenter")]
    pub segmenter: String,
    #[serde(default = "default_feature")]
    pub feature: String,
    #[serde(default = "default_gate")]
    pub gate: String,
}

fn default_background() -> String {
    "sparsemed".into()
}

fn default_segmenter() -> String {
    "legacy".into()
}

fn default_feature() -> String {
    "legacy".into()
}

fn default_gate() -> String {
    "norm".into()
}

impl PipelineConfig {
    pub fn load_toml(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DcnumError::Config(format!("cannot read config file: {e}")))?;
        let cfg: Self = toml::from_str(&content)
            .map_err(|e| DcnumError::Config(format!("invalid TOML: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn output_path(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(|| {
            let stem = self
                .input
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "output".into());
            let ext = self
                .input
                .extension()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "rtdc".into());
            self.input.with_file_name(format!("{stem}_dcn.{ext}"))
        })
    }

    fn validate(&self) -> Result<()> {
        if self.runtime.num_slots == 0 {
            return Err(DcnumError::Config("num_slots must be > 0".into()));
        }
        if self.runtime.write_threshold == 0 {
            return Err(DcnumError::Config("write_threshold must be > 0".into()));
        }
        Ok(())
    }

    /// Resolve the worker count: explicit config, else `DCNUM_CPU_COUNT`,
    /// else CPUs minus one (reserved for the collector/writer task).
    pub fn resolve_num_workers(&self) -> usize {
        if let Some(n) = self.runtime.num_workers {
            return n.max(1);
        }
        if let Ok(v) = std::env::var("DCNUM_CPU_COUNT") {
            if let Ok(n) = v.parse::<usize>() {
                return n.max(1);
            }
        }
        std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1).max(1))
            .unwrap_or(1)
    }
}
