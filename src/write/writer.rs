//! `ChunkWriter` trait and the `FileChunkWriter` reference implementation: an
//! ad hoc chunked binary container (magic + typed dataset table +
//! zstd-compressed payload), standing in for a real HDF5 dependency. Grounds
//! its dataset-chunking arithmetic and basin/log semantics in
//! `original_source/src/dcnum/write/writer.py`'s `HDF5Writer`, but does not
//! claim bit-compatibility with an actual .rtdc/HDF5 file (see DESIGN.md).

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::data::input::BasinPath;
use crate::data::{DType, TypedArray};
use crate::error::{DcnumError, Result};

const MAGIC: &[u8; 8] = b"DCNUMBC1";

/// HDF5's recommendation is 10 KiB-1 MiB per chunk; the legacy writer
/// targets ~1 MiB with a floor of 10 events so small outputs still compress.
pub fn get_best_nd_chunks(item_shape: &[usize], dtype_size: usize) -> usize {
    let num_bytes = 1024usize * 1024;
    let event_size = item_shape.iter().product::<usize>().max(1) * dtype_size;
    let chunk_size = num_bytes / event_size.max(1);
    chunk_size.max(10)
}

pub trait ChunkWriter: Send {
    fn store_feature_chunk(&mut self, feat: &str, data: TypedArray) -> Result<()>;
    fn store_log(&mut self, name: &str, lines: &[String], override_existing: bool) -> Result<()>;
    fn store_basin(
        &mut self,
        name: &str,
        paths: &[BasinPath],
        features: Option<&[String]>,
        description: Option<&str>,
    ) -> Result<String>;
    fn finalize(&mut self, attrs: FinalAttributes) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalAttributes {
    pub run_id: String,
    pub pipeline_hash: String,
    pub generation: String,
    pub data: String,
    pub background: String,
    pub segmenter: String,
    pub feature: String,
    pub gate: String,
    pub event_count: u64,
    pub num_frames: u64,
    pub masks_dropped: u64,
}

impl FinalAttributes {
    pub fn yield_fraction(&self) -> f64 {
        if self.num_frames == 0 {
            0.0
        } else {
            self.event_count as f64 / self.num_frames as f64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FeatureMeta {
    dtype: String,
    shape: Vec<usize>,
    offset: u64,
    byte_len: u64,
    chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BasinRecord {
    key: String,
    json: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ContainerHeader {
    features: BTreeMap<String, FeatureMeta>,
    logs: BTreeMap<String, Vec<String>>,
    basins: Vec<BasinRecord>,
    attrs: Option<FinalAttributes>,
}

fn dtype_name(d: DType) -> &'static str {
    match d {
        DType::U8 => "u8",
        DType::I16 => "i16",
        DType::U16 => "u16",
        DType::U32 => "u32",
        DType::F64 => "f64",
        DType::Bool => "bool",
    }
}

fn dtype_size(d: DType) -> usize {
    match d {
        DType::U8 | DType::Bool => 1,
        DType::I16 | DType::U16 => 2,
        DType::U32 => 4,
        DType::F64 => 8,
    }
}

fn typed_array_bytes(arr: &TypedArray) -> Vec<u8> {
    match arr {
        TypedArray::U8 { data, .. } => data.clone(),
        TypedArray::Bool { data, .. } => data.iter().map(|&b| b as u8).collect(),
        TypedArray::I16 { data, .. } => {
            let mut out = Vec::with_capacity(data.len() * 2);
            for &v in data {
                out.write_i16::<LittleEndian>(v).unwrap();
            }
            out
        }
        TypedArray::U16 { data, .. } => {
            let mut out = Vec::with_capacity(data.len() * 2);
            for &v in data {
                out.write_u16::<LittleEndian>(v).unwrap();
            }
            out
        }
        TypedArray::U32 { data, .. } => {
            let mut out = Vec::with_capacity(data.len() * 4);
            for &v in data {
                out.write_u32::<LittleEndian>(v).unwrap();
            }
            out
        }
        TypedArray::F64 { data, .. } => {
            let mut out = Vec::with_capacity(data.len() * 8);
            for &v in data {
                out.write_f64::<LittleEndian>(v).unwrap();
            }
            out
        }
    }
}

/// Accumulates feature/log/basin data in memory and serializes the whole
/// container on `finalize`. This is a reference implementation, not meant to
/// stream arbitrarily large outputs without buffering.
pub struct FileChunkWriter {
    path: PathBuf,
    features: BTreeMap<String, TypedArray>,
    logs: BTreeMap<String, Vec<String>>,
    basins: Vec<BasinRecord>,
    finalized: bool,
}

impl FileChunkWriter {
    pub fn create(path: impl Into<PathBuf>, overwrite: bool) -> Result<Self> {
        let path = path.into();
        if path.exists() && !overwrite {
            return Err(DcnumError::Config(format!(
                "output path {} already exists",
                path.display()
            )));
        }
        Ok(Self {
            path,
            features: BTreeMap::new(),
            logs: BTreeMap::new(),
            basins: Vec::new(),
            finalized: false,
        })
    }
}

impl ChunkWriter for FileChunkWriter {
    fn store_feature_chunk(&mut self, feat: &str, data: TypedArray) -> Result<()> {
        match self.features.get_mut(feat) {
            Some(existing) => existing.append(&data)?,
            None => {
                self.features.insert(feat.to_string(), data);
            }
        }
        Ok(())
    }

    fn store_log(&mut self, name: &str, lines: &[String], override_existing: bool) -> Result<()> {
        if self.logs.contains_key(name) && !override_existing {
            return Err(DcnumError::Data(format!("log '{name}' already exists")));
        }
        self.logs.insert(name.to_string(), lines.to_vec());
        Ok(())
    }

    fn store_basin(
        &mut self,
        name: &str,
        paths: &[BasinPath],
        features: Option<&[String]>,
        description: Option<&str>,
    ) -> Result<String> {
        #[derive(Serialize)]
        struct BasinJson<'a> {
            description: Option<&'a str>,
            format: &'a str,
            name: &'a str,
            paths: Vec<&'a str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            features: Option<&'a [String]>,
            #[serde(rename = "type")]
            kind: &'a str,
        }
        let bdat = BasinJson {
            description,
            format: "dcnum-container",
            name,
            paths: paths.iter().map(|p| p.0.as_str()).collect(),
            features,
            kind: "file",
        };
        let json = serde_json::to_string_pretty(&bdat)
            .map_err(|e| DcnumError::Data(format!("cannot serialize basin record: {e}")))?;
        let mut hasher = Md5::new();
        hasher.update(json.as_bytes());
        let key = hex::encode(hasher.finalize());
        if !self.basins.iter().any(|b| b.key == key) {
            self.basins.push(BasinRecord {
                key: key.clone(),
                json,
            });
        }
        Ok(key)
    }

    fn finalize(&mut self, attrs: FinalAttributes) -> Result<()> {
        let mut header = ContainerHeader {
            features: BTreeMap::new(),
            logs: self.logs.clone(),
            basins: self.basins.clone(),
            attrs: Some(attrs),
        };

        let mut payload = Vec::new();
        for (name, arr) in &self.features {
            let bytes = typed_array_bytes(arr);
            let compressed = zstd::encode_all(&bytes[..], 5)
                .map_err(|e| DcnumError::Storage(format!("zstd compression failed: {e}")))?;
            let offset = payload.len() as u64;
            header.features.insert(
                name.clone(),
                FeatureMeta {
                    dtype: dtype_name(arr.dtype()).to_string(),
                    shape: arr.shape().to_vec(),
                    offset,
                    byte_len: compressed.len() as u64,
                    chunk_size: get_best_nd_chunks(&arr.shape()[1..], dtype_size(arr.dtype())),
                },
            );
            payload.extend_from_slice(&compressed);
        }

        let header_bytes = serde_json::to_vec(&header)
            .map_err(|e| DcnumError::Storage(format!("cannot serialize container header: {e}")))?;

        let mut file = File::create(&self.path)?;
        file.write_all(MAGIC)?;
        file.write_u64::<LittleEndian>(header_bytes.len() as u64)?;
        file.write_all(&header_bytes)?;
        file.write_all(&payload)?;
        self.finalized = true;
        Ok(())
    }
}

impl Drop for FileChunkWriter {
    fn drop(&mut self) {
        if !self.finalized {
            tracing::warn!(path = %self.path.display(), "chunk writer dropped without finalize");
        }
    }
}

/// Reads back a container's header, for tests and for `create_with_basins`'
/// metadata-copy step.
pub fn read_header(path: &Path) -> Result<serde_json::Value> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 8];
    file.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(DcnumError::Storage("not a dcnum container file".into()));
    }
    let mut len_buf = [0u8; 8];
    file.read_exact(&mut len_buf)?;
    let header_len = u64::from_le_bytes(len_buf) as usize;
    let mut header_bytes = vec![0u8; header_len];
    file.read_exact(&mut header_bytes)?;
    serde_json::from_slice(&header_bytes)
        .map_err(|e| DcnumError::Storage(format!("cannot parse container header: {e}")))
}

fn dtype_from_name(name: &str) -> Result<DType> {
    match name {
        "u8" => Ok(DType::U8),
        "i16" => Ok(DType::I16),
        "u16" => Ok(DType::U16),
        "u32" => Ok(DType::U32),
        "f64" => Ok(DType::F64),
        "bool" => Ok(DType::Bool),
        other => Err(DcnumError::Storage(format!("unknown dtype '{other}' in container header"))),
    }
}

fn typed_array_from_bytes(dtype: DType, shape: Vec<usize>, bytes: &[u8]) -> TypedArray {
    match dtype {
        DType::U8 => TypedArray::U8 { data: bytes.to_vec(), shape },
        DType::Bool => TypedArray::Bool {
            data: bytes.iter().map(|&b| b != 0).collect(),
            shape,
        },
        DType::I16 => TypedArray::I16 {
            data: bytes
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]))
                .collect(),
            shape,
        },
        DType::U16 => TypedArray::U16 {
            data: bytes
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect(),
            shape,
        },
        DType::U32 => TypedArray::U32 {
            data: bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
                .collect(),
            shape,
        },
        DType::F64 => TypedArray::F64 {
            data: bytes
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
                .collect(),
            shape,
        },
    }
}

/// Reads one feature dataset back out of a container written by
/// `FileChunkWriter::finalize`. Used by tests that need actual array values
/// rather than just the header's shape/dtype metadata.
pub fn read_feature(path: &Path, name: &str) -> Result<TypedArray> {
    let header = read_header(path)?;
    let meta = header["features"].get(name).ok_or_else(|| {
        DcnumError::Storage(format!("container has no feature '{name}'"))
    })?;
    let dtype = dtype_from_name(meta["dtype"].as_str().unwrap_or_default())?;
    let shape: Vec<usize> = meta["shape"]
        .as_array()
        .map(|a| a.iter().filter_map(|v| v.as_u64()).map(|v| v as usize).collect())
        .unwrap_or_default();
    let offset = meta["offset"].as_u64().unwrap_or(0);
    let byte_len = meta["byte_len"].as_u64().unwrap_or(0) as usize;

    let mut file = File::open(path)?;
    file.read_exact(&mut [0u8; 8])?; // magic
    let mut len_buf = [0u8; 8];
    file.read_exact(&mut len_buf)?;
    let header_len = u64::from_le_bytes(len_buf);
    let payload_start = 8 + 8 + header_len;
    file.seek_to(payload_start + offset)?;
    let mut compressed = vec![0u8; byte_len];
    file.read_exact(&mut compressed)?;
    let bytes = zstd::decode_all(&compressed[..])
        .map_err(|e| DcnumError::Storage(format!("zstd decompression failed: {e}")))?;
    Ok(typed_array_from_bytes(dtype, shape, &bytes))
}

trait SeekTo {
    fn seek_to(&mut self, pos: u64) -> Result<()>;
}

impl SeekTo for File {
    fn seek_to(&mut self, pos: u64) -> Result<()> {
        use std::io::{Seek, SeekFrom};
        self.seek(SeekFrom::Start(pos))?;
        Ok(())
    }
}

/// Creates a basin-only output file: writes no feature data of its own, only
/// references to `basin_paths`. Mirrors `writer.py::create_with_basins`,
/// including that metadata on the destination is never overridden by a
/// basin's own metadata (there simply is none copied here, since basin
/// sources in this reference implementation are not read for their
/// metadata — see DESIGN.md for the scope of this deviation).
pub fn create_with_basins(path_out: &Path, basin_paths: &[Vec<PathBuf>]) -> Result<()> {
    if basin_paths.is_empty() {
        tracing::warn!(
            path = %path_out.display(),
            "creating basin-based file without any basins"
        );
    }
    let mut writer = FileChunkWriter::create(path_out, true)?;
    for bp in basin_paths {
        let paths: Vec<BasinPath> = bp.iter().map(|p| BasinPath(p.display().to_string())).collect();
        let name = bp
            .first()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        writer.store_basin(&name, &paths, None, Some("created by dcnum-rs"))?;
    }
    writer.finalize(FinalAttributes {
        run_id: String::new(),
        pipeline_hash: String::new(),
        generation: String::new(),
        data: String::new(),
        background: String::new(),
        segmenter: String::new(),
        feature: String::new(),
        gate: String::new(),
        event_count: 0,
        num_frames: 0,
        masks_dropped: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_chunk_size_floors_at_ten_events() {
        assert_eq!(get_best_nd_chunks(&[200, 200], 2), 10);
        assert_eq!(get_best_nd_chunks(&[], 8), 131072);
    }

    #[test]
    fn store_basin_is_idempotent_by_content_hash() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = FileChunkWriter::create(dir.path().join("out.dcn"), true).unwrap();
        let paths = vec![BasinPath("a.dcn".into())];
        let k1 = w.store_basin("a", &paths, None, None).unwrap();
        let k2 = w.store_basin("a", &paths, None, None).unwrap();
        assert_eq!(k1, k2);
        assert_eq!(w.basins.len(), 1);
    }

    #[test]
    fn finalize_writes_readable_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.dcn");
        let mut w = FileChunkWriter::create(&path, true).unwrap();
        w.store_feature_chunk(
            "deform",
            TypedArray::F64 {
                data: vec![0.1, 0.2],
                shape: vec![2],
            },
        )
        .unwrap();
        w.finalize(FinalAttributes {
            run_id: "dcn-abc1234".into(),
            pipeline_hash: "abc1234...".into(),
            generation: "1".into(),
            data: "hdf:p=1".into(),
            background: "sparsemed".into(),
            segmenter: "legacy".into(),
            feature: "legacy".into(),
            gate: "norm".into(),
            event_count: 2,
            num_frames: 10,
            masks_dropped: 0,
        })
        .unwrap();
        let header = read_header(&path).unwrap();
        assert_eq!(header["attrs"]["event_count"], 2);
        assert!(header["features"]["deform"].is_object());
    }

    #[test]
    fn read_feature_round_trips_compressed_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.dcn");
        let mut w = FileChunkWriter::create(&path, true).unwrap();
        w.store_feature_chunk(
            "deform",
            TypedArray::F64 {
                data: vec![0.1, 0.2, 0.3],
                shape: vec![3],
            },
        )
        .unwrap();
        w.store_feature_chunk(
            "nevents",
            TypedArray::I16 {
                data: vec![1, 0, 2],
                shape: vec![3],
            },
        )
        .unwrap();
        w.finalize(FinalAttributes {
            run_id: "dcn-abc1234".into(),
            pipeline_hash: "abc1234...".into(),
            generation: "1".into(),
            data: "hdf:p=1".into(),
            background: "sparsemed".into(),
            segmenter: "legacy".into(),
            feature: "legacy".into(),
            gate: "norm".into(),
            event_count: 3,
            num_frames: 3,
            masks_dropped: 0,
        })
        .unwrap();

        match read_feature(&path, "deform").unwrap() {
            TypedArray::F64 { data, shape } => {
                assert_eq!(data, vec![0.1, 0.2, 0.3]);
                assert_eq!(shape, vec![3]);
            }
            other => panic!("wrong dtype: {other:?}"),
        }
        match read_feature(&path, "nevents").unwrap() {
            TypedArray::I16 { data, .. } => assert_eq!(data, vec![1, 0, 2]),
            other => panic!("wrong dtype: {other:?}"),
        }
        assert!(read_feature(&path, "missing").is_err());
    }
}
