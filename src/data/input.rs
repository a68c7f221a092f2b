//! The `InputData` boundary trait: read-only access to an image stream and
//! whatever scalar features, metadata, logs, tables, and basins the input
//! file already carries. Grounded in `original_source/src/dcnum/read/hdf5_data.py`'s
//! `HDF5Data.__getitem__`, which special-cases `image`/`image_bg`/`mask`,
//! caches scalar features, and falls back to basins for anything else.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use parking_lot::Mutex;

use crate::data::typed_array::TypedArray;
use crate::error::{DcnumError, Result};

/// One chunk's worth of raw image planes, row-major, one plane per frame.
#[derive(Debug, Clone)]
pub struct ImageChunk {
    pub frames: Vec<Vec<u8>>,
    pub height: usize,
    pub width: usize,
}

impl ImageChunk {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Free-form metadata: dotted section keys (`"experiment.event count"`) to
/// string values, exactly as the original's flat metadata dictionary reads.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    entries: HashMap<String, String>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.entries.iter()
    }
}

/// A path segment of a basin reference: either a local file path or a
/// remote URL, mirroring the original's list-of-candidate-paths basins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasinPath(pub String);

/// A single registered basin: the features it claims to provide and the
/// candidate paths/urls where it can be found.
#[derive(Debug, Clone)]
pub struct BasinRef {
    pub key: String,
    pub name: String,
    pub paths: Vec<BasinPath>,
    pub features: Option<Vec<String>>,
    pub description: Option<String>,
}

/// The three pipeline identifier components an input file may already carry
/// from a prior run (so a re-run with identical background/segmenter/feature
/// codes can reuse earlier results instead of recomputing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredIdentifiers {
    pub generation: String,
    pub data: String,
    pub background: String,
}

/// Read-only access to an input image stream plus whatever the file already
/// carries alongside it. Implementors must be safe to share across worker
/// threads: each chunk is read independently and concurrently.
pub trait InputData: Send + Sync {
    fn num_frames(&self) -> u64;
    fn chunk_size(&self) -> usize;
    fn num_chunks(&self) -> usize;

    /// The raw image plane for chunk `c`.
    fn get_chunk(&self, c: usize) -> Result<ImageChunk>;

    /// The frame-index range covered by chunk `c`.
    fn get_chunk_slice(&self, c: usize) -> Range<u64>;

    /// The background estimate for chunk `c`, if one has already been
    /// computed and stored (via a basin or a prior run).
    fn get_bg_chunk(&self, c: usize) -> Option<Result<ImageChunk>>;

    /// A scalar per-frame feature array (including `bg_off`), if present.
    fn feature(&self, name: &str) -> Option<TypedArray>;

    /// The set of feature names available without further computation.
    fn keys(&self) -> HashSet<String>;

    fn metadata(&self) -> &Metadata;
    fn logs(&self) -> &HashMap<String, Vec<String>>;
    fn tables(&self) -> &HashMap<String, TypedArray>;
    fn basins(&self) -> &[BasinRef];
    fn stored_ppid(&self) -> Option<&StoredIdentifiers>;
}

/// A small in-memory `InputData` used by tests and by the reference
/// container reader in `write::hdf5_writer`'s sibling loader. Holds whole
/// image stacks rather than memory-mapping them, which is acceptable for
/// the fixture sizes this crate's own tests use.
pub struct MemoryInputData {
    pub images: Vec<Vec<u8>>,
    pub image_bg: Option<Vec<Vec<u8>>>,
    pub height: usize,
    pub width: usize,
    pub chunk_size: usize,
    pub features: HashMap<String, TypedArray>,
    pub metadata: Metadata,
    pub logs: HashMap<String, Vec<String>>,
    pub tables: HashMap<String, TypedArray>,
    pub basins: Vec<BasinRef>,
    pub stored_ppid: Option<StoredIdentifiers>,
}

impl MemoryInputData {
    pub fn new(images: Vec<Vec<u8>>, height: usize, width: usize, chunk_size: usize) -> Self {
        Self {
            images,
            image_bg: None,
            height,
            width,
            chunk_size,
            features: HashMap::new(),
            metadata: Metadata::new(),
            logs: HashMap::new(),
            tables: HashMap::new(),
            basins: Vec::new(),
            stored_ppid: None,
        }
    }
}

impl InputData for MemoryInputData {
    fn num_frames(&self) -> u64 {
        self.images.len() as u64
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn num_chunks(&self) -> usize {
        let n = self.images.len();
        if n == 0 {
            0
        } else {
            n.div_ceil(self.chunk_size)
        }
    }

    fn get_chunk(&self, c: usize) -> Result<ImageChunk> {
        let r = self.get_chunk_slice(c);
        let frames = self.images[r.start as usize..r.end as usize].to_vec();
        Ok(ImageChunk {
            frames,
            height: self.height,
            width: self.width,
        })
    }

    fn get_chunk_slice(&self, c: usize) -> Range<u64> {
        let start = (c * self.chunk_size) as u64;
        let end = (start + self.chunk_size as u64).min(self.images.len() as u64);
        start..end
    }

    fn get_bg_chunk(&self, c: usize) -> Option<Result<ImageChunk>> {
        let bg = self.image_bg.as_ref()?;
        let r = self.get_chunk_slice(c);
        let frames = bg[r.start as usize..r.end as usize].to_vec();
        Some(Ok(ImageChunk {
            frames,
            height: self.height,
            width: self.width,
        }))
    }

    fn feature(&self, name: &str) -> Option<TypedArray> {
        self.features.get(name).cloned()
    }

    fn keys(&self) -> HashSet<String> {
        self.features.keys().cloned().collect()
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn logs(&self) -> &HashMap<String, Vec<String>> {
        &self.logs
    }

    fn tables(&self) -> &HashMap<String, TypedArray> {
        &self.tables
    }

    fn basins(&self) -> &[BasinRef] {
        &self.basins
    }

    fn stored_ppid(&self) -> Option<&StoredIdentifiers> {
        self.stored_ppid.as_ref()
    }
}

const RAW_MAGIC: &[u8; 8] = b"DCNUMRW1";

/// A minimal file-backed `InputData`: a flat header followed by the raw
/// image stack and, optionally, an equally-sized background stack. Stands in
/// for the real `.rtdc`/HDF5 reader the same way `FileChunkWriter` stands in
/// for a real HDF5 writer — no metadata/logs/tables/basins are carried, since
/// those belong to files produced by an earlier dcnum run, not a fresh
/// camera-acquired stream.
pub struct RawStreamInputData {
    file: Mutex<File>,
    num_frames: u64,
    height: usize,
    width: usize,
    chunk_size: usize,
    image_offset: u64,
    bg_offset: Option<u64>,
    metadata: Metadata,
    logs: HashMap<String, Vec<String>>,
    tables: HashMap<String, TypedArray>,
    basins: Vec<BasinRef>,
}

impl RawStreamInputData {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)?;
        if &magic != RAW_MAGIC {
            return Err(DcnumError::Input(format!(
                "{}: not a raw dcnum stream",
                path.display()
            )));
        }
        let num_frames = file.read_u64::<LittleEndian>()?;
        let height = file.read_u32::<LittleEndian>()? as usize;
        let width = file.read_u32::<LittleEndian>()? as usize;
        let chunk_size = file.read_u32::<LittleEndian>()? as usize;
        let has_bg = file.read_u8()? != 0;

        let image_offset = file.stream_position()?;
        let frame_bytes = (num_frames as usize) * height * width;
        let bg_offset = if has_bg {
            Some(image_offset + frame_bytes as u64)
        } else {
            None
        };

        Ok(Self {
            file: Mutex::new(file),
            num_frames,
            height,
            width,
            chunk_size: chunk_size.max(1),
            image_offset,
            bg_offset,
            metadata: Metadata::new(),
            logs: HashMap::new(),
            tables: HashMap::new(),
            basins: Vec::new(),
        })
    }

    fn read_range(&self, base: u64, start: u64, end: u64) -> Result<ImageChunk> {
        let per_frame = self.height * self.width;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(base + start * per_frame as u64))?;
        let n = (end - start) as usize;
        let mut raw = vec![0u8; n * per_frame];
        file.read_exact(&mut raw)?;
        let frames = raw.chunks_exact(per_frame).map(|c| c.to_vec()).collect();
        Ok(ImageChunk {
            frames,
            height: self.height,
            width: self.width,
        })
    }
}

impl InputData for RawStreamInputData {
    fn num_frames(&self) -> u64 {
        self.num_frames
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn num_chunks(&self) -> usize {
        if self.num_frames == 0 {
            0
        } else {
            (self.num_frames as usize).div_ceil(self.chunk_size)
        }
    }

    fn get_chunk(&self, c: usize) -> Result<ImageChunk> {
        let r = self.get_chunk_slice(c);
        self.read_range(self.image_offset, r.start, r.end)
    }

    fn get_chunk_slice(&self, c: usize) -> Range<u64> {
        let start = (c * self.chunk_size) as u64;
        let end = (start + self.chunk_size as u64).min(self.num_frames);
        start..end
    }

    fn get_bg_chunk(&self, c: usize) -> Option<Result<ImageChunk>> {
        let bg_offset = self.bg_offset?;
        let r = self.get_chunk_slice(c);
        Some(self.read_range(bg_offset, r.start, r.end))
    }

    fn feature(&self, _name: &str) -> Option<TypedArray> {
        None
    }

    fn keys(&self) -> HashSet<String> {
        HashSet::new()
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn logs(&self) -> &HashMap<String, Vec<String>> {
        &self.logs
    }

    fn tables(&self) -> &HashMap<String, TypedArray> {
        &self.tables
    }

    fn basins(&self) -> &[BasinRef] {
        &self.basins
    }

    fn stored_ppid(&self) -> Option<&StoredIdentifiers> {
        None
    }
}
