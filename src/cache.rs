//! Key-value tensor caches for prepared controls and inverted latents.
//!
//! On disk every tensor lives in its own `<key>.bin` file:
//!
//! Format (little-endian):
//! - ndims: u64
//! - dims: ndims * u64
//! - data: f32 * product(dims)

use candle_core::{DType, Device, Tensor};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::RunConfig;
use crate::error::{RaveError, Result};

const EXTENSION: &str = "bin";
const MAX_DIMS: u64 = 8;

/// Persistent mapping from string keys to tensors.
pub trait TensorStore {
    /// Keys currently stored, sorted.
    fn keys(&self) -> Result<Vec<String>>;

    /// `Ok(None)` when the key is absent. Undecodable entries are a
    /// [`RaveError::CacheInconsistency`].
    fn load(&self, key: &str, device: &Device) -> Result<Option<Tensor>>;

    fn save(&mut self, key: &str, tensor: &Tensor) -> Result<()>;

    /// Human readable location used in error messages.
    fn location(&self) -> String;
}

/// Directory-backed store, one file per key.
#[derive(Debug, Clone)]
pub struct FsTensorStore {
    dir: PathBuf,
}

impl FsTensorStore {
    /// Opens (and creates if needed) the cache directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{EXTENSION}"))
    }
}

impl TensorStore for FsTensorStore {
    fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn load(&self, key: &str, device: &Device) -> Result<Option<Tensor>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let mut reader = BufReader::new(File::open(&path)?);
        let tensor = read_tensor(&mut reader, device)
            .map_err(|reason| RaveError::cache(path.display().to_string(), reason))?;
        Ok(Some(tensor))
    }

    fn save(&mut self, key: &str, tensor: &Tensor) -> Result<()> {
        let path = self.path_for(key);
        let tmp = self.dir.join(format!(".{key}.{EXTENSION}.tmp"));
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            write_tensor(&mut writer, tensor)?;
            writer.flush()?;
        }
        fs::rename(&tmp, &path)?;
        debug!(key, path = %path.display(), dims = ?tensor.dims(), "cached tensor");
        Ok(())
    }

    fn location(&self) -> String {
        self.dir.display().to_string()
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default, Clone)]
pub struct MemoryTensorStore {
    entries: BTreeMap<String, Tensor>,
}

impl MemoryTensorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TensorStore for MemoryTensorStore {
    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.keys().cloned().collect())
    }

    fn load(&self, key: &str, device: &Device) -> Result<Option<Tensor>> {
        self.entries
            .get(key)
            .map(|t| t.to_device(device).map_err(RaveError::from))
            .transpose()
    }

    fn save(&mut self, key: &str, tensor: &Tensor) -> Result<()> {
        self.entries.insert(key.to_string(), tensor.clone());
        Ok(())
    }

    fn location(&self) -> String {
        "<memory>".to_string()
    }
}

/// Writes one tensor as f32 with a u64 dims header.
pub fn write_tensor(writer: &mut impl Write, tensor: &Tensor) -> Result<()> {
    let dims = tensor.dims();
    writer.write_all(&(dims.len() as u64).to_le_bytes())?;
    for &d in dims {
        writer.write_all(&(d as u64).to_le_bytes())?;
    }
    let data = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    for v in data {
        writer.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

/// Reads a tensor written by [`write_tensor`]. The error is a reason string so
/// callers can attach the location.
pub fn read_tensor(
    reader: &mut impl Read,
    device: &Device,
) -> std::result::Result<Tensor, String> {
    let mut u64_buf = [0u8; 8];
    reader
        .read_exact(&mut u64_buf)
        .map_err(|e| format!("missing header: {e}"))?;
    let ndims = u64::from_le_bytes(u64_buf);
    if ndims > MAX_DIMS {
        return Err(format!("implausible rank {ndims}"));
    }

    let mut dims = Vec::with_capacity(ndims as usize);
    for _ in 0..ndims {
        reader
            .read_exact(&mut u64_buf)
            .map_err(|e| format!("truncated dims: {e}"))?;
        dims.push(u64::from_le_bytes(u64_buf) as usize);
    }

    let numel = dims
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| format!("dims {dims:?} overflow"))?;
    let expected = numel
        .checked_mul(4)
        .ok_or_else(|| format!("dims {dims:?} overflow"))?;
    // One byte past `expected` is enough to detect trailing data.
    let mut data_bytes = Vec::new();
    reader
        .take(expected as u64 + 1)
        .read_to_end(&mut data_bytes)
        .map_err(|e| format!("unreadable data: {e}"))?;
    if data_bytes.len() != expected {
        return Err(format!(
            "expected {expected} data bytes for dims {dims:?}, found {}",
            data_bytes.len()
        ));
    }

    let data: Vec<f32> = data_bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Tensor::from_vec(data, dims.as_slice(), device).map_err(|e| e.to_string())
}

/// Per-run cache directories under a common root.
///
/// The directory names encode everything the cached tensors depend on, so a
/// change of grid size, padding, preprocessors or model gets a fresh cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
    pub control_dir: PathBuf,
    pub inverse_dir: PathBuf,
}

impl CacheLayout {
    pub fn for_run(root: impl AsRef<Path>, config: &RunConfig) -> Self {
        let root = root.as_ref();
        let g = config.grid_size;
        let model = config.model_id.replace('/', "-");
        let preprocess = &config.preprocess_name;
        Self {
            control_dir: root
                .join("controls")
                .join(&config.video_name)
                .join(format!("{preprocess}_{g}x{g}_{}", config.pad)),
            inverse_dir: root
                .join("inverses")
                .join(&config.video_name)
                .join(format!("{preprocess}_{model}_{g}x{g}_{}", config.pad)),
        }
    }
}

/// How much of an expected key set a store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Empty,
    Complete,
}

/// Compares a store's contents against the exact key set a run expects.
///
/// Anything other than "nothing" or "exactly these keys" is an inconsistency:
/// a crashed earlier run, or a directory shared by differently configured runs.
pub fn cache_status(store: &dyn TensorStore, expected: &[String]) -> Result<CacheStatus> {
    let keys = store.keys()?;
    if keys.is_empty() {
        return Ok(CacheStatus::Empty);
    }
    let foreign: Vec<&String> = keys.iter().filter(|k| !expected.contains(*k)).collect();
    if !foreign.is_empty() {
        return Err(RaveError::cache(
            store.location(),
            format!("unexpected entries {foreign:?}"),
        ));
    }
    if keys.len() != expected.len() {
        return Err(RaveError::cache(
            store.location(),
            format!("{} of {} entries present", keys.len(), expected.len()),
        ));
    }
    Ok(CacheStatus::Complete)
}

/// Keys of the per-frame inversion cache: `00000`, `00001`, ...
pub fn frame_keys(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{i:05}")).collect()
}

/// Keys of the prepared-controls cache: `img`, `control_1`, ... `control_n`.
pub fn control_keys(n: usize) -> Vec<String> {
    std::iter::once("img".to_string())
        .chain((1..=n).map(|k| format!("control_{k}")))
        .collect()
}

/// Loads every expected key, checking each tensor's dims when `dims` is given.
pub fn load_all(
    store: &dyn TensorStore,
    keys: &[String],
    dims: Option<&[usize]>,
    device: &Device,
) -> Result<Vec<Tensor>> {
    keys.iter()
        .map(|key| {
            let tensor = store.load(key, device)?.ok_or_else(|| {
                RaveError::cache(store.location(), format!("entry {key} disappeared"))
            })?;
            if let Some(dims) = dims {
                if tensor.dims() != dims {
                    return Err(RaveError::cache(
                        store.location(),
                        format!("entry {key} has dims {:?}, expected {dims:?}", tensor.dims()),
                    ));
                }
            }
            Ok(tensor)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_zero_padded() {
        assert_eq!(frame_keys(3), vec!["00000", "00001", "00002"]);
        assert_eq!(control_keys(2), vec!["img", "control_1", "control_2"]);
    }

    #[test]
    fn status_of_memory_store() -> Result<()> {
        let device = Device::Cpu;
        let expected = frame_keys(2);
        let mut store = MemoryTensorStore::new();
        assert_eq!(cache_status(&store, &expected)?, CacheStatus::Empty);

        let t = Tensor::zeros((1, 2), DType::F32, &device)?;
        store.save("00000", &t)?;
        assert!(matches!(
            cache_status(&store, &expected),
            Err(RaveError::CacheInconsistency { .. })
        ));

        store.save("00001", &t)?;
        assert_eq!(cache_status(&store, &expected)?, CacheStatus::Complete);

        store.save("stray", &t)?;
        assert!(cache_status(&store, &expected).is_err());
        Ok(())
    }

    #[test]
    fn layout_encodes_run_geometry() {
        let mut config = RunConfig::new(3, 1).unwrap();
        config.video_name = "truck".to_string();
        config.preprocess_name = "depth_zoe-lineart_coarse".to_string();
        config.model_id = "runwayml/sd15".to_string();
        let layout = CacheLayout::for_run("/cache", &config);
        assert_eq!(
            layout.control_dir,
            PathBuf::from("/cache/controls/truck/depth_zoe-lineart_coarse_3x3_1")
        );
        assert_eq!(
            layout.inverse_dir,
            PathBuf::from("/cache/inverses/truck/depth_zoe-lineart_coarse_runwayml-sd15_3x3_1")
        );
    }
}
