//! Model handles
//!
//! GGUF header validation and the shared [`Model`] handle handed to callers.

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::inference::engine::Engine;
use crate::inference::ffi::ModelPtr;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// Errors that can occur while inspecting a model file
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,
}

/// Metadata extracted from a GGUF file header
#[derive(Debug, Clone)]
pub struct GgufMetadata {
    /// GGUF format version
    pub version: u32,
    /// Number of tensors in the model
    pub tensor_count: u64,
    /// Number of metadata key-value pairs
    pub metadata_kv_count: u64,
}

/// Validates that a file is a valid GGUF format and extracts basic metadata.
///
/// Only the fixed 24-byte header is read; the engine parses the rest.
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufMetadata, ModelError> {
    let mut file = File::open(path)?;

    // magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
    let file_size = file.seek(SeekFrom::End(0))?;
    if file_size < 24 {
        return Err(ModelError::FileTooSmall);
    }
    file.seek(SeekFrom::Start(0))?;

    let mut header = [0u8; 24];
    file.read_exact(&mut header)?;

    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if magic != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic(magic));
    }

    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if !(2..=3).contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    let mut count = [0u8; 8];
    count.copy_from_slice(&header[8..16]);
    let tensor_count = u64::from_le_bytes(count);
    count.copy_from_slice(&header[16..24]);
    let metadata_kv_count = u64::from_le_bytes(count);

    Ok(GgufMetadata {
        version,
        tensor_count,
        metadata_kv_count,
    })
}

struct LoadedModel {
    engine: Arc<dyn Engine>,
    ptr: ModelPtr,
    path: PathBuf,
}

impl Drop for LoadedModel {
    fn drop(&mut self) {
        self.engine.free_model(self.ptr);
        tracing::info!("Model freed: {}", self.path.display());
    }
}

/// A loaded model, shared read-only between generation requests.
///
/// Cloning is cheap. The native weights are freed once, when the last clone
/// goes away; a worker still generating keeps its own clone, so closing a
/// model mid-request defers the free until that request finishes.
#[derive(Clone)]
pub struct Model {
    inner: Arc<LoadedModel>,
}

impl Model {
    pub(crate) fn new(engine: Arc<dyn Engine>, ptr: ModelPtr, path: PathBuf) -> Self {
        Self {
            inner: Arc::new(LoadedModel { engine, ptr, path }),
        }
    }

    /// Path the model was loaded from
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Native handle; valid while any clone of this `Model` is alive.
    pub fn handle(&self) -> ModelPtr {
        self.inner.ptr
    }

    pub(crate) fn engine(&self) -> &Arc<dyn Engine> {
        &self.inner.engine
    }

    /// Number of live clones, including in-flight requests
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("path", &self.inner.path)
            .field("handle", &self.inner.ptr)
            .finish()
    }
}
