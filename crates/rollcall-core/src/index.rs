//! Durable embedding index: one `.npy` matrix per identity plus a JSON manifest.
//!
//! Layout inside the encodings directory:
//!
//! ```text
//! index.json              {"Alice Smith": "alice_smith-3f1c9a0e.npy", ...}
//! alice_smith-3f1c9a0e.npy   f32, shape (count, D)
//! ```
//!
//! Every file is written to a temp file in the same directory and renamed
//! into place. Vector files are always renamed before the manifest that
//! references them, so a concurrent reader never sees a manifest entry that
//! points at a half-written file.

use crate::gallery::Gallery;
use crate::types::{Embedding, UNKNOWN};
use ndarray::{concatenate, Array2, ArrayD, ArrayView2, Axis, Ix1, Ix2};
use ndarray_npy::{ReadNpyExt, WriteNpyError, WriteNpyExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// File name of the manifest inside the encodings directory.
pub const MANIFEST_FILE: &str = "index.json";

const KEY_STEM_MAX: usize = 48;
const KEY_HASH_HEX: usize = 8;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("storage write failed for {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("vector write failed for {path}: {source}")]
    VectorWrite {
        path: PathBuf,
        #[source]
        source: WriteNpyError,
    },
    #[error("schema error: {0}")]
    Schema(String),
    #[error("embedding dimension mismatch: gallery has {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("identity not found: {0}")]
    NotFound(String),
}

/// How `put` treats vectors already stored for the identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PutMode {
    /// Discard the previous set.
    #[default]
    Replace,
    /// Concatenate onto the previous set.
    Append,
}

/// Manifest entry as reported by [`EmbeddingIndex::identities`].
#[derive(Debug, Clone, Serialize)]
pub struct IdentitySummary {
    pub name: String,
    pub file: String,
    pub present: bool,
    pub vectors: usize,
}

type Manifest = BTreeMap<String, String>;

/// Filesystem-backed identity → vectors store.
pub struct EmbeddingIndex {
    dir: PathBuf,
    default_dim: usize,
    /// Serializes manifest read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl EmbeddingIndex {
    /// Open (creating if needed) the index rooted at `dir`.
    ///
    /// `default_dim` is only used to shape the empty gallery; the first
    /// `put` defines the real dimension.
    pub fn open(dir: impl Into<PathBuf>, default_dim: usize) -> Result<Self, IndexError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| IndexError::Storage {
            path: dir.clone(),
            source,
        })?;
        tracing::debug!(dir = %dir.display(), default_dim, "embedding index opened");
        Ok(Self {
            dir,
            default_dim,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    pub fn default_dim(&self) -> usize {
        self.default_dim
    }

    /// Store `vectors` (shape `(count, D)`) for `name`.
    ///
    /// Returns the number of vectors stored for the identity afterwards.
    pub fn put(
        &self,
        name: &str,
        vectors: ArrayView2<'_, f32>,
        mode: PutMode,
    ) -> Result<usize, IndexError> {
        if name.trim().is_empty() {
            return Err(IndexError::Schema("identity name is empty".into()));
        }
        if name.trim() == UNKNOWN {
            return Err(IndexError::Schema(format!(
                "{UNKNOWN:?} is reserved for unmatched faces"
            )));
        }
        if vectors.nrows() == 0 {
            return Err(IndexError::Schema(format!("no vectors given for {name:?}")));
        }
        if vectors.ncols() == 0 {
            return Err(IndexError::Schema(format!("zero-length vectors given for {name:?}")));
        }

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut manifest = self.read_manifest()?;

        let exclude = match mode {
            PutMode::Replace => Some(name),
            PutMode::Append => None,
        };
        if let Some(expected) = self.stored_dim(&manifest, exclude)? {
            if expected != vectors.ncols() {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    actual: vectors.ncols(),
                });
            }
        }

        let merged = match (mode, manifest.get(name)) {
            (PutMode::Append, Some(file)) if self.dir.join(file).exists() => {
                let previous = read_vectors(&self.dir.join(file))?;
                concatenate(Axis(0), &[previous.view(), vectors.view()])
                    .map_err(|e| IndexError::Schema(format!("append for {name:?}: {e}")))?
            }
            _ => vectors.to_owned(),
        };

        let file_name = storage_key(name);
        let target = self.dir.join(&file_name);
        self.write_vectors(&target, merged.view())?;

        let previous = manifest.insert(name.to_string(), file_name.clone());
        self.write_manifest(&manifest)?;

        // Legacy entries may use a different file name; drop the orphan.
        if let Some(old) = previous.filter(|old| *old != file_name) {
            let _ = fs::remove_file(self.dir.join(old));
        }

        tracing::info!(
            identity = name,
            file = %file_name,
            vectors = merged.nrows(),
            dim = merged.ncols(),
            ?mode,
            "identity stored"
        );
        Ok(merged.nrows())
    }

    /// Convenience wrapper over [`put`](Self::put) for a list of embeddings.
    pub fn put_embeddings(
        &self,
        name: &str,
        embeddings: &[Embedding],
        mode: PutMode,
    ) -> Result<usize, IndexError> {
        let matrix = embeddings_to_matrix(embeddings)?;
        self.put(name, matrix.view(), mode)
    }

    /// Materialize the whole gallery in manifest order.
    ///
    /// A missing or empty manifest yields an empty `(0, D)` gallery. Entries
    /// whose vector file is missing are skipped.
    pub fn load_all(&self) -> Result<Gallery, IndexError> {
        let manifest = self.read_manifest()?;

        let mut names = Vec::new();
        let mut blocks: Vec<Array2<f32>> = Vec::new();
        let mut dim: Option<usize> = None;

        for (name, file) in &manifest {
            let path = self.dir.join(file);
            if !path.exists() {
                tracing::warn!(identity = %name, file = %file, "manifest entry points at missing file; skipping");
                continue;
            }
            let block = read_vectors(&path)?;
            match dim {
                Some(expected) if expected != block.ncols() => {
                    return Err(IndexError::DimensionMismatch {
                        expected,
                        actual: block.ncols(),
                    });
                }
                _ => dim = Some(block.ncols()),
            }
            names.extend(std::iter::repeat(name.clone()).take(block.nrows()));
            blocks.push(block);
        }

        let dim = dim.unwrap_or(self.default_dim);
        let vectors = if blocks.is_empty() {
            Array2::zeros((0, dim))
        } else {
            let views: Vec<_> = blocks.iter().map(|b| b.view()).collect();
            concatenate(Axis(0), &views)
                .map_err(|e| IndexError::Schema(format!("gallery concatenation: {e}")))?
        };

        tracing::debug!(
            identities = manifest.len(),
            rows = vectors.nrows(),
            dim,
            "gallery materialized"
        );
        Gallery::new(names, vectors)
    }

    /// List manifest entries with their on-disk state.
    pub fn identities(&self) -> Result<Vec<IdentitySummary>, IndexError> {
        let manifest = self.read_manifest()?;
        let mut out = Vec::with_capacity(manifest.len());
        for (name, file) in manifest {
            let path = self.dir.join(&file);
            let present = path.exists();
            let vectors = if present { read_vectors(&path)?.nrows() } else { 0 };
            out.push(IdentitySummary {
                name,
                file,
                present,
                vectors,
            });
        }
        Ok(out)
    }

    /// Remove an identity: manifest first, then its vector file.
    pub fn remove(&self, name: &str) -> Result<(), IndexError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut manifest = self.read_manifest()?;
        let file = manifest
            .remove(name)
            .ok_or_else(|| IndexError::NotFound(name.to_string()))?;
        self.write_manifest(&manifest)?;

        let path = self.dir.join(&file);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(file = %path.display(), error = %e, "failed to delete vector file");
            }
        }
        tracing::info!(identity = name, "identity removed");
        Ok(())
    }

    fn read_manifest(&self) -> Result<Manifest, IndexError> {
        let path = self.manifest_path();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Manifest::new()),
            Err(source) => return Err(IndexError::Io { path, source }),
        };
        if text.trim().is_empty() {
            return Ok(Manifest::new());
        }
        serde_json::from_str(&text)
            .map_err(|e| IndexError::Schema(format!("corrupt manifest {}: {e}", path.display())))
    }

    fn write_manifest(&self, manifest: &Manifest) -> Result<(), IndexError> {
        let path = self.manifest_path();
        let body = serde_json::to_vec_pretty(manifest)
            .map_err(|e| IndexError::Schema(format!("manifest encode: {e}")))?;
        self.atomic_write(&path, |w| w.write_all(&body))
    }

    fn write_vectors(&self, path: &Path, vectors: ArrayView2<'_, f32>) -> Result<(), IndexError> {
        let mut body = Vec::new();
        vectors
            .write_npy(&mut body)
            .map_err(|source| IndexError::VectorWrite {
                path: path.to_path_buf(),
                source,
            })?;
        self.atomic_write(path, |w| w.write_all(&body))
    }

    /// Write through a temp file in the index directory, fsync, then rename over `path`.
    fn atomic_write<F>(&self, path: &Path, fill: F) -> Result<(), IndexError>
    where
        F: FnOnce(&mut BufWriter<&mut File>) -> std::io::Result<()>,
    {
        let storage = |source| IndexError::Storage {
            path: path.to_path_buf(),
            source,
        };

        let mut tmp = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(&self.dir)
            .map_err(storage)?;
        {
            let mut w = BufWriter::new(tmp.as_file_mut());
            fill(&mut w).map_err(storage)?;
            w.flush().map_err(storage)?;
        }
        tmp.as_file().sync_all().map_err(storage)?;
        tmp.persist(path).map_err(|e| storage(e.error))?;
        Ok(())
    }

    /// Dimension of the first readable stored entry, ignoring `exclude`.
    fn stored_dim(
        &self,
        manifest: &Manifest,
        exclude: Option<&str>,
    ) -> Result<Option<usize>, IndexError> {
        for (name, file) in manifest {
            if Some(name.as_str()) == exclude {
                continue;
            }
            let path = self.dir.join(file);
            if path.exists() {
                return Ok(Some(read_vectors(&path)?.ncols()));
            }
        }
        Ok(None)
    }
}

/// Derive a filesystem-safe file name from an identity name.
///
/// The readable stem keeps ASCII alphanumerics, `-` and `_`; the hash suffix
/// keeps names that sanitize identically (e.g. `"Zoë"` and `"Zo"`) apart.
pub fn storage_key(name: &str) -> String {
    let mut stem: String = name
        .trim()
        .chars()
        .filter_map(|c| match c {
            c if c.is_ascii_alphanumeric() || c == '-' || c == '_' => Some(c.to_ascii_lowercase()),
            c if c.is_whitespace() || c == '.' => Some('_'),
            _ => None,
        })
        .take(KEY_STEM_MAX)
        .collect();
    stem = stem.trim_matches('_').to_string();
    if stem.is_empty() {
        stem.push_str("identity");
    }

    let digest = Sha256::digest(name.as_bytes());
    let hash: String = digest
        .iter()
        .take(KEY_HASH_HEX / 2)
        .map(|b| format!("{b:02x}"))
        .collect();
    format!("{stem}-{hash}.npy")
}

/// Stack embeddings into a `(count, D)` matrix; ragged input is a schema error.
pub fn embeddings_to_matrix(embeddings: &[Embedding]) -> Result<Array2<f32>, IndexError> {
    let dim = embeddings.first().map(Embedding::dim).unwrap_or(0);
    if let Some(bad) = embeddings.iter().find(|e| e.dim() != dim) {
        return Err(IndexError::DimensionMismatch {
            expected: dim,
            actual: bad.dim(),
        });
    }
    let flat: Vec<f32> = embeddings
        .iter()
        .flat_map(|e| e.values.iter().copied())
        .collect();
    Array2::from_shape_vec((embeddings.len(), dim), flat)
        .map_err(|e| IndexError::Schema(format!("embedding matrix: {e}")))
}

fn read_vectors(path: &Path) -> Result<Array2<f32>, IndexError> {
    let file = File::open(path).map_err(|source| IndexError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let corrupt = |e: &dyn std::fmt::Display| {
        IndexError::Schema(format!("corrupt vector file {}: {e}", path.display()))
    };

    let raw = ArrayD::<f32>::read_npy(BufReader::new(file)).map_err(|e| corrupt(&e))?;
    match raw.ndim() {
        // Legacy single-vector files.
        1 => raw
            .into_dimensionality::<Ix1>()
            .map(|row| row.insert_axis(Axis(0)))
            .map_err(|e| corrupt(&e)),
        2 => raw.into_dimensionality::<Ix2>().map_err(|e| corrupt(&e)),
        d => Err(corrupt(&format!("expected 1 or 2 dimensions, found {d}"))),
    }
}
