//! Materialized gallery snapshots.
//!
//! A [`Gallery`] is immutable once built. [`GalleryCache`] hands out
//! `Arc<Gallery>` snapshots and swaps in a freshly loaded one after writes;
//! holders of an older snapshot keep matching against it undisturbed.
//!
//! The cache only sees writes made through it. Callers that must observe
//! writes from other processes use [`GalleryCache::reload`].

use crate::index::{EmbeddingIndex, IndexError, PutMode};
use crate::types::Embedding;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use std::sync::{Arc, PoisonError, RwLock};

/// All enrolled vectors, row-aligned with their owning identity names.
#[derive(Debug, Clone)]
pub struct Gallery {
    names: Vec<String>,
    vectors: Array2<f32>,
    /// Rows pre-scaled to unit length for cosine scoring.
    unit: Array2<f32>,
}

impl Gallery {
    pub fn new(names: Vec<String>, vectors: Array2<f32>) -> Result<Self, IndexError> {
        if names.len() != vectors.nrows() {
            return Err(IndexError::Schema(format!(
                "gallery has {} names for {} rows",
                names.len(),
                vectors.nrows()
            )));
        }
        let mut unit = vectors.clone();
        for mut row in unit.axis_iter_mut(Axis(0)) {
            let norm = row.dot(&row).sqrt() + Embedding::EPSILON;
            row.mapv_inplace(|x| x / norm);
        }
        Ok(Self {
            names,
            vectors,
            unit,
        })
    }

    /// Empty `(0, dim)` gallery.
    pub fn empty(dim: usize) -> Self {
        Self {
            names: Vec::new(),
            vectors: Array2::zeros((0, dim)),
            unit: Array2::zeros((0, dim)),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.vectors.ncols()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn name(&self, row: usize) -> Option<&str> {
        self.names.get(row).map(String::as_str)
    }

    /// Raw vectors as stored.
    pub fn vectors(&self) -> ArrayView2<'_, f32> {
        self.vectors.view()
    }

    /// Unit-length rows, index-aligned with [`names`](Self::names).
    pub fn unit_rows(&self) -> ArrayView2<'_, f32> {
        self.unit.view()
    }

    /// Number of distinct identities.
    pub fn identity_count(&self) -> usize {
        let mut names: Vec<&str> = self.names.iter().map(String::as_str).collect();
        names.dedup();
        names.len()
    }

    /// Stored rows belonging to `name`.
    pub fn rows_for<'a>(&'a self, name: &'a str) -> impl Iterator<Item = ArrayView1<'a, f32>> + 'a {
        self.names
            .iter()
            .zip(self.vectors.rows())
            .filter(move |(n, _)| n.as_str() == name)
            .map(|(_, row)| row)
    }
}

/// Lazily loaded, explicitly invalidated gallery snapshot over an index.
pub struct GalleryCache {
    index: EmbeddingIndex,
    current: RwLock<Slot>,
}

#[derive(Default)]
struct Slot {
    /// Bumped by every invalidation.
    generation: u64,
    gallery: Option<Arc<Gallery>>,
}

impl GalleryCache {
    pub fn new(index: EmbeddingIndex) -> Self {
        Self {
            index,
            current: RwLock::new(Slot::default()),
        }
    }

    pub fn index(&self) -> &EmbeddingIndex {
        &self.index
    }

    /// Current snapshot, loading it from the index if none is cached.
    pub fn snapshot(&self) -> Result<Arc<Gallery>, IndexError> {
        if let Some(gallery) = self
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .gallery
            .as_ref()
        {
            return Ok(Arc::clone(gallery));
        }
        self.reload()
    }

    /// Load a fresh snapshot from storage and make it current.
    ///
    /// A snapshot whose load raced with an [`invalidate`](Self::invalidate)
    /// is returned but not cached.
    pub fn reload(&self) -> Result<Arc<Gallery>, IndexError> {
        let generation = self.generation();
        let fresh = Arc::new(self.index.load_all()?);
        let cached = self.install(generation, Arc::clone(&fresh));
        tracing::debug!(
            rows = fresh.len(),
            identities = fresh.identity_count(),
            cached,
            "gallery snapshot reloaded"
        );
        Ok(fresh)
    }

    /// Drop the cached snapshot; the next `snapshot()` reloads.
    pub fn invalidate(&self) {
        let mut slot = self.current.write().unwrap_or_else(PoisonError::into_inner);
        slot.generation = slot.generation.wrapping_add(1);
        slot.gallery = None;
    }

    fn generation(&self) -> u64 {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .generation
    }

    /// Cache `gallery` unless an invalidation happened since `generation`.
    fn install(&self, generation: u64, gallery: Arc<Gallery>) -> bool {
        let mut slot = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if slot.generation != generation {
            return false;
        }
        slot.gallery = Some(gallery);
        true
    }

    /// [`EmbeddingIndex::put`] followed by invalidation.
    pub fn put_embeddings(
        &self,
        name: &str,
        embeddings: &[Embedding],
        mode: PutMode,
    ) -> Result<usize, IndexError> {
        let stored = self.index.put_embeddings(name, embeddings, mode);
        self.invalidate();
        stored
    }

    /// [`EmbeddingIndex::remove`] followed by invalidation.
    pub fn remove(&self, name: &str) -> Result<(), IndexError> {
        let removed = self.index.remove(name);
        self.invalidate();
        removed
    }
}
