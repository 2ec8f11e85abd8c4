//! Enrollment: turn identity photos into stored gallery vectors.

use crate::encoder::{EncoderError, FaceEncoder};
use crate::gallery::GalleryCache;
use crate::index::{IndexError, PutMode};
use crate::types::{Embedding, FaceObservation};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Photo extensions picked up from dataset directories (case-insensitive).
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("no usable face found for {0:?}")]
    NoFaces(String),
    #[error("encoder not ready: {0}")]
    NotReady(String),
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Index(#[from] IndexError),
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollSummary {
    pub identity: String,
    /// Images examined.
    pub images: usize,
    /// Embeddings extracted from those images.
    pub embeddings: usize,
    /// Vectors stored for the identity after the write.
    pub stored: usize,
}

/// Extract one embedding per image and store them under `name`.
///
/// From each image the first detected face that carries an embedding is
/// used. Unreadable images and images without a usable face
/// are skipped with a warning.
pub fn enroll_images(
    encoder: &mut dyn FaceEncoder,
    gallery: &GalleryCache,
    name: &str,
    images: &[PathBuf],
    mode: PutMode,
) -> Result<EnrollSummary, EnrollError> {
    let mut embeddings = Vec::with_capacity(images.len());
    for path in images {
        match embed_image(encoder, path) {
            Ok(Some(embedding)) => embeddings.push(embedding),
            Ok(None) => tracing::warn!(identity = name, image = %path.display(), "no usable face; skipped"),
            Err(ImageFailure::NotReady(msg)) => return Err(EnrollError::NotReady(msg)),
            Err(ImageFailure::Skip(reason)) => {
                tracing::warn!(identity = name, image = %path.display(), %reason, "image skipped")
            }
        }
    }

    if embeddings.is_empty() {
        return Err(EnrollError::NoFaces(name.to_string()));
    }

    let stored = gallery.put_embeddings(name, &embeddings, mode)?;
    tracing::info!(
        identity = name,
        images = images.len(),
        embeddings = embeddings.len(),
        stored,
        "identity enrolled"
    );
    Ok(EnrollSummary {
        identity: name.to_string(),
        images: images.len(),
        embeddings: embeddings.len(),
        stored,
    })
}

/// Enroll every identity under `dir`: one subdirectory per identity, named
/// after it, holding that identity's photos.
///
/// Each identity replaces its stored vectors. Identities without a usable
/// face are skipped; the rest are still enrolled.
pub fn enroll_dataset(
    encoder: &mut dyn FaceEncoder,
    gallery: &GalleryCache,
    dir: &Path,
) -> Result<Vec<EnrollSummary>, EnrollError> {
    let io_err = |source| EnrollError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut identities: Vec<(String, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if !entry.file_type().map_err(io_err)?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            identities.push((name.to_string(), entry.path()));
        }
    }
    identities.sort();

    let mut summaries = Vec::new();
    for (name, path) in identities {
        let images = list_images(&path)?;
        if images.is_empty() {
            tracing::warn!(identity = %name, "no images in dataset directory; skipped");
            continue;
        }
        match enroll_images(encoder, gallery, &name, &images, PutMode::Replace) {
            Ok(summary) => summaries.push(summary),
            Err(EnrollError::NoFaces(_)) => {
                tracing::warn!(identity = %name, "no faces found in dataset images; skipped")
            }
            Err(e) => return Err(e),
        }
    }
    tracing::info!(dir = %dir.display(), enrolled = summaries.len(), "dataset enrollment finished");
    Ok(summaries)
}

/// Image files directly inside `dir`, sorted by path.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>, EnrollError> {
    let io_err = |source| EnrollError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_file() && is_image(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

/// The embedding of the first face that has one.
pub fn first_embedding(faces: Vec<FaceObservation>) -> Option<Embedding> {
    faces.into_iter().find_map(|f| f.embedding)
}

enum ImageFailure {
    NotReady(String),
    Skip(String),
}

fn embed_image(encoder: &mut dyn FaceEncoder, path: &Path) -> Result<Option<Embedding>, ImageFailure> {
    let image = image::open(path)
        .map_err(|e| ImageFailure::Skip(e.to_string()))?
        .to_rgb8();
    match encoder.encode(&image) {
        Ok(faces) => Ok(first_embedding(faces)),
        Err(EncoderError::NotReady(msg)) => Err(ImageFailure::NotReady(msg)),
        Err(e) => Err(ImageFailure::Skip(e.to_string())),
    }
}
