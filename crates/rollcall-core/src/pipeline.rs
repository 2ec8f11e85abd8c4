//! Photo → per-face recognition results + annotated rendering.
//!
//! A [`RecognitionPipeline`] only exists once its encoder is ready; there is
//! no "initialized" flag to check. The pipeline writes nothing but annotated
//! output images, so a failed run has no attendance side effects.

use crate::annotate::{self, AnnotateError, Annotator};
use crate::config::Config;
use crate::encoder::{CommandEncoder, EncoderError, FaceEncoder};
use crate::gallery::{Gallery, GalleryCache};
use crate::index::IndexError;
use crate::matcher::{self, CosineMatcher, MatchError, Matcher};
use crate::retention::{self, ANNOTATED_EXTENSION, ANNOTATED_PREFIX};
use crate::types::{FaceObservation, RecognitionResult, UNKNOWN};
use image::RgbImage;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("recognition not ready: {0}")]
    NotReady(String),
    #[error("cannot read image {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("cannot write annotated image {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("annotated image encode failed: {0}")]
    Render(#[source] image::ImageError),
    #[error("face encoder error: {0}")]
    Encoder(EncoderError),
    #[error(transparent)]
    Annotate(#[from] AnnotateError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Match(#[from] MatchError),
}

impl From<EncoderError> for PipelineError {
    fn from(e: EncoderError) -> Self {
        match e {
            EncoderError::NotReady(msg) => PipelineError::NotReady(msg),
            other => PipelineError::Encoder(other),
        }
    }
}

/// Where and how many annotated images are kept.
#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub dir: PathBuf,
    pub keep: usize,
}

impl OutputSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dir: config.output_dir.clone(),
            keep: config.max_recent_captures,
        }
    }
}

/// Result of recognizing one photo.
#[derive(Debug, Clone, Serialize)]
pub struct Recognition {
    pub faces_found: usize,
    pub recognized: usize,
    pub results: Vec<RecognitionResult>,
    pub annotated_path: PathBuf,
    pub annotated_filename: String,
    /// `data:image/jpeg;base64,...`
    #[serde(rename = "annotated_image")]
    pub annotated_data_url: String,
}

pub struct RecognitionPipeline {
    encoder: Box<dyn FaceEncoder>,
    gallery: Arc<GalleryCache>,
    matcher: CosineMatcher,
    annotator: Annotator,
    output: OutputSettings,
}

impl RecognitionPipeline {
    /// Assemble a ready pipeline. Fails loudly if the output directory or
    /// the gallery cannot be prepared.
    pub fn new(
        encoder: Box<dyn FaceEncoder>,
        gallery: Arc<GalleryCache>,
        annotator: Annotator,
        output: OutputSettings,
    ) -> Result<Self, PipelineError> {
        std::fs::create_dir_all(&output.dir).map_err(|source| PipelineError::Output {
            path: output.dir.clone(),
            source,
        })?;
        let snapshot = gallery.snapshot()?;
        tracing::info!(
            identities = snapshot.identity_count(),
            rows = snapshot.len(),
            dim = snapshot.dim(),
            output = %output.dir.display(),
            labels = annotator.has_labels(),
            "recognition pipeline ready"
        );
        Ok(Self {
            encoder,
            gallery,
            matcher: CosineMatcher,
            annotator,
            output,
        })
    }

    /// Build with the configured [`CommandEncoder`] and font.
    pub fn from_config(config: &Config, gallery: Arc<GalleryCache>) -> Result<Self, PipelineError> {
        let encoder = CommandEncoder::from_config(config)?;
        let annotator = Annotator::from_font_path(config.font_path.as_deref())?;
        Self::new(
            Box::new(encoder),
            gallery,
            annotator,
            OutputSettings::from_config(config),
        )
    }

    pub fn gallery(&self) -> &Arc<GalleryCache> {
        &self.gallery
    }

    pub fn encoder_mut(&mut self) -> &mut dyn FaceEncoder {
        self.encoder.as_mut()
    }

    /// Decode `photo` and run the encoder on it.
    pub fn observe(&mut self, photo: &Path) -> Result<(RgbImage, Vec<FaceObservation>), PipelineError> {
        let image = load_rgb(photo)?;
        let faces = self.encoder.encode(&image)?;
        Ok((image, faces))
    }

    /// Recognize every face in `photo` against one gallery snapshot.
    ///
    /// The snapshot is reloaded from storage on every call so identities
    /// enrolled or removed by other processes take effect immediately.
    pub fn recognize(&mut self, photo: &Path, threshold: f32) -> Result<Recognition, PipelineError> {
        let threshold = matcher::check_threshold(threshold)?;
        let (mut image, faces) = self.observe(photo)?;
        let gallery = self.gallery.reload()?;
        let results = match_observations(&self.matcher, &gallery, &faces, threshold)?;
        let recognized = results.iter().filter(|r| r.is_match()).count();

        self.annotator.draw(&mut image, &results);
        let jpeg = annotate::encode_jpeg(&image).map_err(PipelineError::Render)?;

        let annotated_filename = annotated_file_name(photo, &chrono::Local::now());
        let annotated_path = self.output.dir.join(&annotated_filename);
        std::fs::write(&annotated_path, &jpeg).map_err(|source| PipelineError::Output {
            path: annotated_path.clone(),
            source,
        })?;

        match retention::cleanup_keeping(
            &self.output.dir,
            ANNOTATED_PREFIX,
            ANNOTATED_EXTENSION,
            self.output.keep,
            &annotated_path,
        ) {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed, "old annotated images cleaned up"),
            Err(e) => tracing::warn!(error = %e, "annotated image cleanup failed"),
        }

        tracing::info!(
            photo = %photo.display(),
            faces_found = faces.len(),
            recognized,
            threshold,
            gallery_rows = gallery.len(),
            "photo recognized"
        );

        Ok(Recognition {
            faces_found: faces.len(),
            recognized,
            results,
            annotated_path,
            annotated_filename,
            annotated_data_url: annotate::jpeg_data_url(&jpeg),
        })
    }
}

/// Match each observation independently, preserving order.
///
/// Observations without an embedding are reported as unknown.
pub fn match_observations(
    matcher: &dyn Matcher,
    gallery: &Gallery,
    faces: &[FaceObservation],
    threshold: f32,
) -> Result<Vec<RecognitionResult>, MatchError> {
    faces
        .iter()
        .map(|face| {
            let (name, confidence) = match &face.embedding {
                Some(embedding) => {
                    let m = matcher.compare(embedding, gallery, threshold)?;
                    (m.name().to_string(), m.confidence)
                }
                None => (UNKNOWN.to_string(), 0.0),
            };
            Ok(RecognitionResult {
                name,
                confidence,
                bbox: face.bbox,
                landmarks: face.landmarks.clone(),
            })
        })
        .collect()
}

pub fn load_rgb(path: &Path) -> Result<RgbImage, PipelineError> {
    image::open(path)
        .map(|img| img.to_rgb8())
        .map_err(|source| PipelineError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// `annotated_<stem>_<YYYYmmdd_HHMMSS>.jpg`, never nesting the prefix.
pub fn annotated_file_name<Tz>(photo: &Path, at: &chrono::DateTime<Tz>) -> String
where
    Tz: chrono::TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let stem = photo
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut clean = stem.as_str();
    while let Some(rest) = clean.strip_prefix(ANNOTATED_PREFIX) {
        clean = rest;
    }
    format!(
        "{ANNOTATED_PREFIX}{clean}_{}.{ANNOTATED_EXTENSION}",
        at.format("%Y%m%d_%H%M%S")
    )
}
