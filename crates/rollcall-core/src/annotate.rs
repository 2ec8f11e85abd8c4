//! Draw recognition results onto the source photo.

use crate::types::RecognitionResult;
use ab_glyph::{FontVec, PxScale};
use base64::prelude::{Engine as _, BASE64_STANDARD};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::Path;
use thiserror::Error;

pub const MATCHED_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const UNMATCHED_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

const BOX_THICKNESS: u32 = 2;
const LABEL_SCALE: f32 = 16.0;
const LABEL_GAP: i32 = 4;
const JPEG_QUALITY: u8 = 90;

#[derive(Error, Debug)]
pub enum AnnotateError {
    #[error("cannot read font {path}: {source}")]
    FontIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid font {0}")]
    InvalidFont(String),
}

/// Renders face boxes (green matched, red unknown) and `name (0.87)` labels.
pub struct Annotator {
    font: Option<FontVec>,
}

impl std::fmt::Debug for Annotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Annotator")
            .field("labels", &self.font.is_some())
            .finish()
    }
}

impl Annotator {
    /// Boxes only; labels need a font.
    pub fn boxes_only() -> Self {
        Self { font: None }
    }

    pub fn with_font_file(path: &Path) -> Result<Self, AnnotateError> {
        let bytes = std::fs::read(path).map_err(|source| AnnotateError::FontIo {
            path: path.display().to_string(),
            source,
        })?;
        let font = FontVec::try_from_vec(bytes)
            .map_err(|_| AnnotateError::InvalidFont(path.display().to_string()))?;
        tracing::debug!(font = %path.display(), "annotation font loaded");
        Ok(Self { font: Some(font) })
    }

    pub fn from_font_path(path: Option<&Path>) -> Result<Self, AnnotateError> {
        match path {
            Some(path) => Self::with_font_file(path),
            None => {
                tracing::debug!("no annotation font configured; drawing boxes without labels");
                Ok(Self::boxes_only())
            }
        }
    }

    pub fn has_labels(&self) -> bool {
        self.font.is_some()
    }

    pub fn draw(&self, image: &mut RgbImage, results: &[RecognitionResult]) {
        for result in results {
            let color = if result.is_match() {
                MATCHED_COLOR
            } else {
                UNMATCHED_COLOR
            };
            let Some(rect) = clamp_rect(image, result) else {
                continue;
            };
            for inset in 0..BOX_THICKNESS {
                let w = rect.width().saturating_sub(2 * inset);
                let h = rect.height().saturating_sub(2 * inset);
                if w == 0 || h == 0 {
                    break;
                }
                let r = Rect::at(rect.left() + inset as i32, rect.top() + inset as i32).of_size(w, h);
                draw_hollow_rect_mut(image, r, color);
            }

            if let Some(font) = &self.font {
                let label = format!("{} ({:.2})", result.name, result.confidence);
                let y = (rect.top() - LABEL_SCALE as i32 - LABEL_GAP).max(0);
                draw_text_mut(image, color, rect.left(), y, PxScale::from(LABEL_SCALE), font, &label);
            }
        }
    }
}

/// Face box clipped to the image, or `None` when nothing is left.
fn clamp_rect(image: &RgbImage, result: &RecognitionResult) -> Option<Rect> {
    let (w, h) = (image.width() as f32, image.height() as f32);
    let x1 = result.bbox.x1.clamp(0.0, w).floor();
    let y1 = result.bbox.y1.clamp(0.0, h).floor();
    let x2 = result.bbox.x2.clamp(0.0, w).ceil();
    let y2 = result.bbox.y2.clamp(0.0, h).ceil();
    let (bw, bh) = ((x2 - x1) as u32, (y2 - y1) as u32);
    if bw == 0 || bh == 0 {
        return None;
    }
    Some(Rect::at(x1 as i32, y1 as i32).of_size(bw, bh))
}

pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY).encode_image(image)?;
    Ok(buf)
}

/// Inline `data:` URL for a JPEG payload.
pub fn jpeg_data_url(jpeg: &[u8]) -> String {
    format!("data:image/jpeg;base64,{}", BASE64_STANDARD.encode(jpeg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, UNKNOWN};

    fn result(name: &str, bbox: BoundingBox) -> RecognitionResult {
        RecognitionResult {
            name: name.into(),
            confidence: 0.9,
            bbox,
            landmarks: vec![],
        }
    }

    #[test]
    fn test_draw_uses_two_colors() {
        let mut img = RgbImage::new(100, 100);
        let results = vec![
            result("alice", BoundingBox::new(10.0, 10.0, 40.0, 40.0)),
            result(UNKNOWN, BoundingBox::new(50.0, 50.0, 90.0, 90.0)),
        ];
        Annotator::boxes_only().draw(&mut img, &results);
        assert_eq!(*img.get_pixel(10, 20), MATCHED_COLOR);
        assert_eq!(*img.get_pixel(11, 20), MATCHED_COLOR);
        assert_eq!(*img.get_pixel(50, 60), UNMATCHED_COLOR);
        // Interior untouched.
        assert_eq!(*img.get_pixel(25, 25), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_draw_clips_out_of_bounds_boxes() {
        let mut img = RgbImage::new(20, 20);
        let results = vec![
            result("alice", BoundingBox::new(-10.0, -10.0, 500.0, 500.0)),
            result("bob", BoundingBox::new(30.0, 30.0, 40.0, 40.0)),
        ];
        Annotator::boxes_only().draw(&mut img, &results);
        assert_eq!(*img.get_pixel(0, 5), MATCHED_COLOR);
    }

    #[test]
    fn test_encode_jpeg_and_data_url() {
        let img = RgbImage::from_pixel(16, 16, Rgb([200, 10, 10]));
        let jpeg = encode_jpeg(&img).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let url = jpeg_data_url(&jpeg);
        assert!(url.starts_with("data:image/jpeg;base64,/9j/"));
    }

    #[test]
    fn test_missing_font_is_error() {
        let err = Annotator::with_font_file(Path::new("/nonexistent/font.ttf")).unwrap_err();
        assert!(matches!(err, AnnotateError::FontIo { .. }));
        assert!(!Annotator::from_font_path(None).unwrap().has_labels());
        assert_eq!(format!("{:?}", Annotator::boxes_only()), "Annotator { labels: false }");
    }
}
