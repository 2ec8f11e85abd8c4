//! Cosine similarity matching of one probe embedding against a gallery snapshot.

use crate::gallery::Gallery;
use crate::types::{Embedding, UNKNOWN};
use ndarray::ArrayView1;
use serde::Serialize;
use thiserror::Error;

/// Threshold for first-pass recognition of a class photo.
pub const RECOGNITION_THRESHOLD: f32 = 0.5;
/// Stricter threshold for re-verifying an identity.
pub const REVERIFY_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug, PartialEq)]
pub enum MatchError {
    #[error("probe has {actual} dimensions, gallery has {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("threshold {0} is outside [0, 1]")]
    InvalidThreshold(f32),
}

/// Accept only finite thresholds in `[0, 1]`.
pub fn check_threshold(threshold: f32) -> Result<f32, MatchError> {
    if (0.0..=1.0).contains(&threshold) {
        Ok(threshold)
    } else {
        Err(MatchError::InvalidThreshold(threshold))
    }
}

/// Outcome of matching one probe against a gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Confidence in [0, 1]; 0.0 when not matched.
    pub confidence: f32,
    /// Best raw cosine similarity seen, matched or not (0.0 for an empty gallery).
    pub best_similarity: f32,
    /// Matched identity (if any).
    pub identity: Option<String>,
    /// Gallery row of the match (if any).
    pub row: Option<usize>,
}

impl MatchResult {
    pub fn unknown(best_similarity: f32) -> Self {
        Self {
            matched: false,
            confidence: 0.0,
            best_similarity,
            identity: None,
            row: None,
        }
    }

    /// Identity name, or `"Unknown"`.
    pub fn name(&self) -> &str {
        self.identity.as_deref().unwrap_or(UNKNOWN)
    }
}

/// Strategy for comparing a probe embedding against a gallery.
///
/// The threshold is supplied per call; implementations hold no threshold state.
pub trait Matcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &Gallery,
        threshold: f32,
    ) -> Result<MatchResult, MatchError>;
}

/// Cosine similarity matcher.
///
/// Scans every gallery row; ties resolve to the lowest row index.
#[derive(Debug, Default, Clone, Copy)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &Gallery,
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        let threshold = check_threshold(threshold)?;
        if gallery.is_empty() {
            return Ok(MatchResult::unknown(0.0));
        }
        if probe.dim() != gallery.dim() {
            return Err(MatchError::DimensionMismatch {
                expected: gallery.dim(),
                actual: probe.dim(),
            });
        }

        let query = probe.normalized();
        let query = ArrayView1::from(query.values.as_slice());
        let scores = gallery.unit_rows().dot(&query);

        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;
        for (i, &sim) in scores.iter().enumerate() {
            // Strictly greater: the first of equal scores wins.
            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(i);
            }
        }

        let result = match best_idx {
            Some(idx) if best_sim >= threshold => MatchResult {
                matched: true,
                confidence: best_sim.clamp(0.0, 1.0),
                best_similarity: best_sim,
                identity: gallery.name(idx).map(str::to_string),
                row: Some(idx),
            },
            Some(_) => MatchResult::unknown(best_sim),
            // Every score was NaN.
            None => MatchResult::unknown(0.0),
        };

        tracing::trace!(
            rows = gallery.len(),
            threshold,
            best = result.best_similarity,
            identity = result.name(),
            "probe matched"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    fn gallery(names: &[&str], rows: Array2<f32>) -> Gallery {
        Gallery::new(names.iter().map(|s| s.to_string()).collect(), rows).unwrap()
    }

    fn unit_vec(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn test_identical_vector_matches_with_full_confidence() {
        let g = gallery(
            &["decoy1", "decoy2", "match"],
            array![[0.0f32, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]],
        );
        let result = CosineMatcher
            .compare(&Embedding::new(vec![1.0, 0.0, 0.0]), &g, RECOGNITION_THRESHOLD)
            .unwrap();
        assert!(result.matched);
        assert_eq!(result.identity.as_deref(), Some("match"));
        assert_eq!(result.row, Some(2));
        assert!((result.confidence - 1.0).abs() < 1e-6);
        assert!(result.confidence <= 1.0);
    }

    #[test]
    fn test_alice_bob_scenario() {
        let dim = 512;
        let mut rows = Array2::<f32>::zeros((2, dim));
        rows[[0, 0]] = 1.0;
        rows[[1, 1]] = 1.0;
        let g = gallery(&["alice", "bob"], rows);

        let mut q = vec![0.0f32; dim];
        q[0] = 0.98;
        q[1] = 0.2;
        let probe = Embedding::new(q).normalized();

        let result = CosineMatcher.compare(&probe, &g, 0.5).unwrap();
        assert_eq!(result.name(), "alice");
        let expected = 0.98 / (0.98f32 * 0.98 + 0.2 * 0.2).sqrt();
        assert!((result.confidence - expected).abs() < 1e-5);
        assert!(result.confidence > 0.9);
    }

    #[test]
    fn test_empty_gallery_is_unknown() {
        let result = CosineMatcher
            .compare(&Embedding::new(vec![1.0, 0.0]), &Gallery::empty(512), 0.5)
            .unwrap();
        assert!(!result.matched);
        assert_eq!(result.name(), UNKNOWN);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_below_threshold_is_unknown() {
        let g = gallery(&["other"], array![[0.0f32, 1.0, 0.0]]);
        let result = CosineMatcher
            .compare(&Embedding::new(vec![1.0, 0.0, 0.0]), &g, 0.5)
            .unwrap();
        assert!(!result.matched);
        assert_eq!(result.confidence, 0.0);
        assert!(result.best_similarity.abs() < 1e-6);
    }

    #[test]
    fn test_threshold_is_per_call() {
        let g = gallery(&["alice"], array![[1.0f32, 0.0]]);
        // cos = 0.8 / 1.0
        let probe = Embedding::new(vec![0.8, 0.6]);
        assert!(CosineMatcher.compare(&probe, &g, RECOGNITION_THRESHOLD).unwrap().matched);
        assert!(CosineMatcher.compare(&probe, &g, REVERIFY_THRESHOLD).unwrap().matched);
        assert!(!CosineMatcher.compare(&probe, &g, 0.9).unwrap().matched);
    }

    #[test]
    fn test_tie_resolves_to_lowest_row() {
        let row = unit_vec(4, 2);
        let rows = Array2::from_shape_vec((3, 4), [unit_vec(4, 0), row.clone(), row].concat()).unwrap();
        let g = gallery(&["x", "first", "second"], rows);
        let probe = Embedding::new(unit_vec(4, 2));
        for _ in 0..5 {
            let result = CosineMatcher.compare(&probe, &g, 0.5).unwrap();
            assert_eq!(result.row, Some(1));
            assert_eq!(result.name(), "first");
        }
    }

    #[test]
    fn test_deterministic() {
        let g = gallery(
            &["a", "b", "c"],
            array![[0.3f32, 0.1, 0.9], [0.5, 0.5, 0.1], [0.9, 0.2, 0.3]],
        );
        let probe = Embedding::new(vec![0.7, 0.3, 0.4]);
        let first = CosineMatcher.compare(&probe, &g, 0.5).unwrap();
        let second = CosineMatcher.compare(&probe, &g, 0.5).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_unnormalized_gallery_rows() {
        let g = gallery(&["a"], array![[10.0f32, 0.0]]);
        let result = CosineMatcher
            .compare(&Embedding::new(vec![3.0, 0.0]), &g, 0.99)
            .unwrap();
        assert!(result.matched);
        assert!(result.confidence <= 1.0);
    }

    #[test]
    fn test_out_of_range_threshold_is_rejected() {
        let g = gallery(&["alice"], array![[1.0f32, 0.0]]);
        let orthogonal = Embedding::new(vec![0.0, 1.0]);
        for bad in [-0.1f32, 1.5, f32::NAN, f32::INFINITY] {
            assert!(matches!(
                CosineMatcher.compare(&orthogonal, &g, bad),
                Err(MatchError::InvalidThreshold(_))
            ));
        }
        assert_eq!(check_threshold(1.0), Ok(1.0));
    }

    #[test]
    fn test_zero_probe_is_unknown() {
        let g = gallery(&["a"], array![[1.0f32, 0.0]]);
        let result = CosineMatcher
            .compare(&Embedding::new(vec![0.0, 0.0]), &g, 0.5)
            .unwrap();
        assert!(!result.matched);
        assert_eq!(result.best_similarity, 0.0);
    }

    #[test]
    fn test_dimension_mismatch() {
        let g = gallery(&["a"], array![[1.0f32, 0.0, 0.0]]);
        let err = CosineMatcher
            .compare(&Embedding::new(vec![1.0, 0.0]), &g, 0.5)
            .unwrap_err();
        assert_eq!(err, MatchError::DimensionMismatch { expected: 3, actual: 2 });
    }
}
