use serde::{Deserialize, Serialize};

/// Name reported for faces that did not clear the matching threshold.
pub const UNKNOWN: &str = "Unknown";

/// Axis-aligned face box in pixel coordinates: (x1, y1) top-left, (x2, y2) bottom-right.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }
}

impl From<[f32; 4]> for BoundingBox {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// Face embedding vector (typically 512-dimensional).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    /// Norm floor added to both sides of the cosine denominator.
    pub const EPSILON: f32 = 1e-10;

    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Cosine similarity in [-1, 1]; degenerate all-zero vectors score 0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let dot: f32 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum();
        dot / ((self.norm() + Self::EPSILON) * (other.norm() + Self::EPSILON))
    }

    /// Copy scaled to unit length (epsilon-guarded).
    pub fn normalized(&self) -> Embedding {
        let denom = self.norm() + Self::EPSILON;
        Embedding {
            values: self.values.iter().map(|x| x / denom).collect(),
        }
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

/// One detected face as reported by the external encoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceObservation {
    pub bbox: BoundingBox,
    #[serde(default)]
    pub landmarks: Vec<[f32; 2]>,
    #[serde(default)]
    pub embedding: Option<Embedding>,
    #[serde(rename = "det_score", default)]
    pub detector_score: f32,
}

/// Per-face recognition verdict, in the order the encoder reported faces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    #[serde(default)]
    pub landmarks: Vec<[f32; 2]>,
}

impl RecognitionResult {
    /// Matched identity, or `None` for unknown faces.
    pub fn identity(&self) -> Option<&str> {
        if self.name == UNKNOWN {
            None
        } else {
            Some(&self.name)
        }
    }

    pub fn is_match(&self) -> bool {
        self.identity().is_some()
    }
}
