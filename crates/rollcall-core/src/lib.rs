//! rollcall-core: Face gallery, cosine matching and photo recognition.
//!
//! Face detection and embedding run in an external encoder program; this
//! crate stores enrolled embeddings, matches probes against them and renders
//! annotated results.

pub mod annotate;
pub mod config;
pub mod encoder;
pub mod enroll;
pub mod gallery;
pub mod index;
pub mod matcher;
pub mod pipeline;
pub mod retention;
pub mod timeline;
pub mod types;

pub use config::Config;
pub use encoder::{CommandEncoder, EncoderError, FaceEncoder};
pub use gallery::{Gallery, GalleryCache};
pub use index::{EmbeddingIndex, IndexError, PutMode};
pub use matcher::{CosineMatcher, MatchResult, Matcher};
pub use pipeline::{Recognition, RecognitionPipeline};
pub use types::{BoundingBox, Embedding, FaceObservation, RecognitionResult, UNKNOWN};
