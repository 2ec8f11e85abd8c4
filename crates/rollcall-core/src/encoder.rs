//! Boundary to the external face detector/encoder.
//!
//! The detection and embedding models live outside this crate. Anything that
//! turns pixels into [`FaceObservation`]s implements [`FaceEncoder`];
//! [`CommandEncoder`] drives an external program over stdin/stdout.

use crate::config::Config;
use crate::types::FaceObservation;
use image::{ImageFormat, RgbImage};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("encoder not ready: {0}")]
    NotReady(String),
    #[error("encoder failed: {0}")]
    Failed(String),
    #[error("encoder protocol error: {0}")]
    Protocol(String),
    #[error("image encode failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("encoder io: {0}")]
    Io(#[from] std::io::Error),
}

/// Detects faces in an RGB image and returns one observation per face.
///
/// Zero faces is a successful, empty result. Implementations may keep model
/// state between calls, hence `&mut self`.
pub trait FaceEncoder: Send {
    fn encode(&mut self, image: &RgbImage) -> Result<Vec<FaceObservation>, EncoderError>;
}

impl<F> FaceEncoder for F
where
    F: FnMut(&RgbImage) -> Result<Vec<FaceObservation>, EncoderError> + Send,
{
    fn encode(&mut self, image: &RgbImage) -> Result<Vec<FaceObservation>, EncoderError> {
        self(image)
    }
}

/// Runs an external encoder program once per image.
///
/// Protocol: the image is written to the program's stdin as PNG; the program
/// prints a JSON array of observations on stdout:
///
/// ```json
/// [{"bbox": [x1, y1, x2, y2], "landmarks": [[x, y], ...], "det_score": 0.93, "embedding": [...] | null}]
/// ```
///
/// Exit status 75 (`EX_TEMPFAIL`) means the encoder's models are not loaded.
#[derive(Debug, Clone)]
pub struct CommandEncoder {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandEncoder {
    /// `sysexits.h` EX_TEMPFAIL.
    pub const EXIT_NOT_READY: i32 = 75;

    /// Resolve `program` (absolute, relative, or on `PATH`). Fails if it cannot be found.
    pub fn new(program: impl AsRef<Path>, args: Vec<String>) -> Result<Self, EncoderError> {
        let requested = program.as_ref();
        let program = resolve_program(requested).ok_or_else(|| {
            EncoderError::NotReady(format!("encoder program not found: {}", requested.display()))
        })?;
        tracing::info!(program = %program.display(), ?args, "face encoder configured");
        Ok(Self { program, args })
    }

    pub fn from_config(config: &Config) -> Result<Self, EncoderError> {
        let program = config.encoder_command.as_ref().ok_or_else(|| {
            EncoderError::NotReady("no face encoder configured (set ROLLCALL_ENCODER)".into())
        })?;
        Self::new(program, config.encoder_args.clone())
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl FaceEncoder for CommandEncoder {
    fn encode(&mut self, image: &RgbImage) -> Result<Vec<FaceObservation>, EncoderError> {
        let mut png = Vec::new();
        image.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                EncoderError::NotReady(format!("cannot start {}: {e}", self.program.display()))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EncoderError::Failed("encoder stdin unavailable".into()))?;
        // Feed stdin from a separate thread so a chatty child cannot deadlock us.
        let writer = std::thread::spawn(move || stdin.write_all(&png));

        let output = child.wait_with_output()?;
        let written = writer
            .join()
            .map_err(|_| EncoderError::Failed("encoder stdin writer panicked".into()))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if !output.status.success() {
            return Err(match output.status.code() {
                Some(Self::EXIT_NOT_READY) => EncoderError::NotReady(stderr.to_string()),
                _ => EncoderError::Failed(format!("{}: {stderr}", output.status)),
            });
        }
        if let Err(e) = written {
            return Err(EncoderError::Protocol(format!(
                "encoder exited before reading the image: {e}"
            )));
        }

        let faces: Vec<FaceObservation> = serde_json::from_slice(&output.stdout)
            .map_err(|e| EncoderError::Protocol(format!("invalid observation JSON: {e}")))?;
        tracing::debug!(
            faces = faces.len(),
            width = image.width(),
            height = image.height(),
            "encoder returned observations"
        );
        Ok(faces)
    }
}

fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.is_absolute() || program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
