use crate::matcher::{RECOGNITION_THRESHOLD, REVERIFY_THRESHOLD};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Embedding width produced by ArcFace-family encoders.
pub const DEFAULT_EMBEDDING_DIM: usize = 512;
/// Annotated captures kept in the output directory.
pub const MAX_RECENT_CAPTURES: usize = 20;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Runtime configuration shared by the daemon and the CLI.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root for all generated data.
    pub data_dir: PathBuf,
    /// Embedding index directory (manifest + `.npy` files).
    pub encodings_dir: PathBuf,
    /// Per-identity enrollment photos, one subdirectory per identity.
    pub dataset_dir: PathBuf,
    /// Where annotated recognition images are written.
    pub output_dir: PathBuf,
    /// SQLite database holding the roster, sessions and attendance.
    pub db_path: PathBuf,
    /// JSON log of recent recognitions.
    pub timeline_path: PathBuf,
    /// Dimension of an empty gallery.
    pub embedding_dim: usize,
    /// Cosine similarity threshold for class-photo recognition.
    pub recognition_threshold: f32,
    /// Cosine similarity threshold for re-verification.
    pub reverify_threshold: f32,
    /// Annotated images retained by cleanup.
    pub max_recent_captures: usize,
    /// External face encoder program.
    pub encoder_command: Option<PathBuf>,
    pub encoder_args: Vec<String>,
    /// TrueType font for annotation labels; boxes only when unset.
    pub font_path: Option<PathBuf>,
}

/// On-disk TOML layout; every key optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    data_dir: Option<PathBuf>,
    encodings_dir: Option<PathBuf>,
    dataset_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    timeline_path: Option<PathBuf>,
    embedding_dim: Option<usize>,
    recognition_threshold: Option<f32>,
    reverify_threshold: Option<f32>,
    max_recent_captures: Option<usize>,
    encoder_command: Option<PathBuf>,
    encoder_args: Option<Vec<String>>,
    font_path: Option<PathBuf>,
}

impl Config {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            encodings_dir: data_dir.join("encodings"),
            dataset_dir: data_dir.join("dataset"),
            output_dir: data_dir.join("uploads"),
            db_path: data_dir.join("attendance.db"),
            timeline_path: data_dir.join("timeline.json"),
            data_dir,
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            recognition_threshold: RECOGNITION_THRESHOLD,
            reverify_threshold: REVERIFY_THRESHOLD,
            max_recent_captures: MAX_RECENT_CAPTURES,
            encoder_command: None,
            encoder_args: Vec::new(),
            font_path: None,
        }
    }

    /// Load defaults, then the TOML file named by `ROLLCALL_CONFIG` (if any),
    /// then `ROLLCALL_*` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let data_dir = std::env::var("ROLLCALL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());
        let mut config = Self::with_data_dir(data_dir);

        if let Ok(path) = std::env::var("ROLLCALL_CONFIG") {
            config.apply_file(Path::new(&path))?;
        }
        config.apply_env();
        Ok(config)
    }

    /// Merge a TOML file over the current values.
    ///
    /// A `data_dir` key re-roots every path not set explicitly in the same file.
    pub fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(dir) = file.data_dir {
            let rerooted = Self::with_data_dir(dir);
            self.data_dir = rerooted.data_dir;
            self.encodings_dir = rerooted.encodings_dir;
            self.dataset_dir = rerooted.dataset_dir;
            self.output_dir = rerooted.output_dir;
            self.db_path = rerooted.db_path;
            self.timeline_path = rerooted.timeline_path;
        }
        set(&mut self.encodings_dir, file.encodings_dir);
        set(&mut self.dataset_dir, file.dataset_dir);
        set(&mut self.output_dir, file.output_dir);
        set(&mut self.db_path, file.db_path);
        set(&mut self.timeline_path, file.timeline_path);
        set(&mut self.embedding_dim, file.embedding_dim);
        set(&mut self.recognition_threshold, file.recognition_threshold);
        set(&mut self.reverify_threshold, file.reverify_threshold);
        set(&mut self.max_recent_captures, file.max_recent_captures);
        set(&mut self.encoder_args, file.encoder_args);
        if file.encoder_command.is_some() {
            self.encoder_command = file.encoder_command;
        }
        if file.font_path.is_some() {
            self.font_path = file.font_path;
        }
        tracing::debug!(path = %path.display(), "config file applied");
        Ok(())
    }

    fn apply_env(&mut self) {
        set(&mut self.encodings_dir, env_path("ROLLCALL_ENCODINGS_DIR"));
        set(&mut self.dataset_dir, env_path("ROLLCALL_DATASET_DIR"));
        set(&mut self.output_dir, env_path("ROLLCALL_OUTPUT_DIR"));
        set(&mut self.db_path, env_path("ROLLCALL_DB_PATH"));
        set(&mut self.timeline_path, env_path("ROLLCALL_TIMELINE_PATH"));
        self.embedding_dim = env_usize("ROLLCALL_EMBEDDING_DIM", self.embedding_dim);
        self.recognition_threshold =
            env_f32("ROLLCALL_RECOGNITION_THRESHOLD", self.recognition_threshold);
        self.reverify_threshold = env_f32("ROLLCALL_REVERIFY_THRESHOLD", self.reverify_threshold);
        self.max_recent_captures =
            env_usize("ROLLCALL_MAX_RECENT_CAPTURES", self.max_recent_captures);
        if let Some(cmd) = env_path("ROLLCALL_ENCODER") {
            self.encoder_command = Some(cmd);
        }
        if let Ok(args) = std::env::var("ROLLCALL_ENCODER_ARGS") {
            self.encoder_args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Some(font) = env_path("ROLLCALL_FONT") {
            self.font_path = Some(font);
        }
    }

    /// Create every directory the configuration points into.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [&self.data_dir, &self.encodings_dir, &self.dataset_dir, &self.output_dir] {
            std::fs::create_dir_all(dir)?;
        }
        for file in [&self.db_path, &self.timeline_path] {
            if let Some(parent) = file.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
