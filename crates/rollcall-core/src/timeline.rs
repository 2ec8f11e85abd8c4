//! Rolling JSON log of recent recognition runs, newest first.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use thiserror::Error;

/// Entries kept in the timeline file.
pub const TIMELINE_CAPACITY: usize = 100;

#[derive(Error, Debug)]
pub enum TimelineError {
    #[error("timeline io: {0}")]
    Io(#[from] std::io::Error),
    #[error("timeline json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub timestamp: String,
    pub photo: String,
    pub marked: usize,
    pub faces_found: usize,
    pub subject_id: i64,
    pub teacher_id: i64,
}

/// Read the timeline; a missing or empty file is an empty timeline.
pub fn read(path: &Path) -> Result<Vec<TimelineEntry>, TimelineError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(&text)?)
}

/// Prepend `entry`, trim to [`TIMELINE_CAPACITY`], and atomically rewrite the file.
///
/// A corrupt existing file is replaced rather than treated as fatal.
pub fn append(path: &Path, entry: TimelineEntry) -> Result<(), TimelineError> {
    let mut entries = match read(path) {
        Ok(entries) => entries,
        Err(TimelineError::Json(e)) => {
            tracing::warn!(path = %path.display(), error = %e, "timeline unreadable; starting fresh");
            Vec::new()
        }
        Err(e) => return Err(e),
    };
    entries.insert(0, entry);
    entries.truncate(TIMELINE_CAPACITY);

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::Builder::new().prefix(".timeline-").tempfile_in(dir)?;
    serde_json::to_writer_pretty(tmp.as_file_mut(), &entries)?;
    tmp.as_file_mut().flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
