//! Bounded retention for generated captures.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Name prefix of annotated recognition images.
pub const ANNOTATED_PREFIX: &str = "annotated_";
/// Extension of annotated recognition images.
pub const ANNOTATED_EXTENSION: &str = "jpg";

/// Keep the `keep` most recently modified files in `dir` named
/// `<prefix>*.<extension>` and delete the rest.
///
/// Returns how many files were deleted. Files that fail to delete are logged
/// and skipped.
pub fn cleanup_old_files(
    dir: &Path,
    prefix: &str,
    extension: &str,
    keep: usize,
) -> std::io::Result<usize> {
    prune(dir, prefix, extension, keep, None)
}

/// [`cleanup_old_files`] that never deletes `current`, which counts toward
/// `keep` even when `keep` is 0.
pub fn cleanup_keeping(
    dir: &Path,
    prefix: &str,
    extension: &str,
    keep: usize,
    current: &Path,
) -> std::io::Result<usize> {
    prune(dir, prefix, extension, keep.saturating_sub(1), Some(current))
}

fn prune(
    dir: &Path,
    prefix: &str,
    extension: &str,
    keep: usize,
    pinned: Option<&Path>,
) -> std::io::Result<usize> {
    let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        if !matches_pattern(&path, prefix, extension) {
            continue;
        }
        if pinned.is_some_and(|p| p.file_name() == path.file_name()) {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        files.push((modified, path));
    }

    if files.len() <= keep {
        return Ok(0);
    }

    // Newest first; name breaks ties so runs are reproducible.
    files.sort_by(|a, b| b.cmp(a));

    let mut removed = 0;
    for (_, path) in files.into_iter().skip(keep) {
        match std::fs::remove_file(&path) {
            Ok(()) => {
                removed += 1;
                tracing::debug!(file = %path.display(), "cleaned up old capture");
            }
            Err(e) => tracing::warn!(file = %path.display(), error = %e, "failed to remove old capture"),
        }
    }
    Ok(removed)
}

fn matches_pattern(path: &Path, prefix: &str, extension: &str) -> bool {
    let name_ok = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(prefix));
    let ext_ok = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(extension));
    name_ok && ext_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;

    fn touch(dir: &Path, name: &str, age_secs: u64) -> PathBuf {
        let path = dir.join(name);
        let file = File::create(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(age_secs))
            .unwrap();
        path
    }

    #[test]
    fn test_keeps_newest_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        let oldest = touch(dir.path(), "annotated_a.jpg", 300);
        let middle = touch(dir.path(), "annotated_b.jpg", 200);
        let newest = touch(dir.path(), "annotated_c.jpg", 100);

        let removed = cleanup_old_files(dir.path(), ANNOTATED_PREFIX, ANNOTATED_EXTENSION, 2).unwrap();
        assert_eq!(removed, 1);
        assert!(!oldest.exists());
        assert!(middle.exists());
        assert!(newest.exists());
    }

    #[test]
    fn test_ignores_non_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        let class_photo = touch(dir.path(), "class_20240101.jpg", 1000);
        let png = touch(dir.path(), "annotated_x.png", 1000);
        touch(dir.path(), "annotated_y.JPG", 10);
        std::fs::create_dir(dir.path().join("annotated_dir.jpg")).unwrap();

        let removed = cleanup_old_files(dir.path(), ANNOTATED_PREFIX, ANNOTATED_EXTENSION, 0).unwrap();
        assert_eq!(removed, 1);
        assert!(class_photo.exists());
        assert!(png.exists());
        assert!(dir.path().join("annotated_dir.jpg").is_dir());
    }

    #[test]
    fn test_current_file_survives_zero_keep_and_mtime_ties() {
        let dir = tempfile::tempdir().unwrap();
        let older = touch(dir.path(), "annotated_a.jpg", 50);
        let current = touch(dir.path(), "annotated_b.jpg", 10);
        // Same mtime as `current` and sorts after it by name.
        let rival = dir.path().join("annotated_z.jpg");
        File::create(&rival)
            .unwrap()
            .set_modified(std::fs::metadata(&current).unwrap().modified().unwrap())
            .unwrap();

        let removed =
            cleanup_keeping(dir.path(), ANNOTATED_PREFIX, ANNOTATED_EXTENSION, 0, &current).unwrap();
        assert_eq!(removed, 2);
        assert!(current.exists());
        assert!(!older.exists());
        assert!(!rival.exists());

        touch(dir.path(), "annotated_c.jpg", 5);
        let removed =
            cleanup_keeping(dir.path(), ANNOTATED_PREFIX, ANNOTATED_EXTENSION, 1, &current).unwrap();
        assert_eq!(removed, 1);
        assert!(current.exists());
    }

    #[test]
    fn test_under_limit_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "annotated_a.jpg", 10);
        assert_eq!(cleanup_old_files(dir.path(), ANNOTATED_PREFIX, ANNOTATED_EXTENSION, 20).unwrap(), 0);
    }
}
