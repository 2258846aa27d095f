//! Maps a save name and save directory onto the three files of a task.
//!
//! ```text
//! <save_dir>/<name>                final file, written in place
//! <save_dir>/.cache/<name>.tmp     chunk progress table
//! <save_dir>/.cache/<name>.lmf     freshness marker
//! ```

use std::path::{Component, Path, PathBuf};

use serde::Serialize;

use super::DownloadError;
use super::constants::{CACHE_DIR, MARKER_SUFFIX, PROGRESS_SUFFIX};

/// Resolved on-disk locations of one download task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskPaths {
    /// Destination file, sized to the content length and written in place.
    pub final_path: PathBuf,
    /// Binary chunk table with per-chunk write offsets.
    pub progress_path: PathBuf,
    /// Freshness token of the attempt that produced the progress file.
    pub marker_path: PathBuf,
}

impl TaskPaths {
    /// Returns the three paths, final file first.
    #[must_use]
    pub fn all(&self) -> [&Path; 3] {
        [&self.final_path, &self.progress_path, &self.marker_path]
    }

    /// Creates the save directory and its cache directory.
    ///
    /// # Errors
    ///
    /// Returns `DownloadError::Io` when a directory cannot be created.
    pub async fn ensure_dirs(&self) -> Result<(), DownloadError> {
        for dir in [self.final_path.parent(), self.progress_path.parent()]
            .into_iter()
            .flatten()
        {
            if dir.as_os_str().is_empty() {
                continue;
            }
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| DownloadError::io(dir, e))?;
        }
        Ok(())
    }
}

/// Resolves the final, progress and marker paths for `save_name` under `save_dir`.
///
/// Pure: touches nothing on disk.
///
/// # Errors
///
/// Returns `DownloadError::InvalidPath` when `save_name` is empty, is `.` or
/// `..`, contains a path separator or NUL byte, or is absolute; any of these
/// could place a file outside `save_dir`.
pub fn resolve_paths(save_name: &str, save_dir: &Path) -> Result<TaskPaths, DownloadError> {
    validate_save_name(save_name)?;

    let cache_dir = save_dir.join(CACHE_DIR);
    Ok(TaskPaths {
        final_path: save_dir.join(save_name),
        progress_path: cache_dir.join(format!("{save_name}{PROGRESS_SUFFIX}")),
        marker_path: cache_dir.join(format!("{save_name}{MARKER_SUFFIX}")),
    })
}

/// Returns `save_name` with ` (n)` inserted before its extension, or the
/// name itself for `n == 0`.
///
/// `data.bin` becomes `data (1).bin`; a name without an extension, or with
/// only a leading dot, gets the suffix at the end.
#[must_use]
pub fn numbered_save_name(save_name: &str, n: usize) -> String {
    if n == 0 {
        return save_name.to_string();
    }
    match save_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !stem.ends_with('.') => {
            format!("{stem} ({n}).{ext}")
        }
        _ => format!("{save_name} ({n})"),
    }
}

fn validate_save_name(name: &str) -> Result<(), DownloadError> {
    if name.is_empty() {
        return Err(DownloadError::invalid_path(name, "empty name"));
    }
    if name.contains('\0') {
        return Err(DownloadError::invalid_path(name, "contains NUL"));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(DownloadError::invalid_path(name, "contains a path separator"));
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        (Some(Component::ParentDir | Component::CurDir), _) => {
            Err(DownloadError::invalid_path(name, "relative directory reference"))
        }
        _ => Err(DownloadError::invalid_path(name, "not a single file name")),
    }
}
