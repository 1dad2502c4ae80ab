//! Orphan cleanup for the export music directory.
//!
//! After an export the music directory should hold exactly the files the
//! collection refers to. Anything else left over from earlier runs is an
//! orphan and is removed. Names are compared after canonical decomposition,
//! so a file written by a filesystem that stores composed names still matches
//! its catalogue entry.
//!
//! # Example
//!
//! ```rust,ignore
//! use nmlexport_core::cleanup::OrphanCleanupWorker;
//!
//! let worker = OrphanCleanupWorker::new();
//! let result = worker.remove_orphans(Path::new("/Volumes/STICK/.Music"), &keep, |_| {});
//! println!("{}", result.summary());
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::error::{FileSystemError, Result};
use crate::library::normalize_file_name;
use crate::progress::{CancellationToken, ProgressAction, ProgressEvent};

/// Result of a cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupResult {
    /// Directory that was cleaned.
    pub music_dir: PathBuf,
    /// Files removed.
    pub files_deleted: usize,
    /// Files that could not be removed.
    pub files_failed: usize,
    /// Non-file entries left alone (subdirectories).
    pub entries_skipped: usize,
    /// Duration of the pass in milliseconds.
    pub duration_ms: u64,
    /// Whether the pass stopped early because of cancellation.
    pub was_cancelled: bool,
}

impl CleanupResult {
    /// Check if every orphan was removed.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.files_failed == 0 && !self.was_cancelled
    }

    /// Get a summary string of the cleanup result.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "Deleted {} orphaned files ({} skipped, {} failed)",
            self.files_deleted, self.entries_skipped, self.files_failed
        )
    }
}

/// Removes files from the music directory that the collection no longer names.
#[derive(Debug, Clone, Default)]
pub struct OrphanCleanupWorker {
    cancellation: CancellationToken,
}

impl OrphanCleanupWorker {
    /// Create a worker with its own cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a worker observing a shared cancellation token.
    #[must_use]
    pub const fn with_cancellation(cancellation: CancellationToken) -> Self {
        Self { cancellation }
    }

    /// Check if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// List the orphans in `music_dir`: regular files whose normalized name is
    /// not in `keep`. Sorted by file name.
    pub fn find_orphans(&self, music_dir: &Path, keep: &HashSet<String>) -> (Vec<PathBuf>, usize) {
        let mut orphans = Vec::new();
        let mut skipped = 0;

        for entry in WalkDir::new(music_dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Error reading music directory entry: {}", e);
                    continue;
                }
            };

            let name = entry.file_name().to_string_lossy();
            if keep.contains(&normalize_file_name(&name)) {
                continue;
            }
            if !entry.file_type().is_file() {
                debug!("Leaving non-file entry alone: {}", entry.path().display());
                skipped += 1;
                continue;
            }
            orphans.push(entry.into_path());
        }

        (orphans, skipped)
    }

    /// Delete every orphan in `music_dir`, emitting a `delete` event before each removal.
    ///
    /// A missing directory means there is nothing to clean.
    pub fn remove_orphans<F>(
        &self,
        music_dir: &Path,
        keep: &HashSet<String>,
        mut on_progress: F,
    ) -> CleanupResult
    where
        F: FnMut(ProgressEvent),
    {
        let start_time = Instant::now();
        let mut result = CleanupResult {
            music_dir: music_dir.to_path_buf(),
            ..CleanupResult::default()
        };

        if !music_dir.is_dir() {
            debug!(
                "Music directory {} does not exist, nothing to clean",
                music_dir.display()
            );
            return result;
        }

        let (orphans, skipped) = self.find_orphans(music_dir, keep);
        result.entries_skipped = skipped;
        info!(
            "Found {} orphaned files in {}",
            orphans.len(),
            music_dir.display()
        );

        for path in orphans {
            if self.is_cancelled() {
                info!("Orphan cleanup cancelled");
                result.was_cancelled = true;
                break;
            }

            let display_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            info!("Deleting {}", display_name);
            on_progress(ProgressEvent::new(ProgressAction::Delete, display_name));

            match delete_file(&path) {
                Ok(()) => result.files_deleted += 1,
                Err(e) => {
                    error!("{}", e);
                    result.files_failed += 1;
                }
            }
        }

        result.duration_ms = start_time.elapsed().as_millis() as u64;
        info!("Orphan cleanup complete: {}", result.summary());
        result
    }
}

/// Remove a single file.
pub fn delete_file(path: &Path) -> Result<()> {
    fs::remove_file(path).map_err(|e| {
        FileSystemError::DeleteFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
        .into()
    })
}
