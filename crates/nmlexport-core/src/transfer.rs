//! File sync worker for copying audio files onto the export volume.
//!
//! This module provides:
//! - Buffered binary copies sized to the file being copied
//! - Change detection by modification time, so repeated exports only copy
//!   what changed since the last run
//! - Timestamp preservation, which the change detection of the next run relies on
//! - Per-file cancellation checks and progress events
//!
//! Every failure here is scoped to a single file: it is logged, counted and
//! the worker moves on.
//!
//! # Example
//!
//! ```rust,ignore
//! use nmlexport_core::transfer::{FileSyncWorker, TransferOptions};
//!
//! let worker = FileSyncWorker::new();
//! let result = worker.sync_files(
//!     &[PathBuf::from("/Users/dj/Music/song.mp3")],
//!     Path::new("/Volumes/STICK/.Music"),
//!     &TransferOptions::default(),
//!     |event| println!("{event:?}"),
//! );
//! println!("Copied {} files", result.files_copied);
//! ```

use std::fs::{self, File, Metadata};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use filetime::FileTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{Error, FileSystemError, Result, TransferError};
use crate::progress::{CancellationToken, ProgressAction, ProgressEvent};

// =============================================================================
// Constants
// =============================================================================

/// Upper bound of the copy buffer (10 MiB).
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 10 * 1024 * 1024;

/// Floor of the copy buffer (1 KiB), used for empty and tiny files.
pub const DEFAULT_MIN_BUFFER_SIZE: usize = 1024;

/// How much newer a source may be than its copy and still count as unchanged.
///
/// One hour plus two seconds absorbs timezone shifts and the two-second
/// timestamp granularity of FAT volumes.
pub const DEFAULT_MODIFICATION_TOLERANCE: Duration = Duration::from_secs(3602);

// =============================================================================
// Transfer Options
// =============================================================================

/// Configuration options for file copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferOptions {
    /// Largest copy buffer to allocate, in bytes.
    /// Default: 10 MiB
    pub max_buffer_size: usize,

    /// Smallest copy buffer to allocate, in bytes.
    /// Default: 1 KiB
    pub min_buffer_size: usize,

    /// A destination file is left alone unless its source is newer by at
    /// least this much.
    /// Default: 3602 seconds
    pub modification_tolerance: Duration,

    /// Whether to copy access/modification times onto the destination.
    /// Default: true
    pub preserve_timestamps: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            min_buffer_size: DEFAULT_MIN_BUFFER_SIZE,
            modification_tolerance: DEFAULT_MODIFICATION_TOLERANCE,
            preserve_timestamps: true,
        }
    }
}

impl TransferOptions {
    /// Validate options and return an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.min_buffer_size == 0 {
            return Err(Error::Configuration(
                "min_buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.min_buffer_size > self.max_buffer_size {
            return Err(Error::Configuration(format!(
                "min_buffer_size ({}) must not exceed max_buffer_size ({})",
                self.min_buffer_size, self.max_buffer_size
            )));
        }
        Ok(())
    }

    /// Buffer size for a file of `file_len` bytes.
    #[must_use]
    pub fn buffer_size_for(&self, file_len: u64) -> usize {
        usize::try_from(file_len)
            .unwrap_or(usize::MAX)
            .min(self.max_buffer_size)
            .max(self.min_buffer_size)
    }
}

// =============================================================================
// Transfer Result
// =============================================================================

/// Statistics of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferResult {
    /// Number of source files handed to the worker.
    pub total_files: usize,

    /// Number of files copied.
    pub files_copied: usize,

    /// Number of files left alone because the destination was up to date.
    pub files_skipped: usize,

    /// Number of sources that had disappeared by the time they were reached.
    pub files_missing: usize,

    /// Number of copies that failed.
    pub files_failed: usize,

    /// Total bytes written.
    pub bytes_copied: u64,

    /// Total duration of the pass in seconds.
    pub duration_secs: f64,

    /// Whether the pass stopped early because of cancellation.
    pub was_cancelled: bool,
}

// =============================================================================
// File Sync Worker
// =============================================================================

/// Copies source files into a flat destination directory.
#[derive(Debug, Clone, Default)]
pub struct FileSyncWorker {
    cancellation: CancellationToken,
}

impl FileSyncWorker {
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

    /// Request cancellation of the pass.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Check if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Copy every source into `destination_dir`, skipping unchanged files.
    ///
    /// A `copy` event is emitted right before each copy is attempted. Files
    /// that are skipped or missing produce no event.
    pub fn sync_files<F>(
        &self,
        sources: &[PathBuf],
        destination_dir: &Path,
        options: &TransferOptions,
        mut on_progress: F,
    ) -> TransferResult
    where
        F: FnMut(ProgressEvent),
    {
        let start_time = Instant::now();
        let mut result = TransferResult {
            total_files: sources.len(),
            ..TransferResult::default()
        };

        if let Err(e) = fs::create_dir_all(destination_dir) {
            error!(
                "Failed to create destination directory {}: {}",
                destination_dir.display(),
                e
            );
        }

        for (index, source) in sources.iter().enumerate() {
            if self.is_cancelled() {
                info!("File sync cancelled at file {}/{}", index + 1, sources.len());
                result.was_cancelled = true;
                break;
            }

            let Some(file_name) = source.file_name() else {
                warn!("Source has no file name: {}", source.display());
                result.files_failed += 1;
                continue;
            };
            let destination = destination_dir.join(file_name);
            let display_name = file_name.to_string_lossy();

            let Ok(source_meta) = fs::metadata(source) else {
                error!("{} does not exist", source.display());
                result.files_missing += 1;
                continue;
            };

            if let Ok(dest_meta) = fs::metadata(&destination) {
                if is_up_to_date(&source_meta, &dest_meta, options.modification_tolerance) {
                    debug!("Skipping unchanged file: {}", destination.display());
                    result.files_skipped += 1;
                    continue;
                }
                debug!(
                    "File exists: {} // Time difference: {:.0}s",
                    source.display(),
                    modification_delta_secs(&source_meta, &dest_meta)
                );
            }

            info!("Copying {}", display_name);
            on_progress(ProgressEvent::new(ProgressAction::Copy, display_name));

            match copy_file(source, &destination, options) {
                Ok(bytes) => {
                    result.files_copied += 1;
                    result.bytes_copied += bytes;
                }
                Err(e) => {
                    error!("Failed to copy {}: {}", source.display(), e);
                    result.files_failed += 1;
                }
            }
        }

        result.duration_secs = start_time.elapsed().as_secs_f64();
        info!(
            "File sync complete: {} copied, {} skipped, {} missing, {} failed in {:.2}s",
            result.files_copied,
            result.files_skipped,
            result.files_missing,
            result.files_failed,
            result.duration_secs
        );
        result
    }
}

/// Whether `destination` is a current copy of `source` under `tolerance`.
#[must_use]
pub fn is_up_to_date(source: &Metadata, destination: &Metadata, tolerance: Duration) -> bool {
    modification_delta_secs(source, destination) < tolerance.as_secs_f64()
}

/// Seconds by which the source's modification time leads the destination's.
fn modification_delta_secs(source: &Metadata, destination: &Metadata) -> f64 {
    let source = FileTime::from_last_modification_time(source);
    let destination = FileTime::from_last_modification_time(destination);
    (source.unix_seconds() - destination.unix_seconds()) as f64
        + (f64::from(source.nanoseconds()) - f64::from(destination.nanoseconds())) / 1e9
}

/// Copy one file, creating missing parent directories, then carry its
/// timestamps over.
///
/// Returns the number of bytes written.
pub fn copy_file(source: &Path, destination: &Path, options: &TransferOptions) -> Result<u64> {
    if let Some(parent) = destination.parent()
        && !parent.exists()
    {
        fs::create_dir_all(parent).map_err(|e| {
            Error::FileSystem(FileSystemError::CreateDirFailed {
                path: parent.to_path_buf(),
                reason: e.to_string(),
            })
        })?;
    }

    let source_meta = fs::metadata(source).map_err(|e| {
        Error::FileSystem(FileSystemError::ReadFailed {
            path: source.to_path_buf(),
            reason: e.to_string(),
        })
    })?;
    if !source_meta.is_file() {
        return Err(Error::Transfer(TransferError::NotRegularFile {
            path: source.to_path_buf(),
        }));
    }
    if is_same_file(source, destination) {
        return Err(Error::Transfer(TransferError::SameFile {
            source_path: source.to_path_buf(),
            destination: destination.to_path_buf(),
        }));
    }
    if let Ok(dest_meta) = fs::metadata(destination)
        && !dest_meta.is_file()
    {
        return Err(Error::Transfer(TransferError::NotRegularFile {
            path: destination.to_path_buf(),
        }));
    }

    let copy_failed = |reason: String| {
        Error::Transfer(TransferError::CopyFailed {
            source_path: source.to_path_buf(),
            destination: destination.to_path_buf(),
            reason,
        })
    };

    let mut reader = File::open(source).map_err(|e| {
        Error::FileSystem(FileSystemError::ReadFailed {
            path: source.to_path_buf(),
            reason: e.to_string(),
        })
    })?;
    let writer = File::create(destination).map_err(|e| {
        Error::FileSystem(FileSystemError::WriteFailed {
            path: destination.to_path_buf(),
            reason: e.to_string(),
        })
    })?;

    let buffer_size = options.buffer_size_for(source_meta.len());
    let bytes_written = match write_contents(&mut reader, writer, buffer_size) {
        Ok(bytes) => bytes,
        Err(e) => {
            // A truncated copy would look current to the next run.
            if let Err(remove_err) = fs::remove_file(destination) {
                warn!(
                    "Failed to remove partial copy {}: {}",
                    destination.display(),
                    remove_err
                );
            }
            return Err(copy_failed(e.to_string()));
        }
    };

    if options.preserve_timestamps
        && let Err(e) = filetime::set_file_times(
            destination,
            FileTime::from_last_access_time(&source_meta),
            FileTime::from_last_modification_time(&source_meta),
        )
    {
        warn!(
            "Failed to copy timestamps onto {}: {}",
            destination.display(),
            e
        );
    }

    Ok(bytes_written)
}

fn write_contents(reader: &mut File, mut writer: File, buffer_size: usize) -> std::io::Result<u64> {
    let mut buffer = vec![0u8; buffer_size];
    let mut bytes_written: u64 = 0;
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        writer.write_all(&buffer[..bytes_read])?;
        bytes_written += bytes_read as u64;
    }
    writer.flush()?;
    Ok(bytes_written)
}

fn is_same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

// =============================================================================
// Tests
// =============================================================================
