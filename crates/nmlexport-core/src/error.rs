//! Error types for nmlexport core operations.
//!
//! Errors are grouped by domain. Only [`ExportError`] ever reaches the caller of
//! an export run; the other domains describe per-unit failures that the workers
//! log and count before moving on to the next unit.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in nmlexport core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Export run could not start or a worker failed unexpectedly.
    #[error(transparent)]
    Export(#[from] ExportError),

    /// Catalogue document could not be read, parsed or written.
    #[error(transparent)]
    Library(#[from] LibraryError),

    /// File system operation failed.
    #[error(transparent)]
    FileSystem(#[from] FileSystemError),

    /// A single file copy failed.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by the export coordinator itself.
#[derive(Debug, Error)]
pub enum ExportError {
    /// The destination root does not exist; no worker was started.
    #[error("Volume {volume} does not exist ({path})")]
    DestinationUnavailable {
        /// Volume identifier requested by the job.
        volume: String,
        /// Resolved destination root.
        path: PathBuf,
    },

    /// A worker thread panicked.
    #[error("Export worker '{worker}' panicked")]
    WorkerPanicked {
        /// Name of the worker.
        worker: &'static str,
    },
}

/// Errors raised while handling catalogue documents.
#[derive(Debug, Error)]
pub enum LibraryError {
    /// The document is not well-formed XML.
    #[error("Failed to parse catalogue{}: {reason}", path.as_ref().map(|p| format!(" {}", p.display())).unwrap_or_default())]
    Parse {
        /// Source file, when parsing from disk.
        path: Option<PathBuf>,
        /// Parser message.
        reason: String,
    },

    /// The document lacks an element the export relies on.
    #[error("Catalogue is missing required element {element}")]
    MissingElement {
        /// Name of the missing element.
        element: &'static str,
    },

    /// The document could not be serialised.
    #[error("Failed to write catalogue {path}: {reason}")]
    Write {
        /// Target path.
        path: PathBuf,
        /// Underlying error message.
        reason: String,
    },
}

/// File system errors, always tagged with the path involved.
#[derive(Debug, Error)]
pub enum FileSystemError {
    /// Reading failed.
    #[error("Failed to read {path}: {reason}")]
    ReadFailed {
        /// Path being read.
        path: PathBuf,
        /// Underlying error message.
        reason: String,
    },

    /// Writing failed.
    #[error("Failed to write {path}: {reason}")]
    WriteFailed {
        /// Path being written.
        path: PathBuf,
        /// Underlying error message.
        reason: String,
    },

    /// Directory creation failed.
    #[error("Failed to create directory {path}: {reason}")]
    CreateDirFailed {
        /// Directory being created.
        path: PathBuf,
        /// Underlying error message.
        reason: String,
    },

    /// Deletion failed.
    #[error("Failed to delete {path}: {reason}")]
    DeleteFailed {
        /// Path being deleted.
        path: PathBuf,
        /// Underlying error message.
        reason: String,
    },
}

/// Errors for a single file copy.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Source and destination resolve to the same file.
    #[error("`{}` and `{}` are the same file", source_path.display(), destination.display())]
    SameFile {
        /// Source path.
        source_path: PathBuf,
        /// Destination path.
        destination: PathBuf,
    },

    /// Source or destination is not a regular file (named pipe, device, directory).
    #[error("`{}` is not a regular file", path.display())]
    NotRegularFile {
        /// Offending path.
        path: PathBuf,
    },

    /// Copying the content failed part way.
    #[error("Failed to copy {} to {}: {reason}", source_path.display(), destination.display())]
    CopyFailed {
        /// Source path.
        source_path: PathBuf,
        /// Destination path.
        destination: PathBuf,
        /// Underlying error message.
        reason: String,
    },
}
