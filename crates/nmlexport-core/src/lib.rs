//! `nmlexport` Core Library
//!
//! This crate exports a Traktor catalogue onto a removable volume:
//! - Audio file sync into `<volume>/.Music`, skipping unchanged files
//! - Optional cleanup of audio files the catalogue no longer names
//! - The playlist folder hierarchy rebuilt as directories of `.nml` documents,
//!   plus an "All tracks" playlist at the volume root
//! - Non-blocking progress polling and cooperative cancellation
//!
//! # Error Handling
//!
//! Only a missing destination volume fails a run. Per-file problems are logged
//! through `tracing`, counted in the worker statistics, and skipped. See the
//! [`error`] module for the error types.
//!
//! ```rust,ignore
//! use nmlexport_core::{ExportCoordinator, ExportJob, Library};
//!
//! let mut library = Library::open("collection.nml".as_ref())?;
//! let coordinator = ExportCoordinator::new(ExportJob::new("STICK", "/Volumes/STICK"));
//! let report = coordinator.export(&mut library)?;
//! println!("{}", report.summary());
//! ```

pub mod cleanup;
pub mod config;
pub mod error;
pub mod export;
pub mod library;
pub mod playlist;
pub mod progress;
pub mod transfer;

pub use cleanup::{CleanupResult, OrphanCleanupWorker};
pub use config::ExportConfig;
pub use error::{Error, ExportError, FileSystemError, LibraryError, Result, TransferError};
pub use export::{
    CompletedExport, ExportCoordinator, ExportHandle, ExportJob, ExportOutcome, ExportReport,
    MUSIC_DIR, available_volumes,
};
pub use library::{Library, PlaylistNode, TrackEntry};
pub use playlist::{PlaylistExportResult, PlaylistTreeExporter};
pub use progress::{CancellationToken, ProgressAction, ProgressChannel, ProgressEvent, ProgressPoll};
pub use transfer::{FileSyncWorker, TransferOptions, TransferResult};
