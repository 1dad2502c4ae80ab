//! Export coordination.
//!
//! The [`ExportCoordinator`] drives one export run:
//!
//! 1. Checks that the destination volume is mounted
//! 2. Scans the catalogue once, relocating every accepted entry onto the volume
//! 3. Runs the file sync, orphan cleanup and playlist workers concurrently
//! 4. Collects their results into an [`ExportReport`]
//!
//! [`ExportHandle`] runs the same thing on a background thread and exposes
//! non-blocking `poll`/`cancel` for a presentation layer.
//!
//! # Example
//!
//! ```rust,ignore
//! use nmlexport_core::export::{ExportHandle, ExportJob};
//! use nmlexport_core::progress::ProgressPoll;
//!
//! let handle = ExportHandle::start(library, ExportJob::new("STICK", "/Volumes/STICK"))?;
//! loop {
//!     match handle.poll() {
//!         ProgressPoll::Events(events) => events.iter().for_each(|e| println!("{e:?}")),
//!         ProgressPoll::Done => break,
//!     }
//!     std::thread::sleep(std::time::Duration::from_millis(100));
//! }
//! let completed = handle.join()?;
//! ```

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cleanup::{CleanupResult, OrphanCleanupWorker};
use crate::config::ExportConfig;
use crate::error::{Error, ExportError, FileSystemError, Result};
use crate::library::{Library, TrackEntry, relocate_entry};
use crate::playlist::{PlaylistExportResult, PlaylistTreeExporter};
use crate::progress::{CancellationToken, ProgressChannel, ProgressPoll, RunState};
use crate::transfer::{FileSyncWorker, TransferOptions, TransferResult};

/// Audio subdirectory created under the destination root.
pub const MUSIC_DIR: &str = ".Music";

// =============================================================================
// Export Job
// =============================================================================

/// Parameters of one export run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportJob {
    /// Volume identifier written into relocated entries.
    pub volume: String,
    /// Root directory of the mounted volume.
    pub destination_root: PathBuf,
    /// Whether to delete audio files no accepted entry names.
    pub remove_orphans: bool,
}

impl ExportJob {
    /// Create a job exporting to `destination_root`, without orphan cleanup.
    pub fn new(volume: impl Into<String>, destination_root: impl Into<PathBuf>) -> Self {
        Self {
            volume: volume.into(),
            destination_root: destination_root.into(),
            remove_orphans: false,
        }
    }

    /// Create a job for a volume mounted under the configured volumes root.
    pub fn for_volume(volume: impl Into<String>, config: &ExportConfig) -> Self {
        let volume = volume.into();
        let destination_root = config.volumes_root.join(&volume);
        Self {
            volume,
            destination_root,
            remove_orphans: config.remove_orphans,
        }
    }

    /// Enable or disable orphan cleanup.
    #[must_use]
    pub const fn with_remove_orphans(mut self, remove_orphans: bool) -> Self {
        self.remove_orphans = remove_orphans;
        self
    }

    /// Directory the audio files are copied into.
    pub fn music_dir(&self) -> PathBuf {
        self.destination_root.join(MUSIC_DIR)
    }
}

/// Names of the writable volumes mounted under `volumes_root`, sorted.
///
/// Hidden entries and read-only mounts are left out.
pub fn available_volumes(volumes_root: &Path) -> Result<Vec<String>> {
    let read_dir = fs::read_dir(volumes_root).map_err(|e| {
        Error::FileSystem(FileSystemError::ReadFailed {
            path: volumes_root.to_path_buf(),
            reason: e.to_string(),
        })
    })?;

    let mut volumes: Vec<String> = read_dir
        .filter_map(std::result::Result::ok)
        .filter(|entry| {
            entry
                .metadata()
                .is_ok_and(|m| m.is_dir() && !m.permissions().readonly())
        })
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| !name.starts_with('.'))
        .collect();
    volumes.sort();
    Ok(volumes)
}

// =============================================================================
// Catalogue scan
// =============================================================================

/// Work derived from one pass over the catalogue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogueScan {
    /// Source paths to copy, in catalogue order.
    pub sources: Vec<PathBuf>,
    /// Normalized file name to collection index. The later entry wins on collision.
    pub by_name: HashMap<String, usize>,
    /// Collection indices of accepted entries, in catalogue order.
    pub all_tracks: Vec<usize>,
    /// Entries skipped because their source file is gone.
    pub entries_missing: usize,
    /// Entries skipped because they are recording imports.
    pub recordings_skipped: usize,
    /// Whether the scan stopped early because of cancellation.
    pub was_cancelled: bool,
}

/// Scan the collection and relocate every accepted entry to `<volume>/:.Music/:`.
///
/// Entries without a location, with a missing source file, or flagged as
/// recording imports are left untouched.
pub fn scan_catalogue(
    library: &mut Library,
    volume: &str,
    cancellation: &CancellationToken,
) -> CatalogueScan {
    let mut scan = CatalogueScan::default();
    let entries = library.entries_mut();

    for (index, entry) in entries.iter_mut().enumerate() {
        if cancellation.is_cancelled() {
            info!("Catalogue scan cancelled at entry {}", index + 1);
            scan.was_cancelled = true;
            break;
        }

        let track = TrackEntry::new(entry);
        let (Some(source), Some(name)) = (track.source_path(), track.normalized_file_name())
        else {
            debug!("Skipping entry {} without a location", index);
            continue;
        };
        if !source.exists() {
            debug!("{} does not exist, skipping", source.display());
            scan.entries_missing += 1;
            continue;
        }
        if track.is_recording_import() {
            debug!("Skipping recording {}", source.display());
            scan.recordings_skipped += 1;
            continue;
        }

        relocate_entry(entry, MUSIC_DIR, volume);
        scan.sources.push(source);
        if let Some(previous) = scan.by_name.insert(name, index) {
            warn!(
                "Entries {} and {} share a file name, keeping the later one",
                previous, index
            );
        }
        scan.all_tracks.push(index);
    }

    info!(
        "Scanned catalogue: {} accepted, {} missing, {} recordings",
        scan.all_tracks.len(),
        scan.entries_missing,
        scan.recordings_skipped
    );
    scan
}

// =============================================================================
// Export Report
// =============================================================================

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportOutcome {
    /// Every worker reached the end of its work.
    Completed,
    /// At least one worker stopped early on cancellation.
    Cancelled,
}

/// Aggregated result of an export run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportReport {
    /// How the run ended.
    pub outcome: ExportOutcome,
    /// Catalogue entries accepted for export.
    pub tracks_accepted: usize,
    /// Catalogue entries whose source file was missing.
    pub entries_missing: usize,
    /// Catalogue entries skipped as recording imports.
    pub recordings_skipped: usize,
    /// File sync statistics.
    pub transfer: TransferResult,
    /// Orphan cleanup statistics, when cleanup ran.
    pub cleanup: Option<CleanupResult>,
    /// Playlist export statistics.
    pub playlists: PlaylistExportResult,
    /// Total duration in seconds.
    pub duration_secs: f64,
}

impl ExportReport {
    /// Whether the run reached natural completion.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.outcome == ExportOutcome::Completed
    }

    /// Get a summary string of the run.
    #[must_use]
    pub fn summary(&self) -> String {
        let status = match self.outcome {
            ExportOutcome::Completed => "Export completed",
            ExportOutcome::Cancelled => "Export cancelled",
        };
        let mut summary = format!(
            "{status}: {} tracks, {} copied, {} up to date, {} failed; {} playlists written",
            self.tracks_accepted,
            self.transfer.files_copied,
            self.transfer.files_skipped,
            self.transfer.files_failed,
            self.playlists.playlists_written
        );
        if let Some(cleanup) = &self.cleanup {
            summary.push_str(&format!("; {} orphans deleted", cleanup.files_deleted));
        }
        summary.push_str(&format!(" in {:.1}s", self.duration_secs));
        summary
    }
}

// =============================================================================
// Export Coordinator
// =============================================================================

/// Runs an [`ExportJob`] against a catalogue.
#[derive(Debug)]
pub struct ExportCoordinator {
    job: ExportJob,
    options: TransferOptions,
    state: RunState,
    progress: ProgressChannel,
}

/// Marks the run finished on every exit path.
struct FinishGuard<'a>(&'a RunState);

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

impl ExportCoordinator {
    /// Create a coordinator with default transfer options.
    pub fn new(job: ExportJob) -> Self {
        Self::with_options(job, TransferOptions::default())
    }

    /// Create a coordinator with explicit transfer options.
    pub fn with_options(job: ExportJob, options: TransferOptions) -> Self {
        Self {
            job,
            options,
            state: RunState::new(),
            progress: ProgressChannel::new(),
        }
    }

    /// The job being run.
    pub const fn job(&self) -> &ExportJob {
        &self.job
    }

    /// Request cancellation. Idempotent and non-blocking.
    pub fn cancel(&self) {
        info!("Export cancellation requested");
        self.state.cancellation().cancel();
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancellation().is_cancelled()
    }

    /// Token shared with the workers.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.state.cancellation().clone()
    }

    /// Take queued progress events, or [`ProgressPoll::Done`] once the run is over.
    pub fn poll_progress(&self) -> ProgressPoll {
        self.state.poll(&self.progress)
    }

    /// Run the export, blocking until every worker has returned.
    ///
    /// Only a missing destination fails the run. Accepted entries of `library`
    /// are relocated in place, and stay relocated if the run is cancelled.
    ///
    /// A coordinator can run again once the previous call has returned, but a
    /// cancelled coordinator stays cancelled.
    pub fn export(&self, library: &mut Library) -> Result<ExportReport> {
        self.state.begin();
        let _finished = FinishGuard(&self.state);
        let start_time = Instant::now();
        let destination_root = self.job.destination_root.as_path();

        if !destination_root.is_dir() {
            error!(
                "Volume {} does not exist ({})",
                self.job.volume,
                destination_root.display()
            );
            return Err(ExportError::DestinationUnavailable {
                volume: self.job.volume.clone(),
                path: destination_root.to_path_buf(),
            }
            .into());
        }
        self.options.validate()?;

        info!(
            "Exporting to {} (remove orphans: {})",
            destination_root.display(),
            self.job.remove_orphans
        );
        let scan = scan_catalogue(library, &self.job.volume, self.state.cancellation());
        let library: &Library = library;

        let (transfer, cleanup, playlists) =
            self.run_workers(library, &scan, destination_root)?;

        let cancelled = scan.was_cancelled
            || transfer.was_cancelled
            || playlists.was_cancelled
            || cleanup.as_ref().is_some_and(|c| c.was_cancelled);
        let report = ExportReport {
            outcome: if cancelled {
                ExportOutcome::Cancelled
            } else {
                ExportOutcome::Completed
            },
            tracks_accepted: scan.all_tracks.len(),
            entries_missing: scan.entries_missing,
            recordings_skipped: scan.recordings_skipped,
            transfer,
            cleanup,
            playlists,
            duration_secs: start_time.elapsed().as_secs_f64(),
        };
        info!("{}", report.summary());
        Ok(report)
    }

    fn run_workers(
        &self,
        library: &Library,
        scan: &CatalogueScan,
        destination_root: &Path,
    ) -> Result<(TransferResult, Option<CleanupResult>, PlaylistExportResult)> {
        let music_dir = self.job.music_dir();
        let progress = &self.progress;
        let options = &self.options;
        let state = &self.state;

        thread::scope(|scope| -> Result<_> {
            let sync = {
                let guard = state.enter_worker();
                let worker = FileSyncWorker::with_cancellation(self.cancellation_token());
                let music_dir = music_dir.as_path();
                scope.spawn(move || {
                    let _guard = guard;
                    worker.sync_files(&scan.sources, music_dir, options, |e| progress.push(e))
                })
            };

            let cleanup = self.job.remove_orphans.then(|| {
                let guard = state.enter_worker();
                let worker = OrphanCleanupWorker::with_cancellation(self.cancellation_token());
                let music_dir = music_dir.as_path();
                let keep: HashSet<String> = scan.by_name.keys().cloned().collect();
                scope.spawn(move || {
                    let _guard = guard;
                    worker.remove_orphans(music_dir, &keep, |e| progress.push(e))
                })
            });

            let playlists = {
                let guard = state.enter_worker();
                let exporter = PlaylistTreeExporter::with_cancellation(
                    library,
                    &scan.by_name,
                    self.cancellation_token(),
                );
                scope.spawn(move || {
                    let _guard = guard;
                    exporter.export(&scan.all_tracks, destination_root, |e| progress.push(e))
                })
            };

            state.go_live();
            debug!("Export workers running: {}", state.active_workers());

            let transfer = sync
                .join()
                .map_err(|_| ExportError::WorkerPanicked { worker: "file-sync" })?;
            let cleanup = cleanup
                .map(|handle| {
                    handle.join().map_err(|_| ExportError::WorkerPanicked {
                        worker: "orphan-cleanup",
                    })
                })
                .transpose()?;
            let playlists = playlists.join().map_err(|_| ExportError::WorkerPanicked {
                worker: "playlist-export",
            })?;
            Ok((transfer, cleanup, playlists))
        })
    }
}

// =============================================================================
// Background handle
// =============================================================================

/// What a finished background export hands back.
#[derive(Debug)]
pub struct CompletedExport {
    /// The catalogue, with accepted entries relocated onto the volume.
    pub library: Library,
    /// Result of the run.
    pub result: Result<ExportReport>,
}

/// An export running on a background thread.
#[derive(Debug)]
pub struct ExportHandle {
    coordinator: Arc<ExportCoordinator>,
    thread: thread::JoinHandle<CompletedExport>,
}

impl ExportHandle {
    /// Start exporting `library` with default transfer options.
    pub fn start(library: Library, job: ExportJob) -> Result<Self> {
        Self::start_with(ExportCoordinator::new(job), library)
    }

    /// Start a prepared coordinator on a background thread.
    pub fn start_with(coordinator: ExportCoordinator, mut library: Library) -> Result<Self> {
        let coordinator = Arc::new(coordinator);
        let runner = Arc::clone(&coordinator);
        let thread = thread::Builder::new()
            .name("nmlexport".to_string())
            .spawn(move || {
                let result = runner.export(&mut library);
                CompletedExport { library, result }
            })
            .map_err(Error::Io)?;
        Ok(Self {
            coordinator,
            thread,
        })
    }

    /// The coordinator running the export.
    pub fn coordinator(&self) -> &ExportCoordinator {
        &self.coordinator
    }

    /// Take queued progress events, or [`ProgressPoll::Done`] once the run is over.
    pub fn poll(&self) -> ProgressPoll {
        self.coordinator.poll_progress()
    }

    /// Request cancellation. Idempotent and non-blocking.
    pub fn cancel(&self) {
        self.coordinator.cancel();
    }

    /// Whether the background thread has returned.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the run and take back the catalogue.
    pub fn join(self) -> Result<CompletedExport> {
        self.thread
            .join()
            .map_err(|_| ExportError::WorkerPanicked {
                worker: "coordinator",
            }
            .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::{Location, path_to_nml_dir};
    use tempfile::TempDir;

    fn entry_xml(dir: &Path, file: &str, author: &str) -> String {
        format!(
            r#"<ENTRY TITLE="{file}"><LOCATION DIR="{}" FILE="{file}" VOLUME="Macintosh HD" VOLUMEID="abc"/><MODIFICATION_INFO AUTHOR_TYPE="{author}"/></ENTRY>"#,
            path_to_nml_dir(dir)
        )
    }

    fn catalogue(entries: &[String]) -> Library {
        Library::parse(&format!(
            "<NML VERSION=\"19\"><COLLECTION ENTRIES=\"{}\">{}</COLLECTION></NML>",
            entries.len(),
            entries.concat()
        ))
        .expect("parse catalogue")
    }

    #[test]
    fn test_job_for_volume() {
        let config = ExportConfig {
            volumes_root: PathBuf::from("/media"),
            remove_orphans: true,
            ..ExportConfig::default()
        };
        let job = ExportJob::for_volume("STICK", &config);
        assert_eq!(job.destination_root, PathBuf::from("/media/STICK"));
        assert_eq!(job.music_dir(), PathBuf::from("/media/STICK/.Music"));
        assert!(job.remove_orphans);
        assert!(!job.with_remove_orphans(false).remove_orphans);
    }

    #[test]
    fn test_available_volumes() {
        let temp_dir = TempDir::new().expect("create temp dir");
        for name in ["STICK", "BACKUP", ".hidden"] {
            fs::create_dir(temp_dir.path().join(name)).expect("create volume dir");
        }
        fs::write(temp_dir.path().join("file.txt"), b"not a volume").expect("write file");

        let volumes = available_volumes(temp_dir.path()).expect("list volumes");
        assert_eq!(volumes, vec!["BACKUP", "STICK"]);

        assert!(available_volumes(&temp_dir.path().join("absent")).is_err());
    }

    #[test]
    fn test_scan_filters_and_relocates() {
        let source = TempDir::new().expect("create source dir");
        for name in ["a.mp3", "take.wav", "b.wav"] {
            fs::write(source.path().join(name), b"audio").expect("write source");
        }
        let mut library = catalogue(&[
            entry_xml(source.path(), "a.mp3", "user"),
            entry_xml(source.path(), "gone.mp3", "user"),
            entry_xml(source.path(), "take.wav", "importer"),
            entry_xml(source.path(), "b.wav", "user"),
        ]);

        let scan = scan_catalogue(&mut library, "STICK", &CancellationToken::new());

        assert_eq!(scan.all_tracks, vec![0, 3]);
        assert_eq!(scan.entries_missing, 1);
        assert_eq!(scan.recordings_skipped, 1);
        assert_eq!(
            scan.sources,
            vec![source.path().join("a.mp3"), source.path().join("b.wav")]
        );

        let relocated = Location::of(&library.entries()[0]).expect("location");
        assert_eq!(relocated.primary_key(), "STICK/:.Music/:a.mp3");
        let untouched = Location::of(&library.entries()[1]).expect("location");
        assert_eq!(untouched.volume, "Macintosh HD");
    }

    #[test]
    fn test_scan_later_duplicate_wins() {
        let first = TempDir::new().expect("create dir");
        let second = TempDir::new().expect("create dir");
        fs::write(first.path().join("dup.mp3"), b"1").expect("write");
        fs::write(second.path().join("dup.mp3"), b"2").expect("write");
        let mut library = catalogue(&[
            entry_xml(first.path(), "dup.mp3", "user"),
            entry_xml(second.path(), "dup.mp3", "user"),
        ]);

        let scan = scan_catalogue(&mut library, "STICK", &CancellationToken::new());
        assert_eq!(scan.by_name.get("dup.mp3"), Some(&1));
        assert_eq!(scan.all_tracks.len(), 2);
    }

    #[test]
    fn test_scan_observes_cancellation() {
        let source = TempDir::new().expect("create source dir");
        fs::write(source.path().join("a.mp3"), b"audio").expect("write source");
        let mut library = catalogue(&[entry_xml(source.path(), "a.mp3", "user")]);

        let token = CancellationToken::new();
        token.cancel();
        let scan = scan_catalogue(&mut library, "STICK", &token);
        assert!(scan.was_cancelled);
        assert!(scan.all_tracks.is_empty());
    }

    #[test]
    fn test_missing_destination_starts_nothing() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let root = temp_dir.path().join("NOT_MOUNTED");
        let coordinator = ExportCoordinator::new(ExportJob::new("NOT_MOUNTED", &root));
        let mut library = catalogue(&[]);

        let err = coordinator.export(&mut library).expect_err("missing volume");
        assert!(matches!(
            err,
            Error::Export(ExportError::DestinationUnavailable { .. })
        ));
        assert!(!root.exists());
        assert_eq!(coordinator.poll_progress(), ProgressPoll::Done);
    }

    #[test]
    fn test_coordinator_runs_again_after_returning() {
        let source = TempDir::new().expect("create source dir");
        let volume = TempDir::new().expect("create volume dir");
        fs::write(source.path().join("a.mp3"), b"audio").expect("write source");
        let entries = [entry_xml(source.path(), "a.mp3", "user")];
        let coordinator = ExportCoordinator::new(ExportJob::new("STICK", volume.path()));

        let first = coordinator
            .export(&mut catalogue(&entries))
            .expect("first run");
        assert_eq!(first.transfer.files_copied, 1);
        assert!(matches!(coordinator.poll_progress(), ProgressPoll::Events(e) if !e.is_empty()));
        assert_eq!(coordinator.poll_progress(), ProgressPoll::Done);

        let second = coordinator
            .export(&mut catalogue(&entries))
            .expect("second run");
        assert!(second.is_completed());
        assert_eq!(second.transfer.files_copied, 0);
        assert_eq!(second.transfer.files_skipped, 1);
        // Only playlist events this time, then the sentinel again.
        match coordinator.poll_progress() {
            ProgressPoll::Events(events) => assert!(
                events
                    .iter()
                    .all(|e| e.action == crate::progress::ProgressAction::Playlist)
            ),
            ProgressPoll::Done => panic!("second run events were lost"),
        }
        assert_eq!(coordinator.poll_progress(), ProgressPoll::Done);
    }

    #[test]
    fn test_invalid_options_are_rejected() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let options = TransferOptions {
            min_buffer_size: 0,
            ..TransferOptions::default()
        };
        let coordinator =
            ExportCoordinator::with_options(ExportJob::new("STICK", temp_dir.path()), options);
        let err = coordinator
            .export(&mut catalogue(&[]))
            .expect_err("invalid options");
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_report_summary() {
        let report = ExportReport {
            outcome: ExportOutcome::Completed,
            tracks_accepted: 3,
            entries_missing: 0,
            recordings_skipped: 0,
            transfer: TransferResult {
                files_copied: 2,
                files_skipped: 1,
                ..TransferResult::default()
            },
            cleanup: Some(CleanupResult {
                files_deleted: 1,
                ..CleanupResult::default()
            }),
            playlists: PlaylistExportResult {
                playlists_written: 4,
                ..PlaylistExportResult::default()
            },
            duration_secs: 1.5,
        };
        assert!(report.is_completed());
        assert_eq!(
            report.summary(),
            "Export completed: 3 tracks, 2 copied, 1 up to date, 0 failed; 4 playlists written; 1 orphans deleted in 1.5s"
        );
    }
}
