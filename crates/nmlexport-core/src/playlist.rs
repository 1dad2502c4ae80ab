//! Playlist tree export.
//!
//! Rebuilds the catalogue's playlist folder hierarchy as real directories under
//! the destination root and writes one self-contained `.nml` document per
//! playlist. Each document carries its own copy of every member's collection
//! record, so it can be imported on its own.
//!
//! # Example
//!
//! ```rust,ignore
//! use nmlexport_core::playlist::PlaylistTreeExporter;
//!
//! let exporter = PlaylistTreeExporter::new(&library, &by_name);
//! let result = exporter.export(&all_tracks, Path::new("/Volumes/STICK"), |_| {});
//! println!("{}", result.summary());
//! ```

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::library::{
    Library, PlaylistNode, TrackEntry, file_name_from_key, normalize_file_name,
    push_playlist_member,
};
use crate::progress::{CancellationToken, ProgressAction, ProgressEvent};

// =============================================================================
// Constants
// =============================================================================

/// Playlists that are never exported.
pub const RESERVED_PLAYLISTS: &[&str] = &["_LOOPS", "_RECORDINGS"];

/// File extension of exported playlist documents.
pub const PLAYLIST_EXTENSION: &str = "nml";

/// Name of the synthetic playlist holding every exported track.
pub const ALL_TRACKS_PLAYLIST: &str = "All tracks";

/// Folders nested deeper than this are not exported.
pub const MAX_FOLDER_DEPTH: usize = 64;

/// Characters replaced by a dash in folder and playlist file names.
const FORBIDDEN_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// Make a display name usable as a file or directory name.
#[must_use]
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| if FORBIDDEN_CHARS.contains(&c) { '-' } else { c })
        .collect()
}

/// Whether a playlist name is reserved and never exported.
#[must_use]
pub fn is_reserved_playlist(name: &str) -> bool {
    RESERVED_PLAYLISTS.contains(&name)
}

// =============================================================================
// Export Result
// =============================================================================

/// Statistics of one playlist export pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistExportResult {
    /// Playlist documents written, "All tracks" included.
    pub playlists_written: usize,
    /// Playlist documents that could not be written.
    pub playlists_failed: usize,
    /// Member references that matched no exported track.
    pub references_dropped: usize,
    /// Folders created or reused.
    pub folders_visited: usize,
    /// Whether the pass stopped early because of cancellation.
    pub was_cancelled: bool,
}

impl PlaylistExportResult {
    /// Get a summary string of the playlist export.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "Wrote {} playlists in {} folders ({} failed, {} references dropped)",
            self.playlists_written,
            self.folders_visited,
            self.playlists_failed,
            self.references_dropped
        )
    }
}

// =============================================================================
// Playlist Tree Exporter
// =============================================================================

/// Writes the playlist hierarchy of a catalogue as a tree of `.nml` documents.
///
/// `by_name` maps normalized file names to indices into the catalogue's
/// collection entries; only tracks present there can appear in an export.
#[derive(Debug, Clone)]
pub struct PlaylistTreeExporter<'a> {
    library: &'a Library,
    by_name: &'a HashMap<String, usize>,
    cancellation: CancellationToken,
}

impl<'a> PlaylistTreeExporter<'a> {
    /// Create an exporter with its own cancellation token.
    #[must_use]
    pub fn new(library: &'a Library, by_name: &'a HashMap<String, usize>) -> Self {
        Self::with_cancellation(library, by_name, CancellationToken::new())
    }

    /// Create an exporter observing a shared cancellation token.
    #[must_use]
    pub const fn with_cancellation(
        library: &'a Library,
        by_name: &'a HashMap<String, usize>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            library,
            by_name,
            cancellation,
        }
    }

    /// Check if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Write "All tracks" at `destination_root`, then mirror the folder tree below it.
    pub fn export<F>(
        &self,
        all_tracks: &[usize],
        destination_root: &Path,
        mut on_progress: F,
    ) -> PlaylistExportResult
    where
        F: FnMut(ProgressEvent),
    {
        let mut result = PlaylistExportResult::default();

        if self.is_cancelled() {
            result.was_cancelled = true;
            return result;
        }
        self.write_counted(
            ALL_TRACKS_PLAYLIST,
            all_tracks,
            destination_root,
            &mut result,
            &mut on_progress,
        );

        match self.library.playlist_root() {
            Some(root) => {
                self.visit_folder(root, destination_root, 0, &mut result, &mut on_progress);
            }
            None => debug!("Catalogue has no playlist hierarchy"),
        }

        info!("Playlist export complete: {}", result.summary());
        result
    }

    fn visit_folder(
        &self,
        folder: PlaylistNode<'_>,
        directory: &Path,
        depth: usize,
        result: &mut PlaylistExportResult,
        on_progress: &mut dyn FnMut(ProgressEvent),
    ) {
        if self.is_cancelled() {
            info!("Playlist export cancelled in {}", directory.display());
            result.was_cancelled = true;
            return;
        }
        if depth > MAX_FOLDER_DEPTH {
            warn!(
                "Skipping folder {} nested deeper than {} levels",
                folder.name(),
                MAX_FOLDER_DEPTH
            );
            return;
        }

        for child in folder.children() {
            match child {
                PlaylistNode::Folder { name, .. } => {
                    let subdirectory = directory.join(sanitize_file_name(name));
                    match fs::create_dir(&subdirectory) {
                        Ok(()) => debug!("Created folder {}", subdirectory.display()),
                        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                        Err(e) => warn!(
                            "Failed to create folder {}: {}",
                            subdirectory.display(),
                            e
                        ),
                    }
                    result.folders_visited += 1;
                    self.visit_folder(child, &subdirectory, depth + 1, result, on_progress);
                }
                PlaylistNode::Playlist { name, .. } => {
                    if is_reserved_playlist(name) {
                        debug!("Skipping reserved playlist {}", name);
                        continue;
                    }
                    let (members, dropped) = self.resolve_members(child);
                    result.references_dropped += dropped;
                    self.write_counted(name, &members, directory, result, on_progress);
                }
                PlaylistNode::Other { kind, name } => {
                    debug!("Skipping {} node {}", kind, name);
                }
            }
        }
    }

    /// Map a playlist's member keys onto exported tracks, in playlist order.
    ///
    /// Returns the matched entry indices and the number of dropped references.
    pub fn resolve_members(&self, playlist: PlaylistNode<'_>) -> (Vec<usize>, usize) {
        let mut members = Vec::new();
        let mut dropped = 0;
        for key in playlist.member_keys() {
            let name = normalize_file_name(file_name_from_key(key));
            if let Some(&index) = self.by_name.get(&name) {
                members.push(index);
            } else {
                warn!(
                    "Playlist {} references {} which is not exported",
                    playlist.name(),
                    key
                );
                dropped += 1;
            }
        }
        (members, dropped)
    }

    fn write_counted(
        &self,
        name: &str,
        members: &[usize],
        directory: &Path,
        result: &mut PlaylistExportResult,
        on_progress: &mut dyn FnMut(ProgressEvent),
    ) {
        on_progress(ProgressEvent::new(ProgressAction::Playlist, name));
        match self.write_playlist(name, members, directory) {
            Ok(path) => {
                debug!("Wrote playlist {}", path.display());
                result.playlists_written += 1;
            }
            Err(e) => {
                error!("Failed to write playlist {}: {}", name, e);
                result.playlists_failed += 1;
            }
        }
    }

    /// Write one playlist document to `<directory>/<sanitized name>.nml`.
    pub fn write_playlist(&self, name: &str, members: &[usize], directory: &Path) -> Result<PathBuf> {
        let entries = self.library.entries();
        let tracks: Vec<TrackEntry<'_>> = members
            .iter()
            .filter_map(|&i| entries.get(i))
            .map(TrackEntry::new)
            .collect();

        let mut document = Library::new_document();
        for track in &tracks {
            document.append_collection_entry(track.element().clone());
        }
        let playlist = document.create_playlist_structure(name, tracks.len());
        for track in &tracks {
            if let Some(key) = track.primary_key() {
                push_playlist_member(playlist, &key);
            }
        }

        let path = directory.join(format!(
            "{}.{PLAYLIST_EXTENSION}",
            sanitize_file_name(name)
        ));
        document.write(&path)?;
        Ok(path)
    }
}
