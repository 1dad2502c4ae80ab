//! Integration tests for whole export runs.
//!
//! Each test builds a catalogue pointing at audio files in one temporary
//! directory and exports it to another temporary directory standing in for the
//! mounted volume.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use nmlexport_core::library::{Location, file_name_from_key, path_to_nml_dir};
use nmlexport_core::{
    Error, ExportCoordinator, ExportError, ExportHandle, ExportJob, ExportOutcome, Library,
    ProgressAction, ProgressEvent, ProgressPoll,
};
use tempfile::TempDir;

// =============================================================================
// Test Fixtures and Utilities
// =============================================================================

/// Source audio directory plus a directory simulating the mounted volume.
struct TestFixture {
    source_dir: TempDir,
    volume_dir: TempDir,
}

impl TestFixture {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("nmlexport_core=debug")
            .try_init();
        Self {
            source_dir: TempDir::new().expect("create source dir"),
            volume_dir: TempDir::new().expect("create volume dir"),
        }
    }

    fn source(&self) -> &Path {
        self.source_dir.path()
    }

    fn volume(&self) -> &Path {
        self.volume_dir.path()
    }

    fn music_dir(&self) -> PathBuf {
        self.volume().join(".Music")
    }

    /// Write an audio file into the source directory.
    fn add_audio(&self, name: &str) {
        fs::write(self.source().join(name), format!("audio data of {name}"))
            .expect("write audio file");
    }

    /// Catalogue record for a file in the source directory.
    fn entry(&self, file: &str, author: &str) -> String {
        format!(
            r#"<ENTRY TITLE="{file}"><LOCATION DIR="{}" FILE="{file}" VOLUME="Macintosh HD" VOLUMEID="abc"/><MODIFICATION_INFO AUTHOR_TYPE="{author}"/></ENTRY>"#,
            path_to_nml_dir(self.source())
        )
    }

    /// Playlist member key for a file in the source directory.
    fn key(&self, file: &str) -> String {
        format!("Macintosh HD{}{file}", path_to_nml_dir(self.source()))
    }

    fn job(&self) -> ExportJob {
        ExportJob::new("STICK", self.volume())
    }
}

fn playlist(name: &str, keys: &[String]) -> String {
    let members: String = keys
        .iter()
        .map(|k| format!(r#"<ENTRY><PRIMARYKEY TYPE="TRACK" KEY="{k}"/></ENTRY>"#))
        .collect();
    format!(
        r#"<NODE TYPE="PLAYLIST" NAME="{name}"><PLAYLIST ENTRIES="{}" TYPE="LIST">{members}</PLAYLIST></NODE>"#,
        keys.len()
    )
}

fn folder(name: &str, children: &[String]) -> String {
    format!(
        r#"<NODE TYPE="FOLDER" NAME="{name}"><SUBNODES COUNT="{}">{}</SUBNODES></NODE>"#,
        children.len(),
        children.concat()
    )
}

fn catalogue(entries: &[String], nodes: &[String]) -> Library {
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="no" ?>
<NML VERSION="19"><COLLECTION ENTRIES="{}">{}</COLLECTION><PLAYLISTS>{}</PLAYLISTS></NML>"#,
        entries.len(),
        entries.concat(),
        folder("$ROOT", nodes)
    );
    Library::parse(&xml).expect("parse catalogue")
}

/// Poll until the run reports done, collecting every event.
fn drain(coordinator: &ExportCoordinator) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let ProgressPoll::Events(batch) = coordinator.poll_progress() {
        events.extend(batch);
    }
    events
}

fn items(events: &[ProgressEvent], action: ProgressAction) -> Vec<String> {
    let mut items: Vec<String> = events
        .iter()
        .filter(|e| e.action == action)
        .map(|e| e.item.clone())
        .collect();
    items.sort();
    items
}

fn playlist_members(path: &Path) -> Vec<String> {
    let document = Library::open(path).expect("open exported playlist");
    let root = document.playlist_root().expect("playlist root");
    root.children()
        .first()
        .expect("playlist node")
        .member_keys()
        .into_iter()
        .map(|k| file_name_from_key(k).to_string())
        .collect()
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn test_export_skips_missing_and_recordings() {
    let fixture = TestFixture::new();
    for name in ["a.mp3", "b.mp3", "c.flac", "take1.wav"] {
        fixture.add_audio(name);
    }
    let mut library = catalogue(
        &[
            fixture.entry("a.mp3", "user"),
            fixture.entry("gone.mp3", "user"),
            fixture.entry("b.mp3", "user"),
            fixture.entry("take1.wav", "importer"),
            fixture.entry("c.flac", "user"),
        ],
        &[],
    );

    let coordinator = ExportCoordinator::new(fixture.job());
    let report = coordinator.export(&mut library).expect("export");
    let events = drain(&coordinator);

    assert_eq!(report.outcome, ExportOutcome::Completed);
    assert_eq!(report.tracks_accepted, 3);
    assert_eq!(report.entries_missing, 1);
    assert_eq!(report.recordings_skipped, 1);
    assert_eq!(
        items(&events, ProgressAction::Copy),
        vec!["a.mp3", "b.mp3", "c.flac"]
    );
    assert!(!fixture.music_dir().join("take1.wav").exists());
    assert_eq!(
        playlist_members(&fixture.volume().join("All tracks.nml")),
        vec!["a.mp3", "b.mp3", "c.flac"]
    );
}

#[test]
fn test_rerun_copies_nothing_but_rewrites_playlists() {
    let fixture = TestFixture::new();
    fixture.add_audio("a.mp3");
    fixture.add_audio("b.mp3");
    let entries = [fixture.entry("a.mp3", "user"), fixture.entry("b.mp3", "user")];
    let nodes = [playlist("Warmup", &[fixture.key("b.mp3")])];

    let first = ExportCoordinator::new(fixture.job());
    first
        .export(&mut catalogue(&entries, &nodes))
        .expect("first export");
    let first_events = drain(&first);
    assert_eq!(items(&first_events, ProgressAction::Copy).len(), 2);

    let second = ExportCoordinator::new(fixture.job());
    let report = second
        .export(&mut catalogue(&entries, &nodes))
        .expect("second export");
    let second_events = drain(&second);

    assert_eq!(report.transfer.files_skipped, 2);
    assert!(items(&second_events, ProgressAction::Copy).is_empty());
    assert_eq!(
        items(&second_events, ProgressAction::Playlist),
        vec!["All tracks", "Warmup"]
    );
}

#[test]
fn test_orphans_removed_only_when_requested() {
    let fixture = TestFixture::new();
    fixture.add_audio("a.mp3");
    fs::create_dir_all(fixture.music_dir()).expect("create music dir");
    fs::write(fixture.music_dir().join("ghost.mp3"), b"old").expect("write ghost");
    let entries = [fixture.entry("a.mp3", "user")];

    let keep = ExportCoordinator::new(fixture.job());
    let report = keep
        .export(&mut catalogue(&entries, &[]))
        .expect("export without cleanup");
    assert!(report.cleanup.is_none());
    assert!(items(&drain(&keep), ProgressAction::Delete).is_empty());
    assert!(fixture.music_dir().join("ghost.mp3").exists());

    let clean = ExportCoordinator::new(fixture.job().with_remove_orphans(true));
    let report = clean
        .export(&mut catalogue(&entries, &[]))
        .expect("export with cleanup");
    let events = drain(&clean);

    assert_eq!(items(&events, ProgressAction::Delete), vec!["ghost.mp3"]);
    assert_eq!(report.cleanup.map(|c| c.files_deleted), Some(1));
    assert!(!fixture.music_dir().join("ghost.mp3").exists());
    assert!(fixture.music_dir().join("a.mp3").exists());
}

#[test]
fn test_reserved_playlists_and_dropped_references() {
    let fixture = TestFixture::new();
    fixture.add_audio("a.mp3");
    fixture.add_audio("b.mp3");
    let mut library = catalogue(
        &[fixture.entry("a.mp3", "user"), fixture.entry("b.mp3", "user")],
        &[
            playlist("_LOOPS", &[fixture.key("a.mp3")]),
            playlist("_RECORDINGS", &[fixture.key("b.mp3")]),
            playlist(
                "Closing",
                &[
                    fixture.key("b.mp3"),
                    fixture.key("never-imported.mp3"),
                    fixture.key("a.mp3"),
                ],
            ),
        ],
    );

    let coordinator = ExportCoordinator::new(fixture.job());
    let report = coordinator.export(&mut library).expect("export");

    assert_eq!(report.playlists.playlists_written, 2);
    assert_eq!(report.playlists.references_dropped, 1);
    assert!(!fixture.volume().join("_LOOPS.nml").exists());
    assert!(!fixture.volume().join("_RECORDINGS.nml").exists());
    assert_eq!(
        playlist_members(&fixture.volume().join("Closing.nml")),
        vec!["b.mp3", "a.mp3"]
    );
}

#[test]
fn test_folder_tree_is_mirrored_with_sanitized_names() {
    let fixture = TestFixture::new();
    fixture.add_audio("a.mp3");
    let mut library = catalogue(
        &[fixture.entry("a.mp3", "user")],
        &[folder(
            "Gigs",
            &[folder(
                "Club: Night",
                &[playlist("Peak/Time", &[fixture.key("a.mp3")])],
            )],
        )],
    );

    let coordinator = ExportCoordinator::new(fixture.job());
    coordinator.export(&mut library).expect("export");
    let events = drain(&coordinator);

    let written = fixture.volume().join("Gigs/Club- Night/Peak-Time.nml");
    assert!(written.exists());
    assert_eq!(playlist_members(&written), vec!["a.mp3"]);
    // Events carry the display name, not the file name.
    assert!(
        items(&events, ProgressAction::Playlist).contains(&"Peak/Time".to_string())
    );
}

#[test]
fn test_catalogue_is_relocated_onto_volume() {
    let fixture = TestFixture::new();
    fixture.add_audio("a.mp3");
    let library = catalogue(
        &[fixture.entry("a.mp3", "user"), fixture.entry("gone.mp3", "user")],
        &[],
    );

    let handle = ExportHandle::start(library, fixture.job()).expect("start export");
    let completed = handle.join().expect("join export");
    let report = completed.result.expect("export result");
    assert!(report.is_completed());

    let relocated = Location::of(&completed.library.entries()[0]).expect("location");
    assert_eq!(relocated.dir, "/:.Music/:");
    assert_eq!(relocated.volume, "STICK");
    assert_eq!(relocated.volume_id, "STICK");
    assert!(fixture.music_dir().join(&relocated.file).exists());

    let untouched = Location::of(&completed.library.entries()[1]).expect("location");
    assert_eq!(untouched.volume, "Macintosh HD");
}

#[test]
fn test_missing_volume_fails_before_any_work() {
    let fixture = TestFixture::new();
    fixture.add_audio("a.mp3");
    let library = catalogue(&[fixture.entry("a.mp3", "user")], &[]);
    let root = fixture.volume().join("UNPLUGGED");

    let handle =
        ExportHandle::start(library, ExportJob::new("UNPLUGGED", &root)).expect("start export");
    let mut polls = 0;
    while let ProgressPoll::Events(events) = handle.poll() {
        assert!(events.is_empty());
        polls += 1;
        assert!(polls < 500, "export never reported done");
        thread::sleep(Duration::from_millis(10));
    }

    let completed = handle.join().expect("join export");
    assert!(matches!(
        completed.result,
        Err(Error::Export(ExportError::DestinationUnavailable { .. }))
    ));
    assert!(!root.exists());
    let location = Location::of(&completed.library.entries()[0]).expect("location");
    assert_eq!(location.volume, "Macintosh HD");
}

#[test]
fn test_cancelled_run_copies_nothing() {
    let fixture = TestFixture::new();
    fixture.add_audio("a.mp3");
    fixture.add_audio("b.mp3");
    let mut library = catalogue(
        &[fixture.entry("a.mp3", "user"), fixture.entry("b.mp3", "user")],
        &[playlist("Warmup", &[fixture.key("a.mp3")])],
    );

    let coordinator = ExportCoordinator::new(fixture.job());
    coordinator.cancel();
    coordinator.cancel();
    let report = coordinator.export(&mut library).expect("cancelled export");

    assert_eq!(report.outcome, ExportOutcome::Cancelled);
    assert_eq!(report.transfer.files_copied, 0);
    assert!(drain(&coordinator).is_empty());
    assert!(!fixture.volume().join("All tracks.nml").exists());
}

#[test]
fn test_cancel_during_run_stops_every_worker() {
    let fixture = TestFixture::new();
    let content = vec![0x5a_u8; 4 * 1024 * 1024];
    let names: Vec<String> = (0..40).map(|i| format!("set{i:02}.flac")).collect();
    for name in &names {
        fs::write(fixture.source().join(name), &content).expect("write audio file");
    }
    fs::create_dir_all(fixture.music_dir()).expect("create music dir");
    for i in 0..10 {
        fs::write(fixture.music_dir().join(format!("stale{i}.mp3")), b"old")
            .expect("write orphan");
    }
    let entries: Vec<String> = names.iter().map(|n| fixture.entry(n, "user")).collect();
    let keys: Vec<String> = names.iter().map(|n| fixture.key(n)).collect();
    let library = catalogue(&entries, &[playlist("Long set", &keys)]);

    let handle = ExportHandle::start(library, fixture.job().with_remove_orphans(true))
        .expect("start export");

    let mut seen = Vec::new();
    while seen.is_empty() {
        match handle.poll() {
            ProgressPoll::Events(batch) => seen.extend(batch),
            ProgressPoll::Done => panic!("export finished before any progress"),
        }
        thread::sleep(Duration::from_millis(1));
    }
    handle.cancel();

    // Each worker only finishes the unit it is on.
    let mut waited = 0;
    while !handle.is_finished() {
        waited += 1;
        assert!(waited < 1000, "export kept running after cancel");
        thread::sleep(Duration::from_millis(10));
    }
    while let ProgressPoll::Events(batch) = handle.poll() {
        seen.extend(batch);
    }

    let completed = handle.join().expect("join export");
    let report = completed.result.expect("cancelled export");
    assert_eq!(report.outcome, ExportOutcome::Cancelled);
    assert!(report.transfer.was_cancelled);
    assert!(report.transfer.files_copied < names.len());
    assert_eq!(
        items(&seen, ProgressAction::Copy).len(),
        report.transfer.files_copied + report.transfer.files_failed
    );
}

#[test]
fn test_handle_polling_sees_every_event_then_done() {
    let fixture = TestFixture::new();
    let names: Vec<String> = (0..20).map(|i| format!("track{i:02}.mp3")).collect();
    for name in &names {
        fixture.add_audio(name);
    }
    let entries: Vec<String> = names.iter().map(|n| fixture.entry(n, "user")).collect();
    let library = catalogue(&entries, &[]);

    let handle = ExportHandle::start(library, fixture.job()).expect("start export");
    let mut events = Vec::new();
    loop {
        match handle.poll() {
            ProgressPoll::Events(batch) => events.extend(batch),
            ProgressPoll::Done => break,
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert!(handle.is_finished() || handle.poll() == ProgressPoll::Done);

    let completed = handle.join().expect("join export");
    assert!(completed.result.is_ok());
    assert_eq!(items(&events, ProgressAction::Copy), names);
    assert_eq!(items(&events, ProgressAction::Playlist), vec!["All tracks"]);
}
