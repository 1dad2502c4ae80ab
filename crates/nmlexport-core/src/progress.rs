//! Progress reporting and cancellation shared between the export workers.
//!
//! Workers push [`ProgressEvent`]s into a [`ProgressChannel`] and check a
//! [`CancellationToken`] before every unit of work. The presentation layer
//! pulls events with [`RunState`]-aware polling, so "nothing new yet" and
//! "run complete" are distinguishable.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// What a worker just did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressAction {
    /// An audio file is being copied.
    Copy,
    /// An orphaned file is being removed.
    Delete,
    /// A playlist document is being written.
    Playlist,
}

impl std::fmt::Display for ProgressAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            Self::Copy => "copy",
            Self::Delete => "delete",
            Self::Playlist => "playlist",
        })
    }
}

/// One progress notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Kind of work.
    pub action: ProgressAction,
    /// Display name of the item (file name or playlist name).
    pub item: String,
}

impl ProgressEvent {
    /// Create a new event.
    pub fn new(action: ProgressAction, item: impl Into<String>) -> Self {
        Self {
            action,
            item: item.into(),
        }
    }
}

/// Result of polling a run for progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressPoll {
    /// Events queued since the last poll (possibly none).
    Events(Vec<ProgressEvent>),
    /// The run is over and every event has been handed out.
    Done,
}

/// Unbounded FIFO of progress events: many producers, one consumer.
#[derive(Debug)]
pub struct ProgressChannel {
    sender: mpsc::UnboundedSender<ProgressEvent>,
    receiver: Mutex<mpsc::UnboundedReceiver<ProgressEvent>>,
}

impl Default for ProgressChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressChannel {
    /// Create an empty channel.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    /// Queue an event. Never blocks.
    pub fn push(&self, event: ProgressEvent) {
        // The receiver lives as long as `self`, so sending cannot fail.
        let _ = self.sender.send(event);
    }

    /// Take every queued event, oldest first.
    pub fn drain(&self) -> Vec<ProgressEvent> {
        let mut receiver = self.receiver.lock().unwrap_or_else(PoisonError::into_inner);
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Shared stop flag. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Lifecycle flags of one export run.
///
/// Owned by the coordinator; workers only read the cancellation token.
#[derive(Debug, Default)]
pub struct RunState {
    cancellation: CancellationToken,
    live: AtomicBool,
    finished: AtomicBool,
    active_workers: AtomicUsize,
}

impl RunState {
    /// Create state for a new run.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the live and finished flags ahead of another run.
    ///
    /// Cancellation is sticky: a cancelled state stays cancelled.
    pub fn begin(&self) {
        self.live.store(false, Ordering::SeqCst);
        self.finished.store(false, Ordering::SeqCst);
    }

    /// Token handed to workers.
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Mark progress reporting live. Called once every worker is running.
    pub fn go_live(&self) {
        self.live.store(true, Ordering::SeqCst);
    }

    /// Whether progress reporting went live.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Mark the run as over, whatever the outcome.
    pub fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    /// Whether the run is over.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Number of workers still running.
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// Register a worker; the returned guard unregisters it when dropped.
    pub fn enter_worker(&self) -> WorkerGuard<'_> {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
        WorkerGuard { state: self }
    }

    /// Drain `channel`, reporting [`ProgressPoll::Done`] once nothing more can arrive.
    pub fn poll(&self, channel: &ProgressChannel) -> ProgressPoll {
        // Checked before draining: a worker's pushes precede its exit.
        let done = (self.is_live() && self.active_workers() == 0) || self.is_finished();
        let events = channel.drain();
        if events.is_empty() && done {
            ProgressPoll::Done
        } else {
            ProgressPoll::Events(events)
        }
    }
}

/// Keeps a worker counted as in flight.
#[derive(Debug)]
pub struct WorkerGuard<'a> {
    state: &'a RunState,
}

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        self.state.active_workers.fetch_sub(1, Ordering::SeqCst);
    }
}
