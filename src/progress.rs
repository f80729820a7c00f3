// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use std::sync::Arc;

use crate::task::{Activity, TaskId};

/// Events emitted by tasks for progress reporting
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Task was accepted into the queue
    TaskQueued {
        task: TaskId,
        activity: Activity,
        title: String,
    },

    /// A worker started running the task
    TaskStarted {
        task: TaskId,
        activity: Activity,
        title: String,
        /// Expected size in bytes, if known
        total_bytes: Option<u64>,
    },

    /// Progress update, rate-limited by `progress_interval_ms`
    TaskProgress {
        task: TaskId,
        /// Fraction done, never decreasing within a run
        progress: f64,
        /// Bytes per second
        speed: f64,
        total_bytes: Option<u64>,
    },

    /// A short read is being retried
    TransferRetrying {
        task: TaskId,
        title: String,
        attempt: u32,
        error: String,
    },

    /// Download is being finalized (renamed from .partial)
    Finalizing { task: TaskId, title: String },

    /// Task reached DONE
    TaskCompleted {
        task: TaskId,
        activity: Activity,
        title: String,
        /// Where the file ended up, for downloads
        path: Option<PathBuf>,
        bytes: u64,
    },

    /// Task reached FAILED
    TaskFailed {
        task: TaskId,
        title: String,
        error: String,
    },

    /// Task reached PAUSED
    TaskPaused { task: TaskId, title: String },

    /// Task reached CANCELLED
    TaskCancelled { task: TaskId, title: String },
}

impl ProgressEvent {
    /// The task this event is about
    pub fn task(&self) -> TaskId {
        match self {
            ProgressEvent::TaskQueued { task, .. }
            | ProgressEvent::TaskStarted { task, .. }
            | ProgressEvent::TaskProgress { task, .. }
            | ProgressEvent::TransferRetrying { task, .. }
            | ProgressEvent::Finalizing { task, .. }
            | ProgressEvent::TaskCompleted { task, .. }
            | ProgressEvent::TaskFailed { task, .. }
            | ProgressEvent::TaskPaused { task, .. }
            | ProgressEvent::TaskCancelled { task, .. } => *task,
        }
    }
}

/// Trait for reporting progress events of queued tasks.
///
/// Implementations can use this to display progress bars, log messages,
/// or collect statistics. Events are delivered on worker threads.
pub trait ProgressReporter: Send + Sync {
    /// Report a progress event
    fn report(&self, event: ProgressEvent);
}

/// A shared reference to a progress reporter
pub type SharedProgressReporter = Arc<dyn ProgressReporter>;

/// A no-op progress reporter that silently ignores all events.
/// Useful for tests or quiet mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _event: ProgressEvent) {}
}

impl NoopReporter {
    /// Create a new NoopReporter wrapped in an Arc
    pub fn shared() -> SharedProgressReporter {
        Arc::new(Self)
    }
}
