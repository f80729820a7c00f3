// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task state machine
//!
//! A [`Task`] moves one episode: either downloading it ([`DownloadTask`]) or
//! copying it onto a device ([`SyncTask`]). Its status lives behind its own
//! lock so any thread can request a pause or cancel; the worker running the
//! task observes such requests at the next progress checkpoint.
//!
//! ```text
//! INIT -> QUEUED -> ACTIVE -> DONE | FAILED
//!                      |-> PAUSING    -> PAUSED
//!                      '-> CANCELLING -> CANCELLED
//! PAUSED | CANCELLED | FAILED -> QUEUED
//! ```

mod download;
mod sync;

use std::fmt;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::SharedConfig;
use crate::episode::Episode;
use crate::error::TaskError;
use crate::progress::{ProgressEvent, SharedProgressReporter};
use crate::throttle::Throttle;
use crate::transfer::Transferer;

pub use download::DownloadTask;
pub use sync::{DeviceTrack, SyncRequest, SyncTarget, SyncTask};

/// Category of work; each has its own worker pool and concurrency bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Activity {
    Download,
    Synchronize,
}

impl Activity {
    pub const ALL: [Activity; 2] = [Activity::Download, Activity::Synchronize];
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Activity::Download => "download",
            Activity::Synchronize => "sync",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Init,
    Queued,
    Active,
    Done,
    Failed,
    Cancelling,
    Cancelled,
    Pausing,
    Paused,
}

impl TaskStatus {
    /// Human-readable status for task lists
    pub fn label(self, activity: Activity) -> &'static str {
        match self {
            TaskStatus::Init => "Added",
            TaskStatus::Queued => "Queued",
            TaskStatus::Active => match activity {
                Activity::Download => "Downloading",
                Activity::Synchronize => "Syncing",
            },
            TaskStatus::Done => "Finished",
            TaskStatus::Failed => "Failed",
            TaskStatus::Cancelling => "Cancelling",
            TaskStatus::Cancelled => "Cancelled",
            TaskStatus::Pausing => "Pausing",
            TaskStatus::Paused => "Paused",
        }
    }

    /// A stop was requested but the worker has not reached a checkpoint yet
    pub fn is_transient(self) -> bool {
        matches!(self, TaskStatus::Cancelling | TaskStatus::Pausing)
    }

    /// No worker is or will be touching the task
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Paused
        )
    }
}

/// Process-unique task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct StatusCell {
    status: TaskStatus,
    changed: bool,
}

impl StatusCell {
    fn set(&mut self, status: TaskStatus) {
        if self.status != status {
            self.status = status;
            self.changed = true;
        }
    }
}

#[derive(Default)]
struct TaskData {
    /// Expected size in bytes, 0 when unknown
    total_size: u64,
    progress: f64,
    speed: f64,
    error_message: Option<String>,
    notification_shown: bool,
}

enum TaskKind {
    Download(DownloadTask),
    Sync(SyncTask),
}

/// What a successful run produced
pub(crate) struct Completion {
    pub(crate) path: Option<PathBuf>,
    pub(crate) bytes: u64,
}

/// A unit of work moving one episode
///
/// Shared as `Arc<Task>` between the queue, the workers and the UI.
/// Lock order is status before data.
pub struct Task {
    id: TaskId,
    episode: Episode,
    kind: TaskKind,
    config: SharedConfig,
    reporter: SharedProgressReporter,
    status: Mutex<StatusCell>,
    data: Mutex<TaskData>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("activity", &self.activity())
            .field("title", &self.episode.title)
            .field("status", &self.status())
            .finish()
    }
}

impl Task {
    /// Task downloading `episode` into `download_dir`
    pub fn download(
        episode: Episode,
        download_dir: impl Into<PathBuf>,
        transferer: Arc<dyn Transferer>,
        config: SharedConfig,
        reporter: SharedProgressReporter,
    ) -> Arc<Self> {
        let download = DownloadTask::new(&episode, download_dir.into(), transferer);
        let mut data = TaskData {
            total_size: episode.enclosure.length.unwrap_or(0),
            ..TaskData::default()
        };
        if let Some(retained) = download.retained_bytes()
            && data.total_size > 0
        {
            data.progress = (retained as f64 / data.total_size as f64).min(1.0);
        }

        Arc::new(Self::new(episode, TaskKind::Download(download), data, config, reporter))
    }

    /// Task copying the downloaded `source` file of `episode` onto `device`
    pub fn sync(
        episode: Episode,
        source: impl Into<PathBuf>,
        device: Arc<dyn SyncTarget>,
        config: SharedConfig,
        reporter: SharedProgressReporter,
    ) -> Arc<Self> {
        let sync = SyncTask::new(source.into(), device);
        let data = TaskData {
            total_size: sync
                .source_size()
                .or(episode.enclosure.length)
                .unwrap_or(0),
            ..TaskData::default()
        };

        Arc::new(Self::new(episode, TaskKind::Sync(sync), data, config, reporter))
    }

    fn new(
        episode: Episode,
        kind: TaskKind,
        data: TaskData,
        config: SharedConfig,
        reporter: SharedProgressReporter,
    ) -> Self {
        Self {
            id: TaskId::new(),
            episode,
            kind,
            config,
            reporter,
            status: Mutex::new(StatusCell {
                status: TaskStatus::Init,
                changed: true,
            }),
            data: Mutex::new(data),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn activity(&self) -> Activity {
        match self.kind {
            TaskKind::Download(_) => Activity::Download,
            TaskKind::Sync(_) => Activity::Synchronize,
        }
    }

    pub fn episode(&self) -> &Episode {
        &self.episode
    }

    pub fn title(&self) -> &str {
        &self.episode.title
    }

    pub fn status(&self) -> TaskStatus {
        self.status.lock().status
    }

    /// True once after every status transition
    ///
    /// Reading resets the flag, so only one observer should poll it.
    pub fn status_changed(&self) -> bool {
        std::mem::take(&mut self.status.lock().changed)
    }

    pub fn total_size(&self) -> u64 {
        self.data.lock().total_size
    }

    pub fn progress(&self) -> f64 {
        self.data.lock().progress
    }

    /// Bytes per second of the running transfer
    pub fn speed(&self) -> f64 {
        self.data.lock().speed
    }

    /// Set when the task FAILED
    pub fn error_message(&self) -> Option<String> {
        self.data.lock().error_message.clone()
    }

    pub fn final_path(&self) -> Option<PathBuf> {
        match &self.kind {
            TaskKind::Download(download) => Some(download.final_path()),
            TaskKind::Sync(_) => None,
        }
    }

    pub fn partial_path(&self) -> Option<PathBuf> {
        match &self.kind {
            TaskKind::Download(download) => Some(download.partial_path()),
            TaskKind::Sync(_) => None,
        }
    }

    /// True the first time it is called after the task is DONE
    pub fn notify_as_finished(&self) -> bool {
        self.notify_once(TaskStatus::Done)
    }

    /// True the first time it is called after the task FAILED
    pub fn notify_as_failed(&self) -> bool {
        self.notify_once(TaskStatus::Failed)
    }

    fn notify_once(&self, wanted: TaskStatus) -> bool {
        let cell = self.status.lock();
        if cell.status != wanted {
            return false;
        }
        let mut data = self.data.lock();
        !std::mem::replace(&mut data.notification_shown, true)
    }

    /// Accept the task into the queue
    ///
    /// Requeueing a paused, cancelled or failed download recreates a missing
    /// partial file as an empty placeholder.
    pub fn queue(&self) -> bool {
        let requeued = {
            let mut cell = self.status.lock();
            let requeued = match cell.status {
                TaskStatus::Init => false,
                TaskStatus::Paused | TaskStatus::Cancelled | TaskStatus::Failed => true,
                _ => return false,
            };
            self.data.lock().error_message = None;
            cell.set(TaskStatus::Queued);
            requeued
        };

        if requeued && let TaskKind::Download(download) = &self.kind {
            download.ensure_partial();
        }

        debug!(task = %self.id, activity = %self.activity(), title = %self.title(), "Task queued");
        self.report(ProgressEvent::TaskQueued {
            task: self.id,
            activity: self.activity(),
            title: self.title().to_string(),
        });
        true
    }

    /// Claim the task for a worker
    ///
    /// `force` also accepts tasks that are not queued, for user-initiated
    /// immediate starts.
    pub(crate) fn activate(&self, force: bool) -> bool {
        let mut cell = self.status.lock();
        let allowed = match cell.status {
            TaskStatus::Queued => true,
            TaskStatus::Init | TaskStatus::Paused | TaskStatus::Failed | TaskStatus::Cancelled => force,
            _ => false,
        };
        if allowed {
            let mut data = self.data.lock();
            data.error_message = None;
            data.notification_shown = false;
            cell.set(TaskStatus::Active);
        }
        allowed
    }

    /// Ask the task to pause, keeping its partial file
    pub fn pause(&self) -> bool {
        let mut cell = self.status.lock();
        match cell.status {
            TaskStatus::Active => {
                cell.set(TaskStatus::Pausing);
                true
            }
            TaskStatus::Queued => {
                cell.set(TaskStatus::Paused);
                drop(cell);
                self.report_paused();
                true
            }
            _ => false,
        }
    }

    /// Ask the task to cancel, discarding its partial work
    ///
    /// A task that is not transferring is cleaned up right away; a running
    /// one stops at its next progress checkpoint.
    pub fn cancel(&self) -> bool {
        {
            let mut cell = self.status.lock();
            match cell.status {
                TaskStatus::Active | TaskStatus::Pausing => {
                    cell.set(TaskStatus::Cancelling);
                    return true;
                }
                TaskStatus::Init | TaskStatus::Queued | TaskStatus::Paused | TaskStatus::Failed => {
                    cell.set(TaskStatus::Cancelling);
                }
                _ => return false,
            }
        }
        self.finish_cancel();
        true
    }

    /// Release what the task holds on disk when it leaves the task list
    pub fn removed_from_list(&self) {
        if self.status() != TaskStatus::Done {
            self.cleanup();
        }
    }

    /// Run the task on the calling thread
    ///
    /// Returns true when the task finished successfully. Every error ends up
    /// in the task status; nothing is propagated to the caller.
    pub fn run(&self) -> bool {
        {
            let mut cell = self.status.lock();
            match cell.status {
                TaskStatus::Active => {}
                TaskStatus::Cancelling => {
                    drop(cell);
                    self.finish_cancel();
                    return false;
                }
                TaskStatus::Pausing => {
                    cell.set(TaskStatus::Paused);
                    drop(cell);
                    self.report_paused();
                    return false;
                }
                _ => return false,
            }
        }

        info!(task = %self.id, activity = %self.activity(), title = %self.title(), "Task started");
        self.report(ProgressEvent::TaskStarted {
            task: self.id,
            activity: self.activity(),
            title: self.title().to_string(),
            total_bytes: self.known_total(),
        });

        let mut attempt = Attempt::new(self);
        let result = match &self.kind {
            TaskKind::Download(download) => download.run(&mut attempt),
            TaskKind::Sync(sync) => sync.run(&mut attempt),
        };
        self.data.lock().speed = 0.0;

        match result {
            Ok(completion) => {
                self.complete(completion, &mut attempt);
                true
            }
            Err(error) => {
                self.settle_error(error);
                false
            }
        }
    }

    /// Mark the task FAILED after its run panicked
    pub(crate) fn fail_after_panic(&self, message: String) {
        self.data.lock().speed = 0.0;
        self.settle_error(TaskError::Panicked(message));
    }

    fn complete(&self, completion: Completion, attempt: &mut Attempt<'_>) {
        {
            let mut data = self.data.lock();
            data.progress = 1.0;
            if completion.bytes > 0 {
                data.total_size = completion.bytes;
            }
        }
        attempt.report_progress();
        self.status.lock().set(TaskStatus::Done);

        info!(task = %self.id, title = %self.title(), bytes = completion.bytes, "Task finished");
        self.report(ProgressEvent::TaskCompleted {
            task: self.id,
            activity: self.activity(),
            title: self.title().to_string(),
            path: completion.path,
            bytes: completion.bytes,
        });
    }

    /// Resolve a failed run; a pending pause or cancel wins over the error
    fn settle_error(&self, error: TaskError) {
        let message = error.to_string();
        let settled = {
            let mut cell = self.status.lock();
            match cell.status {
                TaskStatus::Cancelling => TaskStatus::Cancelling,
                TaskStatus::Pausing => {
                    cell.set(TaskStatus::Paused);
                    TaskStatus::Paused
                }
                _ => {
                    self.data.lock().error_message = Some(message.clone());
                    cell.set(TaskStatus::Failed);
                    TaskStatus::Failed
                }
            }
        };

        match settled {
            TaskStatus::Cancelling => self.finish_cancel(),
            TaskStatus::Paused => self.report_paused(),
            _ => {
                warn!(task = %self.id, title = %self.title(), "Task failed: {}", message);
                self.report(ProgressEvent::TaskFailed {
                    task: self.id,
                    title: self.title().to_string(),
                    error: message,
                });
            }
        }
    }

    /// CANCELLING -> CANCELLED, deleting partial work in between
    fn finish_cancel(&self) {
        self.cleanup();
        self.status.lock().set(TaskStatus::Cancelled);
        info!(task = %self.id, title = %self.title(), "Task cancelled");
        self.report(ProgressEvent::TaskCancelled {
            task: self.id,
            title: self.title().to_string(),
        });
    }

    fn report_paused(&self) {
        info!(task = %self.id, title = %self.title(), "Task paused");
        self.report(ProgressEvent::TaskPaused {
            task: self.id,
            title: self.title().to_string(),
        });
    }

    fn cleanup(&self) {
        {
            let mut data = self.data.lock();
            data.progress = 0.0;
            data.speed = 0.0;
        }
        match &self.kind {
            TaskKind::Download(download) => download.cleanup(),
            TaskKind::Sync(sync) => sync.cleanup(&self.episode),
        }
    }

    fn stop_requested(&self) -> bool {
        self.status().is_transient()
    }

    fn known_total(&self) -> Option<u64> {
        Some(self.total_size()).filter(|&size| size > 0)
    }

    /// Store a new progress fraction; it only moves back when the total changed
    fn record_progress(&self, total: u64, fraction: f64) {
        let mut data = self.data.lock();
        if data.total_size != total {
            data.total_size = total;
            data.progress = fraction;
        } else {
            data.progress = data.progress.max(fraction);
        }
    }

    pub(crate) fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub(crate) fn report(&self, event: ProgressEvent) {
        self.reporter.report(event);
    }

    #[cfg(test)]
    pub(crate) fn force_status(&self, status: TaskStatus) {
        self.status.lock().set(status);
    }
}

/// State of a single run of a task
///
/// Created fresh by every [`Task::run`], so throttle baselines and report
/// timestamps never leak from one attempt into the next.
pub(crate) struct Attempt<'t> {
    task: &'t Task,
    throttle: Throttle,
    interval: Duration,
    last_report: Option<Instant>,
    last_reported: f64,
}

impl<'t> Attempt<'t> {
    fn new(task: &'t Task) -> Self {
        Self {
            task,
            throttle: Throttle::new(),
            interval: task.config.snapshot().progress_interval(),
            last_report: None,
            last_reported: 0.0,
        }
    }

    pub(crate) fn task(&self) -> &'t Task {
        self.task
    }

    /// Progress hook shared by downloads and device copies
    ///
    /// Updates progress, reports it, then checks for a stop request before
    /// applying the bandwidth cap.
    pub(crate) fn on_block(&mut self, block: u64, block_size: usize, total: Option<u64>) -> ControlFlow<()> {
        let task = self.task;
        if let Some(total) = total.filter(|&total| total > 0) {
            let done = block.saturating_mul(block_size as u64).min(total);
            task.record_progress(total, done as f64 / total as f64);
        }
        self.report_progress();

        if task.stop_requested() {
            debug!(task = %task.id, block, "Stop requested, unwinding transfer");
            return ControlFlow::Break(());
        }

        let sample = self
            .throttle
            .sample(Instant::now(), block, block_size, task.config.rate_limit());
        if let Some(speed) = sample.speed {
            task.data.lock().speed = speed;
        }
        if let Some(delay) = sample.delay {
            debug!(task = %task.id, ?delay, "Throttling transfer");
            std::thread::sleep(delay);
        }
        ControlFlow::Continue(())
    }

    /// Emit a progress event if the interval elapsed or the end was reached
    fn report_progress(&mut self) {
        if self.last_reported >= 1.0 {
            return;
        }
        let (progress, speed, total) = {
            let data = self.task.data.lock();
            (data.progress, data.speed, data.total_size)
        };
        let progress = progress.max(self.last_reported);
        let now = Instant::now();
        let due = self
            .last_report
            .is_none_or(|at| now.duration_since(at) >= self.interval);
        if due || progress >= 1.0 {
            self.last_report = Some(now);
            self.last_reported = progress;
            self.task.report(ProgressEvent::TaskProgress {
                task: self.task.id,
                progress,
                speed,
                total_bytes: Some(total).filter(|&t| t > 0),
            });
        }
    }
}
