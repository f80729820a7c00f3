// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::task::{Activity, Task, TaskStatus};

struct Entry {
    task: Arc<Task>,
    /// Still the current task of its episode; cleared by `recycle`
    attached: bool,
}

/// The task list shared by the UI and the worker pool
///
/// Tasks stay listed after they finish until they are removed. Workers only
/// see the queued ones, in insertion order.
#[derive(Default)]
pub struct TaskQueue {
    entries: Mutex<Vec<Entry>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// List a task
    ///
    /// When a task for the same episode and activity is already listed and
    /// attached, that task is returned instead and `task` is dropped.
    pub fn add(&self, task: Arc<Task>) -> Arc<Task> {
        let mut entries = self.entries.lock();

        if let Some(existing) = entries
            .iter()
            .find(|e| Arc::ptr_eq(&e.task, &task))
            .or_else(|| {
                entries.iter().find(|e| {
                    e.attached
                        && e.task.activity() == task.activity()
                        && e.task.episode().key() == task.episode().key()
                })
            })
        {
            return existing.task.clone();
        }

        entries.push(Entry {
            task: task.clone(),
            attached: true,
        });
        task
    }

    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.entries.lock().iter().map(|e| e.task.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Claim the first queued task of `activity`, marking it active
    pub fn get_next(&self, activity: Activity) -> Option<Arc<Task>> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.task.activity() == activity)
            .find(|e| e.task.activate(false))
            .map(|e| e.task.clone())
    }

    pub fn has_work(&self, activity: Activity) -> bool {
        self.available_work(activity) > 0
    }

    /// Number of queued tasks of `activity`
    pub fn available_work(&self, activity: Activity) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.task.activity() == activity && e.task.status() == TaskStatus::Queued)
            .count()
    }

    /// Claim `task` for an immediate start, listing it if needed
    pub fn set_active(&self, task: &Arc<Task>) -> bool {
        let listed = self.add(task.clone());
        Arc::ptr_eq(&listed, task) && task.activate(true)
    }

    /// Dismiss a task from the list, cleaning up what it left on disk
    ///
    /// Refused while a worker may still be touching the task.
    pub fn remove(&self, task: &Task) -> bool {
        let status = task.status();
        if status == TaskStatus::Active || status.is_transient() {
            return false;
        }

        let removed = {
            let mut entries = self.entries.lock();
            let before = entries.len();
            entries.retain(|e| e.task.id() != task.id());
            entries.len() < before
        };
        if removed {
            debug!(task = %task.id(), "Task removed from list");
            task.removed_from_list();
        }
        removed
    }

    /// Detach a finished or cancelled task from its episode
    ///
    /// Paused and failed tasks keep their partial file and stay attached, so
    /// queueing the episode again resumes them instead of creating a second
    /// task writing to the same file.
    pub fn recycle(&self, task: &Task) {
        if !matches!(task.status(), TaskStatus::Done | TaskStatus::Cancelled) {
            return;
        }
        if let Some(entry) = self
            .entries
            .lock()
            .iter_mut()
            .find(|e| e.task.id() == task.id())
        {
            entry.attached = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SharedConfig;
    use crate::episode::Episode;
    use crate::progress::NoopReporter;
    use crate::testing::{MediaServer, fast_config, test_data};
    use crate::transfer::{ResumableTransfer, RetryPolicy, Transferer};
    use std::path::Path;
    use tempfile::tempdir;

    fn download(dir: &Path, name: &str) -> Arc<Task> {
        let server = Arc::new(MediaServer::new(test_data(100)));
        let transfer: Arc<dyn Transferer> =
            Arc::new(ResumableTransfer::new(server, RetryPolicy::from_retries(0)));
        Task::download(
            Episode::new(name, format!("https://example.com/{}.mp3", name)),
            dir,
            transfer,
            SharedConfig::new(fast_config()),
            NoopReporter::shared(),
        )
    }

    #[test]
    fn duplicate_episode_returns_existing_task() {
        let dir = tempdir().unwrap();
        let queue = TaskQueue::new();
        let first = queue.add(download(dir.path(), "a"));

        let again = queue.add(download(dir.path(), "a"));

        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn recycled_task_allows_a_new_one() {
        let dir = tempdir().unwrap();
        let queue = TaskQueue::new();
        let first = queue.add(download(dir.path(), "a"));
        first.force_status(TaskStatus::Done);
        queue.recycle(&first);

        let second = queue.add(download(dir.path(), "a"));

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn adding_the_same_task_twice_is_harmless() {
        let dir = tempdir().unwrap();
        let queue = TaskQueue::new();
        let task = download(dir.path(), "a");
        queue.add(task.clone());
        queue.recycle(&task);

        queue.add(task.clone());

        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn paused_and_failed_tasks_stay_attached() {
        let dir = tempdir().unwrap();
        let queue = TaskQueue::new();
        for status in [TaskStatus::Paused, TaskStatus::Failed, TaskStatus::Init] {
            let name = format!("{:?}", status);
            let first = queue.add(download(dir.path(), &name));
            first.force_status(status);
            queue.recycle(&first);

            let again = queue.add(download(dir.path(), &name));

            assert!(Arc::ptr_eq(&first, &again), "{:?} task was detached", status);
        }
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn cancelled_task_is_detached() {
        let dir = tempdir().unwrap();
        let queue = TaskQueue::new();
        let first = queue.add(download(dir.path(), "a"));
        first.cancel();
        queue.recycle(&first);

        let second = queue.add(download(dir.path(), "a"));

        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn get_next_claims_queued_tasks_in_order() {
        let dir = tempdir().unwrap();
        let queue = TaskQueue::new();
        let a = queue.add(download(dir.path(), "a"));
        let b = queue.add(download(dir.path(), "b"));
        let c = queue.add(download(dir.path(), "c"));
        c.queue();
        a.queue();

        assert_eq!(queue.available_work(Activity::Download), 2);
        assert_eq!(queue.get_next(Activity::Download).unwrap().id(), a.id());
        assert_eq!(a.status(), TaskStatus::Active);
        assert_eq!(queue.get_next(Activity::Download).unwrap().id(), c.id());
        assert!(queue.get_next(Activity::Download).is_none());
        assert_eq!(b.status(), TaskStatus::Init);
        assert!(!queue.has_work(Activity::Download));
    }

    #[test]
    fn activities_are_dispatched_separately() {
        let dir = tempdir().unwrap();
        let queue = TaskQueue::new();
        queue.add(download(dir.path(), "a")).queue();

        assert!(queue.has_work(Activity::Download));
        assert!(!queue.has_work(Activity::Synchronize));
        assert!(queue.get_next(Activity::Synchronize).is_none());
    }

    #[test]
    fn cancelled_queued_task_is_skipped() {
        let dir = tempdir().unwrap();
        let queue = TaskQueue::new();
        let a = queue.add(download(dir.path(), "a"));
        a.queue();
        a.cancel();

        assert!(queue.get_next(Activity::Download).is_none());
    }

    #[test]
    fn set_active_bypasses_queueing() {
        let dir = tempdir().unwrap();
        let queue = TaskQueue::new();
        let task = download(dir.path(), "a");

        assert!(queue.set_active(&task));

        assert_eq!(task.status(), TaskStatus::Active);
        assert_eq!(queue.len(), 1);
        assert!(!queue.set_active(&task));
    }

    #[test]
    fn remove_refuses_running_tasks() {
        let dir = tempdir().unwrap();
        let queue = TaskQueue::new();
        let task = queue.add(download(dir.path(), "a"));
        task.queue();
        queue.get_next(Activity::Download);

        assert!(!queue.remove(&task));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn remove_deletes_partial_of_unfinished_task() {
        let dir = tempdir().unwrap();
        let queue = TaskQueue::new();
        let task = queue.add(download(dir.path(), "a"));
        task.queue();
        task.pause();
        let partial = task.partial_path().unwrap();
        std::fs::write(&partial, b"partial").unwrap();

        assert!(queue.remove(&task));

        assert!(queue.is_empty());
        assert!(!partial.exists());
    }
}
