// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Worker pool driving the task queue
//!
//! Each [`Activity`] has its own set of worker threads, bounded by the live
//! value of [`SharedConfig::max_workers`]. Workers pull queued tasks until
//! none are left and then exit; the pool is topped up whenever tasks are
//! queued or the limit changes. Adding and removing workers and comparing
//! their number with the limit always happen under one lock.

use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use crate::config::SharedConfig;
use crate::queue::TaskQueue;
use crate::task::{Activity, Task};

type WorkerId = u64;

#[derive(Default)]
struct Pool {
    workers: HashMap<Activity, HashSet<WorkerId>>,
    /// Force-started tasks still running outside the pool
    forced: usize,
    next_worker: WorkerId,
}

impl Pool {
    fn count(&self, activity: Activity) -> usize {
        self.workers.get(&activity).map_or(0, HashSet::len)
    }

    fn is_idle(&self) -> bool {
        self.forced == 0 && self.workers.values().all(HashSet::is_empty)
    }
}

struct Inner {
    config: SharedConfig,
    queue: Arc<TaskQueue>,
    pool: Mutex<Pool>,
    /// Signalled whenever a worker or forced run ends
    idle: Condvar,
}

/// Owner of the worker threads of every activity
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
}

impl QueueManager {
    pub fn new(config: SharedConfig, queue: Arc<TaskQueue>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                queue,
                pool: Mutex::new(Pool::default()),
                idle: Condvar::new(),
            }),
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.inner.queue
    }

    /// List and queue a task, then start workers if there is room
    ///
    /// Returns the task that was queued, which is the already listed one
    /// when the episode has a task for this activity.
    pub fn queue_task(&self, task: Arc<Task>) -> Arc<Task> {
        let task = self.inner.queue.add(task);
        task.queue();
        self.spawn_workers(task.activity());
        task
    }

    /// Queue a batch, oldest episode first when chronological order is on
    pub fn queue_tasks(&self, mut tasks: Vec<Arc<Task>>) -> Vec<Arc<Task>> {
        if self.inner.config.snapshot().chronological_order {
            tasks.sort_by_key(|task| task.episode().pub_date);
        }

        let queued: Vec<Arc<Task>> = tasks
            .into_iter()
            .map(|task| {
                let task = self.inner.queue.add(task);
                task.queue();
                task
            })
            .collect();

        for activity in Activity::ALL {
            if queued.iter().any(|task| task.activity() == activity) {
                self.spawn_workers(activity);
            }
        }
        queued
    }

    /// Run a task right away on its own thread, outside the pool limit
    pub fn force_start_task(&self, task: Arc<Task>) -> bool {
        if !self.inner.queue.set_active(&task) {
            return false;
        }

        self.inner.pool.lock().forced += 1;
        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name(format!("forced-{}", task.id()))
            .spawn({
                let task = task.clone();
                move || {
                    info!(task = %task.id(), title = %task.title(), "Force-starting task");
                    run_guarded(&task);
                    inner.queue.recycle(&task);
                    inner.pool.lock().forced -= 1;
                    inner.idle.notify_all();
                }
            });

        if let Err(e) = spawned {
            error!(task = %task.id(), "Could not start thread: {}", e);
            self.inner.pool.lock().forced -= 1;
            task.fail_after_panic(format!("could not start thread: {}", e));
            self.inner.idle.notify_all();
            return false;
        }
        true
    }

    /// Re-read the configured limits and start workers where there is room
    pub fn update_max_concurrency(&self) {
        for activity in Activity::ALL {
            self.spawn_workers(activity);
        }
    }

    /// Live pool workers of an activity, not counting force-started runs
    pub fn worker_count(&self, activity: Activity) -> usize {
        self.inner.pool.lock().count(activity)
    }

    /// Block until no worker and no force-started task is running
    ///
    /// Returns false if `timeout` elapsed first.
    pub fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut pool = self.inner.pool.lock();
        while !pool.is_idle() {
            match deadline {
                Some(deadline) => {
                    if self.inner.idle.wait_until(&mut pool, deadline).timed_out() {
                        return pool.is_idle();
                    }
                }
                None => self.inner.idle.wait(&mut pool),
            }
        }
        true
    }

    fn spawn_workers(&self, activity: Activity) {
        let mut pool = self.inner.pool.lock();
        let limit = self.inner.config.max_workers(activity);
        let current = pool.count(activity);
        let deficit = self
            .inner
            .queue
            .available_work(activity)
            .min(limit.saturating_sub(current));

        for _ in 0..deficit {
            pool.next_worker += 1;
            let id = pool.next_worker;
            pool.workers.entry(activity).or_default().insert(id);

            let inner = self.inner.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-worker-{}", activity, id))
                .spawn(move || worker_loop(inner, activity, id));

            if let Err(e) = spawned {
                error!(%activity, "Could not start worker thread: {}", e);
                if let Some(set) = pool.workers.get_mut(&activity) {
                    set.remove(&id);
                }
                break;
            }
            info!(worker = id, %activity, "Started worker");
        }
    }
}

fn worker_loop(inner: Arc<Inner>, activity: Activity, id: WorkerId) {
    loop {
        let task = {
            let mut pool = inner.pool.lock();
            let limit = inner.config.max_workers(activity);
            let workers = pool.workers.entry(activity).or_default();

            if !workers.contains(&id) {
                break;
            }
            if workers.len() > limit {
                workers.remove(&id);
                info!(worker = id, %activity, limit, "Worker retiring, limit lowered");
                break;
            }
            match inner.queue.get_next(activity) {
                Some(task) => task,
                None => {
                    workers.remove(&id);
                    debug!(worker = id, %activity, "No more tasks, worker exiting");
                    break;
                }
            }
        };

        debug!(worker = id, task = %task.id(), title = %task.title(), "Processing task");
        run_guarded(&task);
        inner.queue.recycle(&task);
    }
    inner.idle.notify_all();
}

/// Run a task, turning a panic inside it into a failed task
fn run_guarded(task: &Task) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
        let message = if let Some(s) = panic.downcast_ref::<String>() {
            s.clone()
        } else if let Some(s) = panic.downcast_ref::<&str>() {
            s.to_string()
        } else {
            "unknown panic".to_string()
        };
        error!(task = %task.id(), "Task panicked: {}", message);
        task.fail_after_panic(message);
    }
}
