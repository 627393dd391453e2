// Copyright 2024-2025 The Icevault Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![expect(missing_docs)]

//! Deduplicated background materialization of derived snapshots.
//!
//! Parsing a metadata file is expensive, so concurrent requests for the
//! same derived-snapshot id must share one computation. The cache keeps a
//! shared future per key: the first caller starts the work on the worker
//! pool, every concurrent caller awaits the same future, and observers
//! dropping out never cancels the computation. Completed values are
//! retained for a TTL and persisted best-effort so other processes skip
//! the work entirely.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use futures::FutureExt as _;
use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::future::Shared;
use thiserror::Error;

use crate::catalog::snapshot::SnapshotId;
use crate::clock::Clock;

/// Failure of a materialization task. Cloneable so every observer of the
/// shared future sees the same error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task failed: {0}")]
    Failed(String),
    #[error("Task worker disappeared before completing")]
    Abandoned,
    #[error("Task worker queue is full")]
    Busy,
}

/// The shared handle every observer of one task awaits.
pub type TaskFuture<V> = Shared<BoxFuture<'static, Result<Arc<V>, TaskError>>>;

/// Cross-process persistence hooks. Both sides are best-effort: a failed
/// load falls back to computing, a failed store only loses the cache win.
pub trait TaskPersister<V>: Send + Sync + Debug {
    fn load(&self, key: &SnapshotId) -> Option<V>;
    fn store(&self, key: &SnapshotId, value: &V);
}

#[derive(Debug, Clone)]
pub struct TaskCacheConfig {
    pub workers: usize,
    /// Bounded submission queue; overflow fails `Busy`.
    pub queue_capacity: usize,
    /// How long successful results are served from memory.
    pub success_ttl: Duration,
    /// How long a failure blocks re-computation.
    pub failure_retry_after: Duration,
}

impl Default for TaskCacheConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
            success_ttl: Duration::from_secs(300),
            failure_retry_after: Duration::from_secs(5),
        }
    }
}

enum TaskState<V> {
    Running(TaskFuture<V>),
    Done {
        result: Result<Arc<V>, TaskError>,
        at: Duration,
    },
}

/// Deduplicating cache of background tasks keyed by derived-snapshot id.
pub struct TaskCache<V> {
    entries: Mutex<HashMap<SnapshotId, TaskState<V>>>,
    pool: WorkerPool,
    clock: Arc<dyn Clock>,
    config: TaskCacheConfig,
    persister: Option<Arc<dyn TaskPersister<V>>>,
}

impl<V> Debug for TaskCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<V: Send + Sync + 'static> TaskCache<V> {
    pub fn new(
        clock: Arc<dyn Clock>,
        config: TaskCacheConfig,
        persister: Option<Arc<dyn TaskPersister<V>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            pool: WorkerPool::new(config.workers.max(1), config.queue_capacity.max(1)),
            clock,
            config,
            persister,
        })
    }

    /// Returns the shared future for `key`, starting `compute` on the
    /// worker pool if no task is running and no fresh result is cached.
    /// Fails `Busy` when the worker queue is full.
    ///
    /// At most one `compute` per key is in flight at a time; all concurrent
    /// callers receive the same future.
    pub fn get_or_start(
        self: &Arc<Self>,
        key: &SnapshotId,
        compute: impl FnOnce() -> Result<V, String> + Send + 'static,
    ) -> Result<TaskFuture<V>, TaskError> {
        let now = self.clock.monotonic();
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(TaskState::Running(future)) => return Ok(future.clone()),
            Some(TaskState::Done { result, at }) => {
                let ttl = match result {
                    Ok(_) => self.config.success_ttl,
                    Err(_) => self.config.failure_retry_after,
                };
                if now.saturating_sub(*at) < ttl {
                    return Ok(futures::future::ready(result.clone()).boxed().shared());
                }
                // Stale entry, recompute below.
            }
            None => {}
        }

        let (sender, receiver) = oneshot::channel();
        let future: TaskFuture<V> = receiver
            .map(|received| match received {
                Ok(result) => result,
                Err(oneshot::Canceled) => Err(TaskError::Abandoned),
            })
            .boxed()
            .shared();
        entries.insert(key.clone(), TaskState::Running(future.clone()));
        drop(entries);

        let cache = self.clone();
        let task_key = key.clone();
        let submitted = self.pool.try_execute(Box::new(move || {
            cache.run_task(&task_key, compute, sender);
        }));
        if submitted.is_err() {
            self.entries.lock().unwrap().remove(key);
            return Err(TaskError::Busy);
        }
        Ok(future)
    }

    fn run_task(
        &self,
        key: &SnapshotId,
        compute: impl FnOnce() -> Result<V, String>,
        sender: oneshot::Sender<Result<Arc<V>, TaskError>>,
    ) {
        let persisted = self
            .persister
            .as_ref()
            .and_then(|persister| persister.load(key));
        let (result, from_cache) = match persisted {
            Some(value) => (Ok(Arc::new(value)), true),
            None => (
                compute().map(Arc::new).map_err(TaskError::Failed),
                false,
            ),
        };
        if !from_cache {
            if let (Some(persister), Ok(value)) = (&self.persister, &result) {
                persister.store(key, value);
            }
        }
        {
            let mut entries = self.entries.lock().unwrap();
            entries.insert(
                key.clone(),
                TaskState::Done {
                    result: result.clone(),
                    at: self.clock.monotonic(),
                },
            );
        }
        // All observers may have detached; the result is still cached.
        drop(sender.send(result));
    }
}

/// Blocks on `future` up to `timeout`. The underlying task keeps running
/// when the deadline fires; only this observer gives up.
pub fn block_on_with_deadline<V>(
    future: TaskFuture<V>,
    timeout: Duration,
) -> Option<Result<Arc<V>, TaskError>> {
    let (sender, receiver) = oneshot::channel::<()>();
    let timer = thread::spawn(move || {
        thread::sleep(timeout);
        let _ = sender.send(());
    });
    let result = futures::executor::block_on(async move {
        futures::select! {
            result = future.fuse() => Some(result),
            _ = receiver.fuse() => None,
        }
    });
    drop(timer);
    result
}

type Job = Box<dyn FnOnce() + Send>;

// Fixed-size pool of OS worker threads fed by a bounded queue.
struct WorkerPool {
    sender: Option<crossbeam_channel::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

struct QueueFull;

impl WorkerPool {
    fn new(workers: usize, queue_capacity: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded::<Job>(queue_capacity);
        let workers = (0..workers)
            .map(|index| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("snapshot-worker-{index}"))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            job();
                        }
                    })
                    .unwrap()
            })
            .collect();
        Self {
            sender: Some(sender),
            workers,
        }
    }

    fn try_execute(&self, job: Job) -> Result<(), QueueFull> {
        self.sender
            .as_ref()
            .expect("pool is alive while the cache exists")
            .try_send(job)
            .map_err(|_| QueueFull)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel lets the workers drain and exit.
        self.sender = None;
        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            // The last cache handle can be dropped from inside a job; that
            // worker exits on its own once the job returns.
            if worker.thread().id() == current {
                continue;
            }
            drop(worker.join());
        }
    }
}
