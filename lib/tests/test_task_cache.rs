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

//! Task-cache behavior over the real worker pool and a backend-backed
//! persister, as the catalog layer wires it up.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use icevault_lib::backend::Bucket;
use icevault_lib::catalog::snapshot::SnapshotId;
use icevault_lib::clock::Clock;
use icevault_lib::clock::FakeClock;
use icevault_lib::clock::SystemClock;
use icevault_lib::memory_backend::MemoryBackend;
use icevault_lib::object_id::ObjectId as _;
use icevault_lib::store::Store;
use icevault_lib::task_cache::TaskCache;
use icevault_lib::task_cache::TaskCacheConfig;
use icevault_lib::task_cache::TaskError;
use icevault_lib::task_cache::TaskPersister;
use icevault_lib::task_cache::block_on_with_deadline;
use pollster::FutureExt as _;

fn task_key(byte: u8) -> SnapshotId {
    SnapshotId::new(vec![byte; 32])
}

fn new_cache(clock: Arc<dyn Clock>) -> Arc<TaskCache<String>> {
    TaskCache::new(clock, TaskCacheConfig::default(), None)
}

// Persists task results into the `Attachments` bucket the way the catalog
// layer persists derived snapshots.
#[derive(Debug)]
struct BackendPersister {
    store: Arc<Store>,
    loads: AtomicUsize,
}

impl BackendPersister {
    fn new(store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self {
            store,
            loads: AtomicUsize::new(0),
        })
    }
}

impl TaskPersister<String> for BackendPersister {
    fn load(&self, key: &SnapshotId) -> Option<String> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let bytes = self
            .store
            .backend()
            .get(Bucket::Attachments, key.as_bytes())
            .block_on()
            .ok()?;
        String::from_utf8(bytes).ok()
    }

    fn store(&self, key: &SnapshotId, value: &String) {
        drop(
            self.store
                .backend()
                .put(Bucket::Attachments, key.as_bytes(), value.as_bytes())
                .block_on(),
        );
    }
}

#[test]
fn test_observers_share_one_computation() {
    let cache = new_cache(Arc::new(SystemClock::new()));
    let calls = Arc::new(AtomicUsize::new(0));

    // Hold the first task open on a worker thread until a second observer
    // has attached to the same key.
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
    let calls_in_task = calls.clone();
    let first = cache
        .get_or_start(&task_key(1), move || {
            release_rx.recv().unwrap();
            calls_in_task.fetch_add(1, Ordering::SeqCst);
            Ok("materialized".to_string())
        })
        .unwrap();
    let second = cache
        .get_or_start(&task_key(1), || panic!("a second compute must not start"))
        .unwrap();
    release_tx.send(()).unwrap();

    let first = first.block_on().unwrap();
    let second = second.block_on().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(*first, "materialized");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_worker_queue_overflow_surfaces_busy() {
    let cache: Arc<TaskCache<String>> = TaskCache::new(
        Arc::new(SystemClock::new()),
        TaskCacheConfig {
            workers: 1,
            queue_capacity: 1,
            ..TaskCacheConfig::default()
        },
        None,
    );

    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
    let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);
    let blocked = cache
        .get_or_start(&task_key(2), move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            Ok("a".to_string())
        })
        .unwrap();
    // Once the single worker is inside the first task, the next submission
    // takes the only queue slot and the one after that must be rejected.
    started_rx.recv().unwrap();
    let queued = cache
        .get_or_start(&task_key(3), || Ok("b".to_string()))
        .unwrap();
    let overflow = cache.get_or_start(&task_key(4), || Ok("c".to_string()));
    assert_eq!(overflow.unwrap_err(), TaskError::Busy);

    // Busy is transient: after the pool drains, the rejected key runs.
    release_tx.send(()).unwrap();
    assert_eq!(*blocked.block_on().unwrap(), "a");
    assert_eq!(*queued.block_on().unwrap(), "b");
    let retried = cache
        .get_or_start(&task_key(4), || Ok("c".to_string()))
        .unwrap()
        .block_on()
        .unwrap();
    assert_eq!(*retried, "c");
}

#[test]
fn test_results_read_through_backend_across_instances() {
    let store = Store::new(Box::new(MemoryBackend::new()));
    let persister = BackendPersister::new(store.clone());

    let first_cache: Arc<TaskCache<String>> = TaskCache::new(
        Arc::new(SystemClock::new()),
        TaskCacheConfig::default(),
        Some(persister.clone()),
    );
    let value = first_cache
        .get_or_start(&task_key(5), || Ok("computed once".to_string()))
        .unwrap()
        .block_on()
        .unwrap();
    assert_eq!(*value, "computed once");
    // The result landed in the backend.
    assert!(
        store
            .backend()
            .get(Bucket::Attachments, task_key(5).as_bytes())
            .block_on()
            .is_ok()
    );

    // A second process (fresh cache, fresh worker pool, same backend) never
    // recomputes.
    let second_persister = BackendPersister::new(store.clone());
    let second_cache: Arc<TaskCache<String>> = TaskCache::new(
        Arc::new(SystemClock::new()),
        TaskCacheConfig::default(),
        Some(second_persister.clone()),
    );
    let value = second_cache
        .get_or_start(&task_key(5), || panic!("must load from the backend"))
        .unwrap()
        .block_on()
        .unwrap();
    assert_eq!(*value, "computed once");
    assert_eq!(second_persister.loads.load(Ordering::SeqCst), 1);
}

#[test]
fn test_deadline_leaves_computation_running() {
    let store = Store::new(Box::new(MemoryBackend::new()));
    let persister = BackendPersister::new(store.clone());
    let cache: Arc<TaskCache<String>> = TaskCache::new(
        Arc::new(SystemClock::new()),
        TaskCacheConfig::default(),
        Some(persister),
    );

    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
    let future = cache
        .get_or_start(&task_key(6), move || {
            release_rx.recv().unwrap();
            Ok("late".to_string())
        })
        .unwrap();

    // The caller's deadline elapses while the task keeps running.
    assert_eq!(
        block_on_with_deadline(future.clone(), Duration::from_millis(20)),
        None
    );
    // Even dropping every observer does not cancel the computation.
    drop(future);
    release_tx.send(()).unwrap();

    let value = cache
        .get_or_start(&task_key(6), || panic!("must reuse the finished task"))
        .unwrap()
        .block_on()
        .unwrap();
    assert_eq!(*value, "late");
    // The abandoned task still persisted its result.
    assert!(
        store
            .backend()
            .get(Bucket::Attachments, task_key(6).as_bytes())
            .block_on()
            .is_ok()
    );
}

#[test]
fn test_failure_blocks_retry_until_backoff_elapses() {
    let clock = Arc::new(FakeClock::new(0));
    let cache = new_cache(clock.clone());

    let result = cache
        .get_or_start(&task_key(7), || Err::<String, _>("read failed".to_string()))
        .unwrap()
        .block_on();
    assert_eq!(result, Err(TaskError::Failed("read failed".to_string())));

    // Inside the backoff window the cached failure is replayed.
    let result = cache
        .get_or_start(&task_key(7), || panic!("must not recompute yet"))
        .unwrap()
        .block_on();
    assert_eq!(result, Err(TaskError::Failed("read failed".to_string())));

    clock.advance(Duration::from_secs(30));
    let value = cache
        .get_or_start(&task_key(7), || Ok("recovered".to_string()))
        .unwrap()
        .block_on()
        .unwrap();
    assert_eq!(*value, "recovered");
}
