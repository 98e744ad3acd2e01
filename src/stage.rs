//! Per-stage worker pool
//!
//! A [`PipelineStage`] owns a bounded pool of worker threads pinned to one
//! device. Tasks are nullary closures executed in FIFO order; with the
//! default single worker all work for a stage is serialised on its device,
//! which keeps the recurrent-state ping-pong race-free and avoids
//! cross-stream synchronisation.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::warn;

use crate::error::{PipelineError, Result};
use crate::runtime::ModelRuntime;

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct StageQueue {
    tasks: VecDeque<Task>,
    active: usize,
    shutdown: bool,
}

struct StageShared {
    queue: Mutex<StageQueue>,
    work_available: Condvar,
    idle: Condvar,
}

/// Bounded worker pool bound to one device id
pub struct PipelineStage {
    device_id: i32,
    shared: Arc<StageShared>,
    workers: Vec<JoinHandle<()>>,
}

impl PipelineStage {
    /// Spawn `num_workers` threads serving this stage's queue
    ///
    /// Each worker binds its thread's current device to `device_id` before
    /// invoking a task, because a single worker thread may service many
    /// execution frames.
    ///
    /// # Errors
    /// Fails if a worker thread cannot be spawned.
    pub fn new(
        runtime: Arc<dyn ModelRuntime>,
        device_id: i32,
        num_workers: usize,
    ) -> Result<Self> {
        let shared = Arc::new(StageShared {
            queue: Mutex::new(StageQueue::default()),
            work_available: Condvar::new(),
            idle: Condvar::new(),
        });

        let mut workers: Vec<JoinHandle<()>> = Vec::with_capacity(num_workers);
        for worker_idx in 0..num_workers {
            let worker_shared = shared.clone();
            let runtime = runtime.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("stage-{device_id}-worker-{worker_idx}"))
                .spawn(move || worker_loop(&worker_shared, runtime.as_ref(), device_id));
            let handle = match spawned {
                Ok(handle) => handle,
                Err(e) => {
                    // release any workers already parked on the queue
                    lock(&shared.queue).shutdown = true;
                    shared.work_available.notify_all();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(PipelineError::RuntimeFailure {
                        reason: format!("failed to spawn worker for device {device_id}: {e}"),
                    });
                }
            };
            workers.push(handle);
        }

        Ok(PipelineStage {
            device_id,
            shared,
            workers,
        })
    }

    /// Device ordinal this stage is pinned to
    #[must_use]
    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    /// Enqueue a task; returns immediately, FIFO within the stage
    pub fn schedule_task(&self, task: Task) {
        let mut queue = lock(&self.shared.queue);
        if queue.shutdown {
            warn!(device = self.device_id, "task scheduled on a shut-down stage, dropping");
            return;
        }
        queue.tasks.push_back(task);
        drop(queue);
        self.shared.work_available.notify_one();
    }

    /// Block until the queue is empty and all in-flight tasks returned
    ///
    /// Idempotent; safe to call from the orchestrator at any time.
    pub fn drain_all_inflight_requests(&self) {
        let mut queue = lock(&self.shared.queue);
        while !queue.tasks.is_empty() || queue.active > 0 {
            queue = self
                .shared
                .idle
                .wait(queue)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }
}

impl Drop for PipelineStage {
    fn drop(&mut self) {
        {
            let mut queue = lock(&self.shared.queue);
            queue.shutdown = true;
        }
        self.shared.work_available.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn lock(queue: &Mutex<StageQueue>) -> std::sync::MutexGuard<'_, StageQueue> {
    queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn worker_loop(shared: &StageShared, runtime: &dyn ModelRuntime, device_id: i32) {
    loop {
        let task = {
            let mut queue = lock(&shared.queue);
            loop {
                if let Some(task) = queue.tasks.pop_front() {
                    queue.active += 1;
                    break task;
                }
                if queue.shutdown {
                    return;
                }
                queue = shared
                    .work_available
                    .wait(queue)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
            }
        };

        if let Err(e) = runtime.set_current_device(device_id) {
            warn!(device = device_id, error = %e, "failed to bind worker thread to device");
        }

        // a panicking task must not take the pool down; the orchestrator
        // times out on the missing response and aborts the batch
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task));
        if outcome.is_err() {
            warn!(device = device_id, "stage task panicked");
        }

        let mut queue = lock(&shared.queue);
        queue.active -= 1;
        if queue.tasks.is_empty() && queue.active == 0 {
            drop(queue);
            shared.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockRuntime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn stage(workers: usize) -> PipelineStage {
        PipelineStage::new(Arc::new(MockRuntime::new()), 0, workers).unwrap()
    }

    #[test]
    fn test_tasks_run_in_fifo_order() {
        let stage = stage(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..8 {
            let log = log.clone();
            stage.schedule_task(Box::new(move || {
                log.lock().unwrap().push(i);
            }));
        }
        stage.drain_all_inflight_requests();
        assert_eq!(*log.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_drain_waits_for_inflight() {
        let stage = stage(1);
        let done = Arc::new(AtomicUsize::new(0));
        let done2 = done.clone();
        stage.schedule_task(Box::new(move || {
            std::thread::sleep(Duration::from_millis(50));
            done2.fetch_add(1, Ordering::SeqCst);
        }));
        stage.drain_all_inflight_requests();
        assert_eq!(done.load(Ordering::SeqCst), 1);
        // idempotent
        stage.drain_all_inflight_requests();
    }

    #[test]
    fn test_panicking_task_does_not_kill_the_pool() {
        let stage = stage(1);
        stage.schedule_task(Box::new(|| panic!("boom")));
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        stage.schedule_task(Box::new(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        }));
        stage.drain_all_inflight_requests();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_worker_binds_device_before_each_task() {
        let runtime = Arc::new(MockRuntime::new());
        let stage = PipelineStage::new(runtime.clone(), 3, 1).unwrap();
        stage.schedule_task(Box::new(|| {}));
        stage.schedule_task(Box::new(|| {}));
        stage.drain_all_inflight_requests();
        assert_eq!(runtime.device_log(), vec![3, 3]);
    }

    #[test]
    fn test_drop_joins_workers() {
        let stage = stage(2);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let count = count.clone();
            stage.schedule_task(Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }
        stage.drain_all_inflight_requests();
        drop(stage);
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }
}
