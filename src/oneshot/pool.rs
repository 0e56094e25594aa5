//! Worker-pool provider of the one-shot contract.
//!
//! A fixed set of OS worker threads drains a due-time min-heap. Pending
//! registrations live in a task table keyed by handle id; cancellation is
//! lazy (a cancelled entry stays in the heap and is discarded when it
//! surfaces), and releasing a handle is bookkeeping only and never
//! deschedules anything.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::num::{NonZeroU64, NonZeroUsize};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use minstant::Instant;

use crate::oneshot::{OneShot, TaskHandle, WorkItem};
use crate::trace::{debug, info, trace};

/// Pool configuration (immutable after spawn).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads dispatching due registrations.
    pub workers: NonZeroUsize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: const { NonZeroUsize::new(4).unwrap() },
        }
    }
}

/// One registration waiting in the due-time heap.
struct Pending {
    due: Instant,
    id: u64,
    work: WorkItem,
}

// Ordered by (due, id); the work closure does not participate.
impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.id == other.id
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.due.cmp(&other.due).then(self.id.cmp(&other.id))
    }
}

/// Dispatch state of one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Pending,
    Running,
    Done,
    Cancelled,
}

/// Task-table entry for one handle.
struct TaskEntry {
    state: RunState,
    /// Set when the handle was released while the registration was still
    /// pending or running; the entry is reaped once the registration
    /// resolves.
    released: bool,
}

struct PoolState {
    heap: BinaryHeap<Reverse<Pending>>,
    tasks: HashMap<u64, TaskEntry>,
    next_id: u64,
    shutdown: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    wakeup: Condvar,
}

/// A pool of worker threads providing the [`OneShot`] contract.
///
/// The pool owns the threads; scheduling goes through the cheap, cloneable
/// [`PoolScheduler`] front end obtained from [`WorkerPool::scheduler`].
/// Dropping the pool signals shutdown without joining; use
/// [`WorkerPool::shutdown`] for a graceful exit.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns the worker threads.
    ///
    /// # Panics
    ///
    /// Panics if thread spawning fails.
    #[must_use]
    pub fn spawn(config: PoolConfig) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                heap: BinaryHeap::new(),
                tasks: HashMap::new(),
                next_id: 0,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });

        let workers = (0..config.workers.get())
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("rearm-worker-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        info!(workers = config.workers.get(), "worker pool started");
        Self { shared, workers }
    }

    /// Returns a scheduling front end for this pool.
    #[must_use]
    pub fn scheduler(&self) -> PoolScheduler {
        PoolScheduler {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Initiates shutdown and waits for all workers to exit.
    ///
    /// A registration whose work is mid-run finishes; everything still
    /// queued is dropped without running.
    pub fn shutdown(mut self) {
        debug!("pool shutdown initiated");
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
        }
        self.shared.wakeup.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        // Drop queued work so closures holding a scheduler front end do not
        // keep the shared state alive.
        let mut state = self.shared.state.lock().unwrap();
        state.heap.clear();
        state.tasks.clear();
        debug!("pool shutdown complete");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Signal shutdown if not already done; workers are only joined by
        // an explicit `shutdown` call.
        if let Ok(mut state) = self.shared.state.lock() {
            state.shutdown = true;
        }
        self.shared.wakeup.notify_all();
    }
}

/// Cloneable scheduling front end for a [`WorkerPool`].
#[derive(Clone)]
pub struct PoolScheduler {
    shared: Arc<Shared>,
}

impl OneShot for PoolScheduler {
    fn schedule(&self, due: Instant, work: WorkItem) -> TaskHandle {
        let mut state = self.shared.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.tasks.insert(
            id,
            TaskEntry {
                state: RunState::Pending,
                released: false,
            },
        );
        state.heap.push(Reverse(Pending { due, id, work }));
        drop(state);
        self.shared.wakeup.notify_one();
        debug!(id, "one-shot registered");
        TaskHandle::new(NonZeroU64::new(id).expect("ids start at one"))
    }

    fn cancel_scheduled(&self, handle: &TaskHandle) -> bool {
        let id = handle.id().get();
        let mut state = self.shared.state.lock().unwrap();
        match state.tasks.get_mut(&id) {
            Some(entry) if entry.state == RunState::Pending => {
                // Lazy cancellation: the heap node is discarded when it
                // surfaces.
                entry.state = RunState::Cancelled;
                debug!(id, "pending one-shot cancelled");
                true
            }
            _ => false,
        }
    }

    fn release_handle(&self, handle: TaskHandle) {
        let id = handle.id().get();
        let mut state = self.shared.state.lock().unwrap();
        let in_flight = state
            .tasks
            .get(&id)
            .is_some_and(|e| matches!(e.state, RunState::Pending | RunState::Running));
        if in_flight {
            // Mark for reaping once the registration resolves. Releasing
            // must not deschedule it.
            if let Some(entry) = state.tasks.get_mut(&id) {
                entry.released = true;
            }
        } else {
            state.tasks.remove(&id);
        }
    }
}

fn worker_loop(shared: &Shared) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if state.shutdown {
            return;
        }

        let now = Instant::now();
        let head_due = state.heap.peek().map(|entry| entry.0.due);
        let Some(head_due) = head_due else {
            state = shared.wakeup.wait(state).unwrap();
            continue;
        };
        if head_due > now {
            let wait = head_due.duration_since(now);
            let (guard, _) = shared.wakeup.wait_timeout(state, wait).unwrap();
            state = guard;
            continue;
        }

        let Some(Reverse(pending)) = state.heap.pop() else {
            continue;
        };
        match state.tasks.get_mut(&pending.id) {
            Some(entry) if entry.state == RunState::Pending => {
                entry.state = RunState::Running;
            }
            _ => {
                // Cancelled (or cancelled and already released) while queued.
                trace!(id = pending.id, "discarding cancelled one-shot");
                continue;
            }
        }
        drop(state);

        trace!(id = pending.id, "dispatching one-shot");
        (pending.work)();

        state = shared.state.lock().unwrap();
        let reap = match state.tasks.get_mut(&pending.id) {
            Some(entry) if entry.released => true,
            Some(entry) => {
                entry.state = RunState::Done;
                false
            }
            None => false,
        };
        if reap {
            state.tasks.remove(&pending.id);
        }
    }
}
