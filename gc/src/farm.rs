//! Bounded worker pool shared by the mark, compact and update engines.
//!
//! The pool is created once at startup with a fixed thread count and a
//! bounded queue; no workers are added mid-collection. Engines queue work
//! for each heap space with [`GcTaskFarm::execute`] and rendezvous on
//! [`GcTaskFarm::wait_for_completion`] before their phase ends.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

/// Queue depth used when the caller has no opinion.
pub const DEFAULT_QUEUE_DEPTH: usize = 100;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct FarmState {
    queue: VecDeque<Task>,
    active: usize,
    stopping: bool,
}

struct FarmShared {
    state: Mutex<FarmState>,
    work_available: Condvar,
    space_available: Condvar,
    idle: Condvar,
    queue_depth: usize,
}

pub struct GcTaskFarm {
    shared: Arc<FarmShared>,
    workers: Vec<JoinHandle<()>>,
}

impl GcTaskFarm {
    /// Spawn `threads` workers over a queue of at most `queue_depth`
    /// outstanding tasks. Returns `None` if the OS refuses a thread.
    pub fn initialise(threads: usize, queue_depth: usize) -> Option<Self> {
        assert!(threads > 0, "a task farm needs at least one worker");
        assert!(queue_depth > 0, "a task farm needs a queue");

        let shared = Arc::new(FarmShared {
            state: Mutex::new(FarmState {
                queue: VecDeque::new(),
                active: 0,
                stopping: false,
            }),
            work_available: Condvar::new(),
            space_available: Condvar::new(),
            idle: Condvar::new(),
            queue_depth,
        });

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let worker_shared = Arc::clone(&shared);
            let builder =
                thread::Builder::new().name(format!("gc-worker-{index}"));
            match builder.spawn(move || worker_loop(&worker_shared)) {
                Ok(handle) => workers.push(handle),
                Err(_) => {
                    // Dropping joins the workers spawned so far.
                    drop(Self { shared, workers });
                    return None;
                }
            }
        }

        Some(Self { shared, workers })
    }

    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue a task, blocking while the queue is at capacity.
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        while state.queue.len() >= self.shared.queue_depth {
            self.shared.space_available.wait(&mut state);
        }
        state.queue.push_back(Box::new(task));
        drop(state);
        self.shared.work_available.notify_one();
    }

    /// Block until every queued task has started and finished.
    pub fn wait_for_completion(&self) {
        let mut state = self.shared.state.lock();
        while !state.queue.is_empty() || state.active > 0 {
            self.shared.idle.wait(&mut state);
        }
    }
}

impl std::fmt::Debug for GcTaskFarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcTaskFarm")
            .field("threads", &self.workers.len())
            .field("queue_depth", &self.shared.queue_depth)
            .finish()
    }
}

fn worker_loop(shared: &FarmShared) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if let Some(task) = state.queue.pop_front() {
                    state.active += 1;
                    break task;
                }
                if state.stopping {
                    return;
                }
                shared.work_available.wait(&mut state);
            }
        };
        shared.space_available.notify_one();

        task();

        let mut state = shared.state.lock();
        state.active -= 1;
        let drained = state.queue.is_empty() && state.active == 0;
        drop(state);
        if drained {
            shared.idle.notify_all();
        }
    }
}

impl Drop for GcTaskFarm {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.stopping = true;
        }
        self.shared.work_available.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// One-time worker-pool setup. The pool is a startup precondition for the
/// collection engines, so failure here ends the process.
#[must_use]
pub fn initialise_gc_workers(threads: usize) -> Arc<GcTaskFarm> {
    let farm = GcTaskFarm::initialise(threads, DEFAULT_QUEUE_DEPTH)
        .expect("unable to initialise the GC task farm");
    Arc::new(farm)
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn runs_every_queued_task() {
        let farm = GcTaskFarm::initialise(4, 16).expect("create farm");
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            farm.execute(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        farm.wait_for_completion();

        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn completion_wait_covers_slow_tasks() {
        let farm = GcTaskFarm::initialise(2, 4).expect("create farm");
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            farm.execute(move || {
                thread::sleep(Duration::from_millis(10));
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        farm.wait_for_completion();

        assert_eq!(
            counter.load(Ordering::Relaxed),
            8,
            "wait_for_completion returned before all tasks finished"
        );
    }

    #[test]
    fn bounded_queue_backpressure_still_completes() {
        // More tasks than the queue holds: execute must block rather than
        // drop work.
        let farm = GcTaskFarm::initialise(1, 2).expect("create farm");
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            farm.execute(move || {
                thread::sleep(Duration::from_millis(1));
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        farm.wait_for_completion();

        assert_eq!(counter.load(Ordering::Relaxed), 20);
    }

    #[test]
    fn farm_is_reusable_across_phases() {
        let farm = GcTaskFarm::initialise(2, 8).expect("create farm");
        let counter = Arc::new(AtomicUsize::new(0));

        for _phase in 0..3 {
            for _ in 0..5 {
                let counter = Arc::clone(&counter);
                farm.execute(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                });
            }
            farm.wait_for_completion();
        }

        assert_eq!(counter.load(Ordering::Relaxed), 15);
    }

    #[test]
    fn drop_joins_workers() {
        let farm = GcTaskFarm::initialise(3, 8).expect("create farm");
        assert_eq!(farm.thread_count(), 3);
        drop(farm);
    }
}
