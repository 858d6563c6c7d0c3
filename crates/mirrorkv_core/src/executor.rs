//! Task scheduling: the shared worker pool and the two coalescing
//! executors built on top of it.
//!
//! The pool runs everything asynchronous in the engine: the background
//! loader, deferred commits, sidecar writes and deletions. The two
//! single-slot executors put ordering policies in front of it:
//!
//! - [`LimitExecutor`] keeps at most one task running and one waiting,
//!   dropping anything submitted while the waiting slot is full. Used by
//!   async-blocking commits, where the queued task always writes the
//!   latest buffer anyway.
//! - [`TagExecutor`] serializes tasks per tag (the engine tags by KV
//!   key), with the waiting slot per tag replaced by newer submissions.
//!   Used for sidecar writes and deletions so per-key last-write-wins
//!   ordering holds without global serialization.

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Default number of pool workers.
pub const DEFAULT_WORKERS: usize = 4;
/// Default idle timeout after which a pool worker exits.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared worker pool with an unbounded queue.
///
/// Workers are spawned on demand up to the configured cap and exit after
/// sitting idle past the timeout, so an idle process holds no threads.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    queue: Mutex<PoolQueue>,
    available: Condvar,
    max_workers: usize,
    idle_timeout: Duration,
}

struct PoolQueue {
    jobs: VecDeque<Job>,
    workers: usize,
    idle: usize,
}

impl ThreadPool {
    /// Creates a pool with the given worker cap and idle timeout.
    #[must_use]
    pub fn new(max_workers: usize, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                queue: Mutex::new(PoolQueue {
                    jobs: VecDeque::new(),
                    workers: 0,
                    idle: 0,
                }),
                available: Condvar::new(),
                max_workers: max_workers.max(1),
                idle_timeout,
            }),
        }
    }

    /// Submits a task for execution.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        let mut queue = self.inner.queue.lock();
        queue.jobs.push_back(Box::new(job));
        if queue.idle > 0 {
            self.inner.available.notify_one();
        } else if queue.workers < self.inner.max_workers {
            queue.workers += 1;
            let inner = Arc::clone(&self.inner);
            let spawned = thread::Builder::new()
                .name("mirrorkv-worker".into())
                .spawn(move || worker_loop(&inner));
            if let Err(e) = spawned {
                queue.workers -= 1;
                tracing::error!("failed to spawn pool worker: {e}");
            }
        }
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS, DEFAULT_IDLE_TIMEOUT)
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        let job = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                queue.idle += 1;
                let result = inner.available.wait_for(&mut queue, inner.idle_timeout);
                queue.idle -= 1;
                if result.timed_out() && queue.jobs.is_empty() {
                    queue.workers -= 1;
                    return;
                }
            }
        };
        job();
    }
}

/// Single-slot executor: one active task, one waiting, extras dropped.
pub struct LimitExecutor {
    pool: ThreadPool,
    state: Arc<Mutex<LimitState>>,
}

#[derive(Default)]
struct LimitState {
    active: bool,
    waiting: Option<Job>,
}

impl LimitExecutor {
    /// Creates an executor delegating to `pool`.
    #[must_use]
    pub fn new(pool: ThreadPool) -> Self {
        Self {
            pool,
            state: Arc::new(Mutex::new(LimitState::default())),
        }
    }

    /// Submits a task. If one is already running and another is already
    /// waiting, the submission is dropped.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        let mut state = self.state.lock();
        if !state.active {
            state.active = true;
            drop(state);
            run_limit(self.pool.clone(), Arc::clone(&self.state), Box::new(job));
        } else if state.waiting.is_none() {
            state.waiting = Some(Box::new(job));
        }
    }
}

fn run_limit(pool: ThreadPool, state: Arc<Mutex<LimitState>>, job: Job) {
    let next_pool = pool.clone();
    pool.execute(move || {
        job();
        let next = {
            let mut s = state.lock();
            match s.waiting.take() {
                Some(job) => Some(job),
                None => {
                    s.active = false;
                    None
                }
            }
        };
        if let Some(job) = next {
            run_limit(next_pool, state, job);
        }
    });
}

/// Per-tag serial executor: at most one task in flight per tag; a newer
/// submission replaces the waiting one for its tag.
pub struct TagExecutor {
    pool: ThreadPool,
    state: Arc<Mutex<TagState>>,
}

#[derive(Default)]
struct TagState {
    scheduled: HashSet<String>,
    waiting: HashMap<String, Job>,
}

impl TagExecutor {
    /// Creates an executor delegating to `pool`.
    #[must_use]
    pub fn new(pool: ThreadPool) -> Self {
        Self {
            pool,
            state: Arc::new(Mutex::new(TagState::default())),
        }
    }

    /// Submits a task under `tag`.
    pub fn execute(&self, tag: &str, job: impl FnOnce() + Send + 'static) {
        let mut state = self.state.lock();
        if state.scheduled.insert(tag.to_owned()) {
            drop(state);
            run_tagged(
                self.pool.clone(),
                Arc::clone(&self.state),
                tag.to_owned(),
                Box::new(job),
            );
        } else {
            state.waiting.insert(tag.to_owned(), Box::new(job));
        }
    }
}

fn run_tagged(pool: ThreadPool, state: Arc<Mutex<TagState>>, tag: String, job: Job) {
    let next_pool = pool.clone();
    pool.execute(move || {
        job();
        let next = {
            let mut s = state.lock();
            match s.waiting.remove(&tag) {
                Some(job) => Some(job),
                None => {
                    s.scheduled.remove(&tag);
                    None
                }
            }
        };
        if let Some(job) = next {
            run_tagged(next_pool, state, tag, job);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    #[test]
    fn pool_runs_jobs() {
        let pool = ThreadPool::new(2, Duration::from_millis(200));
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(wait_until(Duration::from_secs(2), || counter
            .load(Ordering::SeqCst)
            == 20));
    }

    #[test]
    fn pool_respects_worker_cap() {
        let pool = ThreadPool::new(2, Duration::from_millis(200));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done = Arc::clone(&done);
            pool.execute(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(wait_until(Duration::from_secs(2), || done
            .load(Ordering::SeqCst)
            == 8));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn limit_executor_coalesces_submissions() {
        let pool = ThreadPool::new(1, Duration::from_millis(200));
        let executor = LimitExecutor::new(pool);
        let started = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Mutex::new(()));

        let hold = gate.lock();
        {
            let started = Arc::clone(&started);
            let gate = Arc::clone(&gate);
            executor.execute(move || {
                started.fetch_add(1, Ordering::SeqCst);
                let _g = gate.lock();
            });
        }
        // Wait for the first task to start and block on the gate.
        assert!(wait_until(Duration::from_secs(1), || started
            .load(Ordering::SeqCst)
            == 1));
        // One submission lands in the waiting slot; the rest are dropped.
        for _ in 0..5 {
            let started = Arc::clone(&started);
            executor.execute(move || {
                started.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(hold);
        assert!(wait_until(Duration::from_secs(1), || started
            .load(Ordering::SeqCst)
            == 2));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn tag_executor_serializes_per_tag() {
        let pool = ThreadPool::new(4, Duration::from_millis(200));
        let executor = TagExecutor::new(pool);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let in_flight = Arc::clone(&in_flight);
            let overlap = Arc::clone(&overlap);
            let done = Arc::clone(&done);
            executor.execute("same-key", move || {
                if in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlap.fetch_add(1, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_millis(10));
                in_flight.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        // Three rapid submissions: the first runs, the last waits, the
        // middle one is replaced. Either way, none overlap.
        assert!(wait_until(Duration::from_secs(2), || done
            .load(Ordering::SeqCst)
            >= 2));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(overlap.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn tag_executor_keeps_tags_independent() {
        let pool = ThreadPool::new(4, Duration::from_millis(200));
        let executor = TagExecutor::new(pool);
        let done = Arc::new(AtomicUsize::new(0));
        for tag in ["a", "b", "c", "d"] {
            let done = Arc::clone(&done);
            executor.execute(tag, move || {
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(wait_until(Duration::from_secs(1), || done
            .load(Ordering::SeqCst)
            == 4));
    }
}
