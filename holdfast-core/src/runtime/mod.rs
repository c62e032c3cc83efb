//! Worker pool runtime for opaque CPU-bound jobs.
//!
//! Connection handlers queue one job per inbound payload here; the pool
//! executes them on dedicated OS threads so socket tasks never run
//! application work.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// An opaque unit of CPU work.
type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolShared {
    queue: Mutex<VecDeque<Job>>,
    job_available: Condvar,
    shutdown: AtomicBool,
    completed: AtomicU64,
}

/// Pool of OS worker threads executing queued jobs in FIFO order.
///
/// Jobs queued before [`shutdown`](WorkerPool::shutdown) still run; jobs
/// queued after it are dropped with a warning. A panicking job is contained
/// to itself and does not take its worker down.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a pool with `threads` worker threads (at least one).
    #[must_use]
    pub fn new(threads: usize) -> Self {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            job_available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            completed: AtomicU64::new(0),
        });

        let workers = (0..threads.max(1))
            .map(|index| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("holdfast-worker-{index}"))
                    .spawn(move || worker_loop(&shared, index))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { shared, workers: Mutex::new(workers) }
    }

    /// Create a pool with one worker per logical CPU.
    #[must_use]
    pub fn with_default_threads() -> Self {
        Self::new(num_cpus::get())
    }

    /// Process-wide default pool, created lazily.
    ///
    /// Components take an explicit `Arc<WorkerPool>`; this accessor is the
    /// default wiring for production use. Tests should construct their own
    /// pools instead.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<WorkerPool>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::with_default_threads())))
    }

    /// Queue a job for execution.
    ///
    /// Jobs submitted after shutdown are dropped.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.shutdown.load(Ordering::Acquire) {
            warn!("dropping job submitted after worker pool shutdown");
            return;
        }
        self.shared.queue.lock().push_back(Box::new(job));
        self.shared.job_available.notify_one();
    }

    /// Total number of jobs completed so far.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    /// Number of jobs waiting for a worker.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Number of worker threads still attached to the pool.
    #[must_use]
    pub fn threads(&self) -> usize {
        self.workers.lock().len()
    }

    /// Stop accepting jobs, drain the queue, and join the workers.
    ///
    /// Workers that do not stop within `timeout` are detached.
    pub fn shutdown(&self, timeout: Duration) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.job_available.notify_all();

        let deadline = Instant::now() + timeout;
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("worker thread did not stop within {timeout:?}; detaching");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown(Duration::from_secs(5));
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.threads())
            .field("queued", &self.queued())
            .field("completed", &self.completed())
            .finish()
    }
}

fn worker_loop(shared: &Arc<PoolShared>, index: usize) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    break Some(job);
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                shared.job_available.wait(&mut queue);
            }
        };

        let Some(job) = job else { break };
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
            warn!(worker = index, "job panicked");
        }
        shared.completed.fetch_add(1, Ordering::Relaxed);
    }
    debug!(worker = index, "worker thread stopped");
}
