//! Decode thread pool for background frame production (rasterize, disk read/write).
//!
//! Uses work-stealing deques:
//! - New tasks pushed to the global injector
//! - Idle workers steal from each other
//! - Zero lock contention between workers
//!
//! The pool is a shared resource: all sessions of a `PlaybackContext` submit
//! here, so its size bounds total decode concurrency, not per-session work.
//! Cancellation flags let a session's queued units become no-ops once it is
//! disposed.

use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use log::{error, trace};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker pool with work-stealing.
///
/// # Example
/// ```ignore
/// let workers = Workers::new(4);
/// workers.execute(move || {
///     pipeline.run_refill();
/// });
/// ```
pub struct Workers {
    injector: Arc<Injector<Job>>,          // Global queue for external tasks
    handles: Vec<thread::JoinHandle<()>>,  // Thread handles for proper shutdown
    shutdown: Arc<AtomicBool>,             // Shutdown signal
}

impl Workers {
    /// Create worker pool with `num_threads` decode threads (min 1).
    pub fn new(num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let injector: Arc<Injector<Job>> = Arc::new(Injector::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers_local: Vec<Worker<Job>> = Vec::new();
        let mut stealers = Vec::new();
        let mut handles = Vec::new();

        // Create per-worker deques
        for _ in 0..num_threads {
            let worker: Worker<Job> = Worker::new_fifo();
            stealers.push(worker.stealer());
            workers_local.push(worker);
        }

        // Spawn worker threads
        for (worker_id, worker) in workers_local.into_iter().enumerate() {
            let injector = Arc::clone(&injector);
            let shutdown = Arc::clone(&shutdown);
            let stealers = stealers.clone();

            let spawned = thread::Builder::new()
                .name(format!("lottie-decode-{}", worker_id))
                .spawn(move || {
                    trace!("Decode worker {} started", worker_id);

                    loop {
                        if let Some(job) = find_job(&worker, &injector, &stealers, worker_id) {
                            job();
                            continue;
                        }
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        // No work: short sleep to avoid CPU spin
                        thread::sleep(std::time::Duration::from_millis(1));
                    }

                    trace!("Decode worker {} stopped", worker_id);
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => error!("Failed to spawn decode worker {}: {}", worker_id, e),
            }
        }

        trace!("Decode pool initialized: {} threads (work-stealing)", handles.len());

        Self {
            injector,
            handles,
            shutdown,
        }
    }

    /// Number of live worker threads
    pub fn num_threads(&self) -> usize {
        self.handles.len()
    }

    /// Execute closure on a worker thread.
    ///
    /// If no worker thread could be spawned the closure runs inline.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.handles.is_empty() {
            f();
            return;
        }
        self.injector.push(Box::new(f));
    }

    /// Execute closure unless `cancelled` is set by the time a worker picks it up.
    ///
    /// The check happens at execution time, so a session disposed while its
    /// unit is still queued costs nothing.
    pub fn execute_unless_cancelled<F>(&self, cancelled: Arc<AtomicBool>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute(move || {
            if !cancelled.load(Ordering::Acquire) {
                f();
            }
        });
    }
}

/// Next job for worker `own`: local deque, then a batch from the injector,
/// then one job stolen from a sibling.
fn find_job(local: &Worker<Job>, injector: &Injector<Job>, stealers: &[Stealer<Job>], own: usize) -> Option<Job> {
    local.pop().or_else(|| {
        std::iter::repeat_with(|| {
            injector.steal_batch_and_pop(local).or_else(|| {
                stealers
                    .iter()
                    .enumerate()
                    .filter(|(id, _)| *id != own)
                    .map(|(_, s)| s.steal())
                    .collect::<Steal<Job>>()
            })
        })
        .find(|s| !s.is_retry())
        .and_then(Steal::success)
    })
}

impl Drop for Workers {
    fn drop(&mut self) {
        use std::time::{Duration, Instant};

        let num_threads = self.handles.len();
        trace!("Decode pool shutting down ({} threads)...", num_threads);

        self.shutdown.store(true, Ordering::SeqCst);

        // A unit may be mid-rasterize; give threads 500ms total, then detach.
        let deadline = Instant::now() + Duration::from_millis(500);

        let handles = std::mem::take(&mut self.handles);
        for handle in handles {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    trace!("Shutdown timeout reached, detaching remaining workers");
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }

        trace!("All {} decode workers stopped", num_threads);
    }
}
