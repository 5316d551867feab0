//! Serial state queue: one dedicated thread that owns session state mutation.
//!
//! Clock ticks and lifecycle transitions (open result, replay, jump, dispose)
//! all hop onto this queue, so they never race each other.
//! Nothing on this thread blocks on decode work; that goes to `Workers`.

use crossbeam_channel::{Sender, bounded, unbounded};
use log::{error, trace};
use std::sync::Mutex;
use std::thread::{self, JoinHandle, ThreadId};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct StateQueue {
    tx: Mutex<Option<Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: Option<ThreadId>,
}

impl StateQueue {
    pub fn new(name: &str) -> Self {
        let (tx, rx) = unbounded::<Job>();

        let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
            trace!("State queue started");
            // Exits when every sender is gone
            for job in rx.iter() {
                job();
            }
            trace!("State queue stopped");
        });

        let (handle, thread_id) = match spawned {
            Ok(handle) => {
                let id = handle.thread().id();
                (Some(handle), Some(id))
            }
            Err(e) => {
                error!("Failed to spawn state queue {}: {}", name, e);
                (None, None)
            }
        };

        Self {
            tx: Mutex::new(handle.as_ref().map(|_| tx)),
            handle: Mutex::new(handle),
            thread_id,
        }
    }

    /// True when called from the queue's own thread
    pub fn is_current(&self) -> bool {
        self.thread_id == Some(thread::current().id())
    }

    /// Enqueue `f`. Runs inline if the queue thread is unavailable.
    pub fn async_run<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match tx {
            Some(tx) => {
                if let Err(e) = tx.send(Box::new(f)) {
                    // Receiver gone (shutting down): run here rather than drop state changes
                    (e.into_inner())();
                }
            }
            None => f(),
        }
    }

    /// Run `f` on the queue and wait for its result.
    ///
    /// Called from the queue thread itself, runs inline (no self-deadlock).
    pub fn sync<R, F>(&self, f: F) -> Option<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Some(f());
        }
        let (tx, rx) = bounded(1);
        self.async_run(move || {
            let _ = tx.send(f());
        });
        rx.recv().ok()
    }
}

impl Drop for StateQueue {
    fn drop(&mut self) {
        // Close channel so the thread drains and exits
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_jobs_run_in_order() {
        let queue = StateQueue::new("test-state");
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let log = Arc::clone(&log);
            queue.async_run(move || log.lock().unwrap().push(i));
        }
        queue.sync(|| ()).unwrap();
        assert_eq!(*log.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_sync_returns_value_and_runs_on_queue() {
        let queue = Arc::new(StateQueue::new("test-state"));
        let q = Arc::clone(&queue);
        let on_queue = queue.sync(move || q.is_current()).unwrap();
        assert!(on_queue);
        assert!(!queue.is_current());
    }

    #[test]
    fn test_nested_sync_does_not_deadlock() {
        let queue = Arc::new(StateQueue::new("test-state"));
        let q = Arc::clone(&queue);
        let v = queue.sync(move || q.sync(|| 7).unwrap()).unwrap();
        assert_eq!(v, 7);
    }
}
