//! Playback clock: steady-rate tick loops shared between sessions.
//!
//! **Why**: Every playing session needs a periodic tick at its target fps.
//! Sessions that run at the same rate share one ticker thread instead of
//! spawning one each; the ticker stops once its last session deinstalls.
//!
//! Ticks are dispatched onto the state queue, never run on the ticker thread,
//! so a tick callback may freely touch session state.
//!
//! # Rate Selection
//!
//! [`playback_fps`]: `max(min(source, cap), floor)`, then limited by the
//! display refresh rate. [`frame_step`]: how many source frames one tick
//! advances when the source runs faster than playback.

use crossbeam_channel::{Sender, bounded, select, tick};
use log::{debug, error, trace};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use super::state_queue::StateQueue;

type Callback = Arc<dyn Fn() + Send + Sync>;
type Callbacks = Arc<Mutex<HashMap<u64, Callback>>>;

/// Tick rate for a session.
///
/// The floor keeps very low-fps assets animating smoothly, the cap keeps
/// expensive assets from over-rendering.
pub fn playback_fps(source_fps: u32, max_fps: u32, floor: u32, max_refresh_rate: u32) -> u32 {
    let fps = source_fps.min(max_fps).max(floor);
    fps.min(max_refresh_rate.max(30)).max(1)
}

/// Source frames advanced per delivered frame.
pub fn frame_step(source_fps: u32, target_fps: u32) -> i32 {
    if target_fps == 0 || source_fps <= target_fps {
        return 1;
    }
    ((source_fps as f32 / target_fps as f32).round() as i32).max(1)
}

struct TickLoop {
    callbacks: Callbacks,
    // Dropping the sender stops the ticker thread
    _stop: Sender<()>,
}

/// Registry of running tick loops, keyed by period.
pub struct FpsLoops {
    queue: Arc<StateQueue>,
    loops: Mutex<HashMap<u64, TickLoop>>,
    next_id: AtomicU64,
}

impl FpsLoops {
    pub fn new(queue: Arc<StateQueue>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            loops: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Install `callback` to run on the state queue `fps` times per second.
    ///
    /// The registration lives as long as the returned token.
    pub fn install<F>(self: &Arc<Self>, fps: u32, callback: F) -> ClockToken
    where
        F: Fn() + Send + Sync + 'static,
    {
        let period = Duration::from_secs_f64(1.0 / fps.max(1) as f64);
        let period_us = period.as_micros() as u64;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
        let entry = loops.entry(period_us).or_insert_with(|| self.spawn_loop(period));
        entry
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::new(callback));

        trace!("Clock token {} installed at {} fps", id, fps);
        ClockToken {
            loops: Arc::downgrade(self),
            period_us,
            id,
        }
    }

    /// Number of ticker threads currently running
    pub fn active_loops(&self) -> usize {
        self.loops.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn spawn_loop(&self, period: Duration) -> TickLoop {
        let callbacks: Callbacks = Arc::new(Mutex::new(HashMap::new()));
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let queue = Arc::clone(&self.queue);
        let thread_callbacks = Arc::clone(&callbacks);

        let spawned = thread::Builder::new()
            .name(format!("lottie-clock-{}us", period.as_micros()))
            .spawn(move || {
                let ticker = tick(period);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            let current: Vec<Callback> = thread_callbacks
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .values()
                                .cloned()
                                .collect();
                            if current.is_empty() {
                                continue;
                            }
                            queue.async_run(move || {
                                for cb in &current {
                                    cb();
                                }
                            });
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
                trace!("Clock loop {:?} stopped", period);
            });

        if let Err(e) = spawned {
            error!("Failed to spawn clock loop {:?}: {}", period, e);
        } else {
            debug!("Clock loop started: period {:?}", period);
        }

        TickLoop {
            callbacks,
            _stop: stop_tx,
        }
    }

    fn deinstall(&self, period_us: u64, id: u64) {
        let mut loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = loops.get(&period_us) else {
            return;
        };
        let now_empty = {
            let mut callbacks = entry.callbacks.lock().unwrap_or_else(|e| e.into_inner());
            callbacks.remove(&id);
            callbacks.is_empty()
        };
        if now_empty {
            loops.remove(&period_us);
        }
        trace!("Clock token {} deinstalled", id);
    }
}

/// Registration in a tick loop. Dropping it stops the ticks for this session.
pub struct ClockToken {
    loops: Weak<FpsLoops>,
    period_us: u64,
    id: u64,
}

impl ClockToken {
    pub fn period(&self) -> Duration {
        Duration::from_micros(self.period_us)
    }
}

impl Drop for ClockToken {
    fn drop(&mut self) {
        if let Some(loops) = self.loops.upgrade() {
            loops.deinstall(self.period_us, self.id);
        }
    }
}
