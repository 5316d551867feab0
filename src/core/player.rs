//! Player session: one animation instance from open to teardown.
//!
//! **Why**: Hosts (sticker views, reaction overlays, previews) only want
//! "play this asset on that surface" plus a state signal for spinners and
//! restart buttons. The session wires window, producer, clock and surface
//! together and owns their lifecycle.
//!
//! **Used by**: Host UI, CLI
//!
//! # States
//!
//! ```text
//! Initializing --open failed--> Failed (terminal)
//!      |
//!      +--first frame > 0 shown--> Playing --policy satisfied--> Stopped
//!                                     ^                            |
//!                                     +-------- replay() ----------+
//! ```
//!
//! # Threads
//!
//! - Asset open (decompress + rasterizer open) runs on the decode pool
//! - Ticks, replay, jump and dispose run on the context's state queue
//! - Refill units run on the decode pool, at most one per session
//!
//! # Teardown
//!
//! `dispose()` flags the session cancelled before anything else, so no new
//! refill is scheduled and queued units become no-ops. The clock token and
//! the pipeline are then dropped on the state queue. A unit still running
//! keeps the pipeline alive through its own `Arc` and releases it when it
//! finishes.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use log::{debug, info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::clock::{ClockToken, frame_step, playback_fps};
use super::context::PlaybackContext;
use super::decode::{FrameProducer, Pipeline};
use super::disk_store::{DiskFrameStore, StoreHeader};
use super::window::PlaybackWindow;
use crate::entities::{AnimationAsset, DecoderHandle, FrameBuffer, PresentationSurface, Rasterizer};
use crate::error::AssetOpenError;

/// Externally visible playback state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaybackState {
    Initializing,
    Failed,
    Playing,
    Stopped,
}

/// Subscription to a session's state changes.
///
/// Starts with the state current at subscription time. Disconnects when the
/// session is gone.
pub struct StateStream {
    rx: Receiver<PlaybackState>,
}

impl StateStream {
    /// Block until the next state; None once the session is gone.
    pub fn recv(&self) -> Option<PlaybackState> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<PlaybackState> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<PlaybackState> {
        self.rx.try_recv().ok()
    }

    /// Consume states until `state` arrives. False on timeout or disconnect.
    pub fn wait_for(&self, state: PlaybackState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(left) {
                Ok(s) if s == state => return true,
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
    }

    pub fn receiver(&self) -> &Receiver<PlaybackState> {
        &self.rx
    }
}

struct StateCell {
    current: PlaybackState,
    subscribers: Vec<Sender<PlaybackState>>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Progress {
    current_frame: Option<i32>,
    total_frames: Option<i32>,
    fps: Option<u32>,
}

/// Frame source resolved on the decode pool
struct Opened {
    pipeline: Pipeline,
    fps: u32,
    end_frame: i32,
}

// ============================================================================
// Session core (shared with tick closures and the open unit)
// ============================================================================

struct SessionCore {
    id: Uuid,
    asset: AnimationAsset,
    ctx: PlaybackContext,
    rasterizer: Arc<dyn Rasterizer>,
    surface: Arc<dyn PresentationSurface>,
    cancelled: Arc<AtomicBool>,
    state: Mutex<StateCell>,
    progress: Mutex<Progress>,
    pipeline: Mutex<Option<Arc<Pipeline>>>,
    clock: Mutex<Option<ClockToken>>,
}

impl SessionCore {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn pipeline(&self) -> Option<Arc<Pipeline>> {
        self.pipeline.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn state(&self) -> PlaybackState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).current
    }

    fn set_state(&self, state: PlaybackState) {
        let mut cell = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if cell.current == state || cell.current == PlaybackState::Failed {
            return;
        }
        cell.current = state;
        cell.subscribers.retain(|tx| tx.send(state).is_ok());
        info!("Session {} -> {:?}", self.id, state);
    }

    fn subscribe(&self) -> StateStream {
        let (tx, rx) = unbounded();
        let mut cell = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let _ = tx.send(cell.current);
        cell.subscribers.push(tx);
        StateStream { rx }
    }

    fn progress(&self) -> Progress {
        *self.progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------------
    // State queue handlers
    // ------------------------------------------------------------------------

    fn on_opened(self: &Arc<Self>, result: Result<Opened, AssetOpenError>) {
        if self.is_cancelled() {
            return;
        }
        match result {
            Err(e) => {
                warn!("Session {}: cannot open {}: {}", self.id, self.asset.key(), e);
                self.set_state(PlaybackState::Failed);
            }
            Ok(opened) => {
                {
                    let mut progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
                    progress.fps = Some(opened.fps);
                    progress.total_frames = Some(opened.end_frame);
                }
                let pipeline = Arc::new(opened.pipeline);
                *self.pipeline.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&pipeline));
                self.install_clock(opened.fps);
                self.schedule_refill(&pipeline);
            }
        }
    }

    fn install_clock(self: &Arc<Self>, fps: u32) {
        let weak = Arc::downgrade(self);
        let token = self.ctx.loops().install(fps, move || {
            if let Some(core) = weak.upgrade() {
                core.tick();
            }
        });
        let previous = self.clock.lock().unwrap_or_else(|e| e.into_inner()).replace(token);
        drop(previous);
    }

    fn stop_clock(&self) {
        let token = self.clock.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(token);
    }

    fn tick(&self) {
        if self.is_cancelled() {
            return;
        }
        let Some(pipeline) = self.pipeline() else {
            return;
        };

        let (delivery, hungry, drained) = {
            let mut window = pipeline.window.lock().unwrap_or_else(|e| e.into_inner());
            let delivery = window.take_one();
            (delivery, window.is_hungry(), window.is_drained())
        };

        if let Some(delivery) = delivery {
            let index = delivery.frame.index();
            trace!("Session {} tick: frame {}", self.id, index);
            self.progress.lock().unwrap_or_else(|e| e.into_inner()).current_frame = Some(index);
            self.surface.display(delivery.frame);
            if index > 0 {
                self.set_state(PlaybackState::Playing);
            }
            if delivery.completes {
                self.finish();
                return;
            }
        } else if drained {
            self.finish();
            return;
        }

        if hungry {
            self.schedule_refill(&pipeline);
        }
    }

    fn finish(&self) {
        self.stop_clock();
        self.set_state(PlaybackState::Stopped);
    }

    /// Submit a refill unit unless one is already in flight.
    fn schedule_refill(&self, pipeline: &Arc<Pipeline>) {
        if !pipeline.gate.try_acquire() {
            trace!("Session {}: refill already in flight", self.id);
            return;
        }
        let unit = Arc::clone(pipeline);
        self.ctx
            .workers()
            .execute_unless_cancelled(Arc::clone(&self.cancelled), move || {
                unit.run_refill();
            });
    }

    fn restart(self: &Arc<Self>) {
        if self.is_cancelled() {
            return;
        }
        if self.state() != PlaybackState::Stopped || self.asset.play_policy().loops_forever() {
            debug!("Session {}: replay ignored in {:?}", self.id, self.state());
            return;
        }
        let Some(pipeline) = self.pipeline() else {
            return;
        };
        pipeline.window.lock().unwrap_or_else(|e| e.into_inner()).restart();
        info!("Session {} replay", self.id);

        if let Some(fps) = self.progress().fps {
            self.install_clock(fps);
        }
        self.schedule_refill(&pipeline);
    }

    fn jump(&self, frame: i32) {
        if self.is_cancelled() {
            return;
        }
        let Some(pipeline) = self.pipeline() else {
            return;
        };
        pipeline.window.lock().unwrap_or_else(|e| e.into_inner()).jump_to(frame);
        debug!("Session {}: cursor moved to {}", self.id, frame);
        self.schedule_refill(&pipeline);
    }

    fn teardown(&self) {
        self.stop_clock();
        let pipeline = self.pipeline.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pipeline) = pipeline {
            pipeline.window.lock().unwrap_or_else(|e| e.into_inner()).cancel();
        }
        info!("Session {} disposed", self.id);
    }
}

// ============================================================================
// Asset open (decode pool)
// ============================================================================

struct OpenRequest {
    asset: AnimationAsset,
    rasterizer: Arc<dyn Rasterizer>,
    ctx: PlaybackContext,
    cancelled: Arc<AtomicBool>,
}

impl OpenRequest {
    fn open(&self) -> Result<Opened, AssetOpenError> {
        let settings = self.ctx.settings();
        let key = self.asset.key();

        let store = self
            .asset
            .cache_policy()
            .ttl()
            .and_then(|ttl| DiskFrameStore::open(self.ctx.cache_dir(), key, ttl));

        // Complete store recorded at this cadence: frames come from disk and
        // the rasterizer is never opened. Another cadence re-renders and
        // `initialize` resets the store.
        if let Some(header) = store.as_ref().and_then(|s| s.metadata()).filter(|h| h.finished) {
            let fps = playback_fps(
                header.source_fps,
                self.asset.max_fps(),
                settings.fps_floor,
                settings.max_refresh_rate,
            );
            if frame_step(header.source_fps, fps) == header.step as i32 {
                info!("Playing {} from disk: {} frames at {} fps", key, header.end_frame, fps);
                return Ok(self.assemble(None, store, fps, header.step as i32, header.start_frame, header.end_frame));
            }
            debug!(
                "Store for {} was recorded with step {}, playing at {} fps needs a re-render",
                key, header.step, fps
            );
        }

        let source = self.asset.decompressed()?;
        let decoder = self.rasterizer.open(&source, &key.cache_name())?;
        let source_fps = decoder.source_fps().max(1);
        let (start, end) = (decoder.start_frame(), decoder.end_frame());
        if end <= start {
            return Err(AssetOpenError::Rejected(format!("empty frame range [{}, {})", start, end)));
        }

        let fps = playback_fps(
            source_fps,
            self.asset.max_fps(),
            settings.fps_floor,
            settings.max_refresh_rate,
        );
        let step = frame_step(source_fps, fps);
        if let Some(store) = &store {
            store.initialize(StoreHeader::new(
                key,
                source_fps,
                step,
                start,
                end,
                settings.disk_frame_ceiling,
            ));
        }
        info!(
            "Opened {}: frames [{}, {}), source {} fps, playing at {} fps (step {})",
            key, start, end, source_fps, fps, step
        );
        Ok(self.assemble(Some(decoder), store, fps, step, start, end))
    }

    fn assemble(
        &self,
        decoder: Option<Box<dyn DecoderHandle>>,
        store: Option<Arc<DiskFrameStore>>,
        fps: u32,
        step: i32,
        start: i32,
        end: i32,
    ) -> Opened {
        let window = PlaybackWindow::for_policy(
            start,
            end,
            step,
            self.ctx.settings().window_capacity,
            self.asset.play_policy(),
        );
        let producer = FrameProducer::new(
            self.asset.key().clone(),
            decoder,
            store,
            self.ctx.frame_cache().clone(),
            end,
        );
        Opened {
            pipeline: Pipeline::new(window, producer, Arc::clone(&self.cancelled)),
            fps,
            end_frame: end,
        }
    }
}

// ============================================================================
// Public handle
// ============================================================================

/// Playback of one animation asset on one surface. Disposed on drop.
pub struct PlayerSession {
    core: Arc<SessionCore>,
}

impl PlayerSession {
    /// Start playing `asset` on `surface`.
    ///
    /// Returns immediately in `Initializing`; the asset is opened on the
    /// decode pool. Open failures end in `Failed`.
    pub fn start(
        ctx: &PlaybackContext,
        asset: AnimationAsset,
        rasterizer: Arc<dyn Rasterizer>,
        surface: Arc<dyn PresentationSurface>,
    ) -> PlayerSession {
        let id = Uuid::new_v4();
        let cancelled = Arc::new(AtomicBool::new(false));
        info!("Session {} starting {} ({:?})", id, asset.key(), asset.play_policy());

        let core = Arc::new(SessionCore {
            id,
            asset: asset.clone(),
            ctx: ctx.clone(),
            rasterizer: Arc::clone(&rasterizer),
            surface,
            cancelled: Arc::clone(&cancelled),
            state: Mutex::new(StateCell {
                current: PlaybackState::Initializing,
                subscribers: Vec::new(),
            }),
            progress: Mutex::new(Progress::default()),
            pipeline: Mutex::new(None),
            clock: Mutex::new(None),
        });

        let request = OpenRequest {
            asset,
            rasterizer,
            ctx: ctx.clone(),
            cancelled: Arc::clone(&cancelled),
        };
        let weak = Arc::downgrade(&core);
        ctx.workers().execute_unless_cancelled(cancelled, move || {
            let result = request.open();
            let Some(core) = weak.upgrade() else {
                return;
            };
            let queue = Arc::clone(core.ctx.state_queue());
            queue.async_run(move || core.on_opened(result));
        });

        PlayerSession { core }
    }

    pub fn id(&self) -> Uuid {
        self.core.id
    }

    pub fn asset(&self) -> &AnimationAsset {
        &self.core.asset
    }

    pub fn state(&self) -> PlaybackState {
        self.core.state()
    }

    /// New subscription; first item is the current state.
    pub fn state_stream(&self) -> StateStream {
        self.core.subscribe()
    }

    /// Index of the last frame handed to the surface
    pub fn current_frame(&self) -> Option<i32> {
        self.core.progress().current_frame
    }

    /// End frame bound, known once the asset is open
    pub fn total_frames(&self) -> Option<i32> {
        self.core.progress().total_frames
    }

    /// Tick rate, known once the asset is open
    pub fn fps(&self) -> Option<u32> {
        self.core.progress().fps
    }

    /// Last frame handed to the surface (still displayed after a stop)
    pub fn last_frame(&self) -> Option<FrameBuffer> {
        let pipeline = self.core.pipeline()?;
        let window = pipeline.window.lock().unwrap_or_else(|e| e.into_inner());
        window.previous_frame().cloned()
    }

    /// Play again from the start frame. Only valid when a non-looping
    /// session has stopped; ignored otherwise.
    pub fn replay(&self) {
        let core = Arc::clone(&self.core);
        self.core.ctx.state_queue().async_run(move || core.restart());
    }

    /// Move the decode cursor to `frame` (clamped to the frame range).
    pub fn jump_to(&self, frame: i32) {
        let core = Arc::clone(&self.core);
        self.core.ctx.state_queue().async_run(move || core.jump(frame));
    }

    /// Tear this session down and start the same animation at another
    /// backing scale (new asset, new cache key).
    pub fn update_resolution(self, backing_scale: u32) -> PlayerSession {
        let asset = self.core.asset.with_backing_scale(backing_scale);
        let ctx = self.core.ctx.clone();
        let rasterizer = Arc::clone(&self.core.rasterizer);
        let surface = Arc::clone(&self.core.surface);
        self.dispose();
        PlayerSession::start(&ctx, asset, rasterizer, surface)
    }

    /// Stop playback and release decode resources. Idempotent.
    pub fn dispose(&self) {
        if self.core.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let core = Arc::clone(&self.core);
        self.core.ctx.state_queue().sync(move || core.teardown());
    }

    pub fn is_disposed(&self) -> bool {
        self.core.is_cancelled()
    }
}

impl Drop for PlayerSession {
    fn drop(&mut self) {
        self.dispose();
    }
}
