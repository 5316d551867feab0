//! Shared engine resources for player sessions.
//!
//! **Why**: The decode pool, the state queue, the clock loops and the frame
//! cache are shared resources: their sizes bound total work, not per-session
//! work. Every session started from one context shares them.
//!
//! `PlaybackContext::shared()` is the process-wide engine (global frame
//! cache, default settings). `PlaybackContext::new()` builds an isolated one.

use log::info;
use once_cell::sync::Lazy;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::clock::FpsLoops;
use super::frame_cache::SharedFrameCache;
use super::state_queue::StateQueue;
use super::workers::Workers;
use crate::config::PlayerSettings;
use crate::paths::{self, PathConfig};

static SHARED: Lazy<PlaybackContext> = Lazy::new(|| {
    PlaybackContext::with_frame_cache(PlayerSettings::default(), SharedFrameCache::global())
});

struct ContextInner {
    settings: PlayerSettings,
    cache_dir: PathBuf,
    loops: Arc<FpsLoops>,
    state_queue: Arc<StateQueue>,
    workers: Workers,
    frame_cache: SharedFrameCache,
}

/// Handle to one engine. Cheap to clone.
#[derive(Clone)]
pub struct PlaybackContext {
    inner: Arc<ContextInner>,
}

impl PlaybackContext {
    /// Isolated engine with its own frame cache.
    pub fn new(settings: PlayerSettings) -> Self {
        Self::with_frame_cache(settings, SharedFrameCache::new())
    }

    /// Engine using the given frame cache (e.g. `SharedFrameCache::global()`).
    pub fn with_frame_cache(settings: PlayerSettings, frame_cache: SharedFrameCache) -> Self {
        let cache_dir = settings
            .cache_dir
            .clone()
            .unwrap_or_else(|| paths::frames_dir(&PathConfig::from_env_and_cli(None)));

        let num_workers = settings.resolved_decode_workers();
        let workers = Workers::new(num_workers);
        let state_queue = Arc::new(StateQueue::new("lottie-state"));
        let loops = FpsLoops::new(Arc::clone(&state_queue));

        info!(
            "Playback context: {} decode workers, window {}, cache dir {}",
            workers.num_threads(),
            settings.window_capacity,
            cache_dir.display()
        );

        Self {
            inner: Arc::new(ContextInner {
                settings,
                cache_dir,
                loops,
                state_queue,
                workers,
                frame_cache,
            }),
        }
    }

    /// Process-wide engine, created on first use.
    pub fn shared() -> PlaybackContext {
        SHARED.clone()
    }

    pub fn settings(&self) -> &PlayerSettings {
        &self.inner.settings
    }

    /// Directory holding disk frame stores
    pub fn cache_dir(&self) -> &Path {
        &self.inner.cache_dir
    }

    pub fn workers(&self) -> &Workers {
        &self.inner.workers
    }

    pub fn state_queue(&self) -> &Arc<StateQueue> {
        &self.inner.state_queue
    }

    pub fn loops(&self) -> &Arc<FpsLoops> {
        &self.inner.loops
    }

    pub fn frame_cache(&self) -> &SharedFrameCache {
        &self.inner.frame_cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolated_contexts_have_own_cache() {
        let a = PlaybackContext::new(PlayerSettings::default());
        let b = PlaybackContext::new(PlayerSettings::default());
        assert!(!Arc::ptr_eq(a.state_queue(), b.state_queue()));

        let key = crate::entities::AnimationKey::new(
            crate::entities::AnimationSource::Bundle("ctx".into()),
            1,
            1,
        );
        let frame = crate::entities::FrameBuffer::new(key.clone(), 0, vec![0u8; 32]).unwrap();
        a.frame_cache().register(&frame);
        assert!(a.frame_cache().contains(&key, 0));
        assert!(!b.frame_cache().contains(&key, 0));
    }

    #[test]
    fn test_settings_cache_dir_wins() {
        let settings = PlayerSettings {
            cache_dir: Some(PathBuf::from("/tmp/lottie-test-frames")),
            decode_workers: 2,
            ..Default::default()
        };
        let ctx = PlaybackContext::new(settings);
        assert_eq!(ctx.cache_dir(), Path::new("/tmp/lottie-test-frames"));
        assert_eq!(ctx.workers().num_threads(), 2);
    }

    #[test]
    fn test_shared_is_singleton() {
        let a = PlaybackContext::shared();
        let b = PlaybackContext::shared();
        assert!(Arc::ptr_eq(a.state_queue(), b.state_queue()));
    }
}
