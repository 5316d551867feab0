//! Process-wide shared frame cache with weak slots and release-driven eviction
//!
//! Structure: HashMap<AnimationKey, HashMap<i32, WeakFrameBuffer>>
//! - Outer map: animation key -> frames
//! - Inner map: frame index -> weak handle
//!
//! Slots never own pixels. A slot disappears when the frame's last owner
//! (a playback window, a frame in flight to presentation) drops it: the frame
//! calls back into the cache from its own teardown. There is no LRU and no
//! capacity bound; liveness equals "some session still holds it", which caps
//! the cache at window capacity × concurrent sessions of that animation.
//!
//! # Locking
//!
//! One coarse mutex. Contention is low (decode dominates). No strong
//! `FrameBuffer` is ever dropped while the lock is held, since that drop may
//! re-enter through the release hook.

use log::{debug, trace};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::entities::{AnimationKey, FrameBuffer, ReleaseObserver, WeakFrameBuffer};

static GLOBAL_CACHE: Lazy<SharedFrameCache> = Lazy::new(|| {
    debug!("SharedFrameCache: global instance created");
    SharedFrameCache::new()
});

/// Cache statistics for monitoring sharing efficiency
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    live_bytes: AtomicUsize,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.hits() + self.misses()
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 { 0.0 } else { self.hits() as f64 / total as f64 }
    }

    /// Pixel bytes of registered frames still alive
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    fn add_memory(&self, bytes: usize) {
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Saturating subtraction
    fn free_memory(&self, bytes: usize) {
        loop {
            let current = self.live_bytes.load(Ordering::Relaxed);
            let new_val = current.saturating_sub(bytes);
            if self
                .live_bytes
                .compare_exchange_weak(current, new_val, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }
}

type SlotMap = HashMap<AnimationKey, HashMap<i32, WeakFrameBuffer>>;

struct Slots {
    map: Mutex<SlotMap>,
    stats: CacheStats,
}

impl ReleaseObserver for Slots {
    fn on_buffer_released(&self, key: &AnimationKey, index: i32, id: usize, bytes: usize) {
        self.stats.free_memory(bytes);

        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        let Some(frames) = map.get_mut(key) else {
            return;
        };
        // Only remove if the slot still points at this exact buffer; a newer
        // buffer for the same index may have replaced it (loop wrap-around).
        if frames.get(&index).is_some_and(|slot| slot.id() == id) {
            frames.remove(&index);
            trace!("Released slot {}:{}", key, index);
        }
        if frames.is_empty() {
            map.remove(key);
        }
    }
}

/// Shared (key, frame index) → weak frame map. Cheap to clone.
#[derive(Clone)]
pub struct SharedFrameCache {
    slots: Arc<Slots>,
}

impl Default for SharedFrameCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedFrameCache {
    /// Isolated cache (tests, separate engines). Most callers want [`global`](Self::global).
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Slots {
                map: Mutex::new(HashMap::new()),
                stats: CacheStats::new(),
            }),
        }
    }

    /// Process-wide instance, created on first use, lives until exit.
    pub fn global() -> SharedFrameCache {
        GLOBAL_CACHE.clone()
    }

    /// Strong reference if the slot is still alive, None means "must decode".
    pub fn lookup(&self, key: &AnimationKey, index: i32) -> Option<FrameBuffer> {
        let found = {
            let map = self.slots.map.lock().unwrap_or_else(|e| e.into_inner());
            map.get(key)
                .and_then(|frames| frames.get(&index))
                .and_then(WeakFrameBuffer::upgrade)
        };

        if found.is_some() {
            self.slots.stats.record_hit();
            trace!("Cache hit {}:{}", key, index);
        } else {
            self.slots.stats.record_miss();
        }
        found
    }

    /// Install or overwrite the weak slot for (frame.key, frame.index).
    pub fn register(&self, frame: &FrameBuffer) {
        let observer: Weak<dyn ReleaseObserver> = {
            let slots: Arc<dyn ReleaseObserver> = self.slots.clone();
            Arc::downgrade(&slots)
        };
        if frame.attach_release_observer(observer) {
            self.slots.stats.add_memory(frame.mem());
        }

        let mut map = self.slots.map.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(frame.key().clone())
            .or_default()
            .insert(frame.index(), frame.downgrade());
    }

    /// Check if a live frame is cached (does not count as hit/miss)
    pub fn contains(&self, key: &AnimationKey, index: i32) -> bool {
        let map = self.slots.map.lock().unwrap_or_else(|e| e.into_inner());
        map.get(key)
            .and_then(|frames| frames.get(&index))
            .is_some_and(WeakFrameBuffer::is_alive)
    }

    /// Number of slots (including ones whose frame is mid-release)
    pub fn len(&self) -> usize {
        let map = self.slots.map.lock().unwrap_or_else(|e| e.into_inner());
        map.values().map(|frames| frames.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of animation keys with at least one slot
    pub fn key_count(&self) -> usize {
        self.slots.map.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Get cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.slots.stats
    }
}
