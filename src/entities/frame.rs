//! Decoded raster frame with reference-counted ownership and a release hook
//!
//! **Why**: Concurrent sessions of the same animation share decoded frames
//! through a weak cache. A frame must vanish from that cache the moment its
//! last holder lets go, so the release is driven by the frame itself.
//!
//! **Used by**: PlaybackWindow (queued frames), SharedFrameCache (weak slots),
//! PresentationSurface (frame in flight), DiskFrameStore (delta base)
//!
//! # Pixel Layout
//!
//! BGRA8 premultiplied, 4 bytes/pixel, rows padded to a 32-byte boundary
//! (see [`bytes_per_row`]). Dimensions are in pixels: logical size × backing scale.
//!
//! # Ownership
//!
//! `FrameBuffer` is a cheap handle (`Arc`). The strong count is the owner
//! count; when it reaches zero the attached [`ReleaseObserver`] is told which
//! (key, index, id) went away.

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use crate::entities::asset::AnimationKey;

/// Bytes per pixel (BGRA8)
pub const BYTES_PER_PIXEL: usize = 4;

/// Row stride for a given pixel width, padded to 32 bytes.
pub fn bytes_per_row(width: usize) -> usize {
    (width * BYTES_PER_PIXEL + 31) & !0x1F
}

/// Gets told when the last owner of a registered frame drops it.
///
/// Called from whichever thread released the frame; implementations must be
/// thread-safe and must not assume the frame is still reachable.
pub trait ReleaseObserver: Send + Sync {
    fn on_buffer_released(&self, key: &AnimationKey, index: i32, id: usize, bytes: usize);
}

struct FrameData {
    key: AnimationKey,
    index: i32,
    width: usize,
    height: usize,
    bytes_per_row: usize,
    pixels: Vec<u8>,
    observer: OnceLock<Weak<dyn ReleaseObserver>>,
}

impl Drop for FrameData {
    fn drop(&mut self) {
        if let Some(observer) = self.observer.get().and_then(Weak::upgrade) {
            let id = self as *const FrameData as usize;
            observer.on_buffer_released(&self.key, self.index, id, self.pixels.len());
        }
    }
}

/// Immutable decoded frame.
///
/// Equality is by frame index only (meaningful within one session).
#[derive(Clone)]
pub struct FrameBuffer {
    data: Arc<FrameData>,
}

impl FrameBuffer {
    /// Wrap rasterized pixels for frame `index` of `key`.
    ///
    /// Returns None if `pixels` does not match the key's padded buffer size.
    pub fn new(key: AnimationKey, index: i32, pixels: Vec<u8>) -> Option<Self> {
        let width = key.pixel_width();
        let height = key.pixel_height();
        let stride = bytes_per_row(width);
        if pixels.len() != stride * height {
            return None;
        }
        Some(Self {
            data: Arc::new(FrameData {
                key,
                index,
                width,
                height,
                bytes_per_row: stride,
                pixels,
                observer: OnceLock::new(),
            }),
        })
    }

    /// Attach release observer. Only the first attachment sticks.
    pub fn attach_release_observer(&self, observer: Weak<dyn ReleaseObserver>) -> bool {
        self.data.observer.set(observer).is_ok()
    }

    pub fn key(&self) -> &AnimationKey {
        &self.data.key
    }

    pub fn index(&self) -> i32 {
        self.data.index
    }

    /// Pixel width
    pub fn width(&self) -> usize {
        self.data.width
    }

    /// Pixel height
    pub fn height(&self) -> usize {
        self.data.height
    }

    pub fn backing_scale(&self) -> u32 {
        self.data.key.backing_scale
    }

    pub fn bytes_per_row(&self) -> usize {
        self.data.bytes_per_row
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data.pixels
    }

    /// Memory held by pixel data
    pub fn mem(&self) -> usize {
        self.data.pixels.len()
    }

    /// Identity of the underlying allocation (stable while any owner lives)
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.data) as usize
    }

    /// Number of live owners
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.data)
    }

    pub fn downgrade(&self) -> WeakFrameBuffer {
        WeakFrameBuffer {
            data: Arc::downgrade(&self.data),
        }
    }

    /// Tightly packed RGBA8 copy (for export/inspection).
    pub fn to_rgba(&self) -> Vec<u8> {
        let row_len = self.data.width * BYTES_PER_PIXEL;
        let mut out = Vec::with_capacity(row_len * self.data.height);
        for row in self.data.pixels.chunks(self.data.bytes_per_row) {
            for px in row[..row_len].chunks_exact(BYTES_PER_PIXEL) {
                out.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
            }
        }
        out
    }
}

impl PartialEq for FrameBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.data.index == other.data.index
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("key", &self.data.key.cache_name())
            .field("index", &self.data.index)
            .field("width", &self.data.width)
            .field("height", &self.data.height)
            .finish()
    }
}

/// Non-owning handle; does not keep pixels alive.
#[derive(Clone)]
pub struct WeakFrameBuffer {
    data: Weak<FrameData>,
}

impl WeakFrameBuffer {
    pub fn upgrade(&self) -> Option<FrameBuffer> {
        self.data.upgrade().map(|data| FrameBuffer { data })
    }

    /// Same identity as [`FrameBuffer::id`] of the frame it was made from
    pub fn id(&self) -> usize {
        self.data.as_ptr() as usize
    }

    /// True while some owner still holds the frame. Never creates a strong ref.
    pub fn is_alive(&self) -> bool {
        self.data.strong_count() > 0
    }
}

/// Reflect BGRA rows horizontally in place.
pub fn mirror_rows(pixels: &mut [u8], width: usize, stride: usize) {
    for row in pixels.chunks_mut(stride) {
        let row = &mut row[..width * BYTES_PER_PIXEL];
        for x in 0..width / 2 {
            let a = x * BYTES_PER_PIXEL;
            let b = (width - 1 - x) * BYTES_PER_PIXEL;
            for c in 0..BYTES_PER_PIXEL {
                row.swap(a + c, b + c);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::asset::AnimationSource;
    use std::sync::Mutex;

    fn key(w: u32, h: u32) -> AnimationKey {
        AnimationKey::new(AnimationSource::Bundle("test".into()), w, h)
    }

    fn frame(index: i32) -> FrameBuffer {
        let k = key(4, 2);
        let len = bytes_per_row(4) * 2;
        FrameBuffer::new(k, index, vec![0u8; len]).unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        released: Mutex<Vec<(i32, usize)>>,
    }

    impl ReleaseObserver for Recorder {
        fn on_buffer_released(&self, _key: &AnimationKey, index: i32, id: usize, _bytes: usize) {
            self.released.lock().unwrap().push((index, id));
        }
    }

    #[test]
    fn test_bytes_per_row_alignment() {
        assert_eq!(bytes_per_row(1), 32);
        assert_eq!(bytes_per_row(8), 32);
        assert_eq!(bytes_per_row(9), 64);
        assert_eq!(bytes_per_row(100), 416);
    }

    #[test]
    fn test_rejects_wrong_buffer_size() {
        assert!(FrameBuffer::new(key(4, 2), 0, vec![0u8; 10]).is_none());
    }

    #[test]
    fn test_release_hook_fires_on_last_owner() {
        let recorder = Arc::new(Recorder::default());
        let observer: Arc<dyn ReleaseObserver> = recorder.clone();

        let f = frame(7);
        let id = f.id();
        assert!(f.attach_release_observer(Arc::downgrade(&observer)));
        let clone = f.clone();
        assert_eq!(f.holders(), 2);

        drop(f);
        assert!(recorder.released.lock().unwrap().is_empty());

        drop(clone);
        assert_eq!(*recorder.released.lock().unwrap(), vec![(7, id)]);
    }

    #[test]
    fn test_weak_does_not_keep_alive() {
        let f = frame(1);
        let weak = f.downgrade();
        assert_eq!(weak.id(), f.id());
        assert!(weak.upgrade().is_some());
        drop(f);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_equality_by_index() {
        assert_eq!(frame(3), frame(3));
        assert_ne!(frame(3), frame(4));
    }

    #[test]
    fn test_mirror_rows() {
        let stride = bytes_per_row(3);
        let mut px = vec![0u8; stride];
        px[0..4].copy_from_slice(&[1, 1, 1, 1]);
        px[8..12].copy_from_slice(&[3, 3, 3, 3]);
        mirror_rows(&mut px, 3, stride);
        assert_eq!(&px[0..4], &[3, 3, 3, 3]);
        assert_eq!(&px[8..12], &[1, 1, 1, 1]);
    }
}
