//! Abstract traits for dependency inversion.
//!
//! These traits define the collaborators the playback engine talks to without
//! knowing their implementation: the vector rasterizer (inbound) and the
//! presentation surface (outbound).
//!
//! Implementations live in `core::surface`, `entities::preview`
//! (reference rasterizer), or in the host application.

use std::sync::Arc;

use super::frame::FrameBuffer;
use crate::error::AssetOpenError;

/// Opened animation, ready to rasterize frames.
///
/// Used by exactly one decode unit at a time (refills are single-flight per
/// session), so methods may take `&mut self`.
pub trait DecoderHandle: Send {
    /// Rasterize `index` into `out` (BGRA8, `height` rows of `bytes_per_row`).
    ///
    /// Returns false if the frame could not be produced.
    fn render_frame(
        &mut self,
        index: i32,
        out: &mut [u8],
        width: usize,
        height: usize,
        bytes_per_row: usize,
    ) -> bool;

    /// Intrinsic frame rate of the animation
    fn source_fps(&self) -> u32;

    /// First frame index (inclusive)
    fn start_frame(&self) -> i32;

    /// Last frame bound (exclusive)
    fn end_frame(&self) -> i32;
}

/// Vector animation decoder library.
pub trait Rasterizer: Send + Sync {
    /// Open decompressed animation bytes. `cache_key` identifies the animation
    /// for decoders that keep their own resource caches.
    fn open(&self, source: &[u8], cache_key: &str) -> Result<Box<dyn DecoderHandle>, AssetOpenError>;
}

/// Displays decoded frames (software blit, GPU texture upload, ...).
///
/// Called at most once per produced frame, in order, from the state queue.
/// Implementations marshal to the UI thread themselves.
pub trait PresentationSurface: Send + Sync {
    fn display(&self, frame: FrameBuffer);
}

/// Blanket impl: Arc<T> implements traits if T does
impl<T: Rasterizer + ?Sized> Rasterizer for Arc<T> {
    fn open(&self, source: &[u8], cache_key: &str) -> Result<Box<dyn DecoderHandle>, AssetOpenError> {
        (**self).open(source, cache_key)
    }
}

impl<T: PresentationSurface + ?Sized> PresentationSurface for Arc<T> {
    fn display(&self, frame: FrameBuffer) {
        (**self).display(frame)
    }
}
