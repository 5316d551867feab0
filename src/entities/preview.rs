//! Reference rasterizer: reads the Lottie header, paints a frame-dependent pattern.
//!
//! **Why**: Vector interpretation belongs to an external decoder library. The
//! CLI and tests still need something that validates a Lottie document and
//! produces distinguishable frames at the right size, fps and range.
//!
//! Pattern: background fades red↔green across the frame range, a white bar
//! sweeps left to right. Deterministic per (index, size).

use serde::Deserialize;

use super::frame::BYTES_PER_PIXEL;
use super::traits::{DecoderHandle, Rasterizer};
use crate::error::AssetOpenError;

/// Top-level Lottie fields the player cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct LottieHeader {
    /// Frame rate
    pub fr: f64,
    /// In point (first frame)
    pub ip: f64,
    /// Out point (end bound)
    pub op: f64,
    /// Composition width
    pub w: u32,
    /// Composition height
    pub h: u32,
}

impl LottieHeader {
    pub fn parse(source: &[u8]) -> Result<Self, AssetOpenError> {
        let text = std::str::from_utf8(source).map_err(|_| AssetOpenError::NotUtf8)?;
        let header: LottieHeader =
            serde_json::from_str(text).map_err(|e| AssetOpenError::Rejected(e.to_string()))?;
        if !(header.fr > 0.0) {
            return Err(AssetOpenError::Rejected(format!("invalid frame rate {}", header.fr)));
        }
        if header.op <= header.ip {
            return Err(AssetOpenError::Rejected(format!(
                "empty frame range [{}, {})",
                header.ip, header.op
            )));
        }
        Ok(header)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PreviewRasterizer;

impl PreviewRasterizer {
    pub fn new() -> Self {
        Self
    }
}

impl Rasterizer for PreviewRasterizer {
    fn open(&self, source: &[u8], cache_key: &str) -> Result<Box<dyn DecoderHandle>, AssetOpenError> {
        let header = LottieHeader::parse(source)?;
        log::debug!(
            "PreviewRasterizer opened {}: {} fps, frames [{}, {}), {}x{}",
            cache_key, header.fr, header.ip, header.op, header.w, header.h
        );
        Ok(Box::new(PreviewHandle {
            fps: header.fr.round().max(1.0) as u32,
            start: header.ip.round() as i32,
            end: header.op.round() as i32,
        }))
    }
}

struct PreviewHandle {
    fps: u32,
    start: i32,
    end: i32,
}

impl DecoderHandle for PreviewHandle {
    fn render_frame(
        &mut self,
        index: i32,
        out: &mut [u8],
        width: usize,
        height: usize,
        bytes_per_row: usize,
    ) -> bool {
        if index < self.start || index >= self.end || out.len() < height * bytes_per_row {
            return false;
        }
        paint_pattern(index - self.start, self.end - self.start, out, width, height, bytes_per_row);
        true
    }

    fn source_fps(&self) -> u32 {
        self.fps
    }

    fn start_frame(&self) -> i32 {
        self.start
    }

    fn end_frame(&self) -> i32 {
        self.end
    }
}

/// Paint frame `offset` of `count` into a BGRA buffer.
pub fn paint_pattern(offset: i32, count: i32, out: &mut [u8], width: usize, height: usize, stride: usize) {
    let t = if count > 1 { offset as f32 / (count - 1) as f32 } else { 0.0 };
    let bg = [128u8, (255.0 * (1.0 - t)) as u8, (255.0 * t) as u8, 255u8];
    let bar_x = ((width.saturating_sub(1)) as f32 * t) as usize;

    for row in out.chunks_mut(stride).take(height) {
        for (x, px) in row[..width * BYTES_PER_PIXEL].chunks_exact_mut(BYTES_PER_PIXEL).enumerate() {
            if x == bar_x {
                px.copy_from_slice(&[255, 255, 255, 255]);
            } else {
                px.copy_from_slice(&bg);
            }
        }
    }
}
