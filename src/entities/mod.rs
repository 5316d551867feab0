//! Entities module - data types shared by the playback engine
//!
//! - Asset description and decoded identity (`asset`)
//! - Decoded frame buffers with release hooks (`frame`)
//! - Collaborator contracts: rasterizer and presentation (`traits`)
//! - Header-only reference rasterizer (`preview`)

pub mod asset;
pub mod frame;
pub mod preview;
pub mod traits;

pub use asset::{AnimationAsset, AnimationKey, AnimationSource, CachePolicy, PlayPolicy};
pub use frame::{FrameBuffer, ReleaseObserver, WeakFrameBuffer, bytes_per_row};
pub use preview::{LottieHeader, PreviewRasterizer};
pub use traits::{DecoderHandle, PresentationSurface, Rasterizer};
