//! Lottie animation playback engine.
//!
//! Decodes animation frames on a shared pool, shares live frames between
//! sessions playing the same animation, optionally persists them to an LZ4
//! delta file, and hands them to a presentation surface on a clock.

// Core engine (pool, window, caches, clock, sessions)
pub mod core;

pub mod cli;
pub mod config;
pub mod entities;
pub mod error;
pub mod paths;

// Re-export commonly used types from core
pub use core::context::PlaybackContext;
pub use core::frame_cache::SharedFrameCache;
pub use core::player::{PlaybackState, PlayerSession, StateStream};
pub use core::surface::{ChannelSurface, FnSurface};

// Re-export entities
pub use entities::{
    AnimationAsset, AnimationKey, AnimationSource, CachePolicy, FrameBuffer, PlayPolicy,
    PresentationSurface, PreviewRasterizer, Rasterizer,
};
pub use error::AssetOpenError;
