//! Error types for asset opening and the on-disk frame store.
//!
//! Only [`AssetOpenError`] ever reaches users, and only as
//! `PlaybackState::Failed`. Everything else is absorbed by the playback path
//! and shows up as stutter at worst.

use std::io;

use thiserror::Error;

/// Asset could not be opened by the rasterizer. Terminal for a session.
#[derive(Debug, Error)]
pub enum AssetOpenError {
    #[error("animation source is empty")]
    Empty,
    #[error("failed to decompress animation source: {0}")]
    Decompress(#[source] io::Error),
    #[error("animation source is not valid UTF-8")]
    NotUtf8,
    #[error("rasterizer rejected animation: {0}")]
    Rejected(String),
}

/// Disk frame store failures. Never propagated past the store's public API.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("lz4 decompress failed: {0}")]
    Lz4(#[from] lz4_flex::block::DecompressError),
    #[error("invalid frame store magic")]
    BadMagic,
    #[error("unsupported frame store version {0}")]
    Version(u16),
    #[error("frame store header does not match animation")]
    HeaderMismatch,
    #[error("frame store record truncated")]
    Truncated,
}
