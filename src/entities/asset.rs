//! Animation asset description: source bytes, decoded identity, cache and play policy.
//!
//! **Why**: Decoded pixels depend on the target size and backing scale, so the
//! key that identifies shared/persisted frames must carry both. Assets are
//! immutable; resizing produces a new asset with a derived key.
//!
//! **Used by**: PlayerSession (start/update_resolution), DecodeWorker (raster size),
//! DiskFrameStore (file naming, expiry)

use std::fmt;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};

use crate::entities::frame::bytes_per_row;
use crate::error::AssetOpenError;

/// Ceiling for decompressed Lottie JSON (8 MiB).
pub const MAX_DECOMPRESSED_SIZE: u64 = 8 * 1024 * 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Underlying media identity, independent of render size.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnimationSource {
    /// Downloaded media addressed by namespace + id
    Media { namespace: i32, id: i64 },
    /// Asset shipped with the application
    Bundle(String),
}

/// Stable identity of one decoded animation at a specific size/backing scale.
///
/// Distinct sizes yield distinct keys and therefore independent caches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnimationKey {
    pub source: AnimationSource,
    /// Logical width in points
    pub width: u32,
    /// Logical height in points
    pub height: u32,
    /// Resolution multiplier used for rasterization
    pub backing_scale: u32,
    /// Frames are reflected horizontally after rasterization
    pub mirror: bool,
}

impl AnimationKey {
    pub fn new(source: AnimationSource, width: u32, height: u32) -> Self {
        Self {
            source,
            width,
            height,
            backing_scale: 1,
            mirror: false,
        }
    }

    pub fn with_backing_scale(&self, backing_scale: u32) -> Self {
        Self {
            backing_scale: backing_scale.max(1),
            ..self.clone()
        }
    }

    pub fn with_size(&self, width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..self.clone()
        }
    }

    pub fn with_mirror(&self, mirror: bool) -> Self {
        Self {
            mirror,
            ..self.clone()
        }
    }

    /// Rasterized width in pixels
    pub fn pixel_width(&self) -> usize {
        self.width as usize * self.backing_scale as usize
    }

    /// Rasterized height in pixels
    pub fn pixel_height(&self) -> usize {
        self.height as usize * self.backing_scale as usize
    }

    /// File-system safe name, stable across runs. Used for disk store files.
    pub fn cache_name(&self) -> String {
        let source = match &self.source {
            AnimationSource::Media { namespace, id } => format!("{}-{}", namespace, id),
            AnimationSource::Bundle(name) => name
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
                .collect(),
        };
        let mirror = if self.mirror { "-mirror" } else { "" };
        format!(
            "animation-{}-{}x{}@{}{}",
            source, self.width, self.height, self.backing_scale, mirror
        )
    }
}

impl fmt::Display for AnimationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cache_name())
    }
}

/// Disk persistence policy for decoded frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CachePolicy {
    /// Decoded frames live only in memory
    #[default]
    None,
    /// Frames are persisted and considered valid for the given duration
    PersistTemporary(Duration),
}

impl CachePolicy {
    /// One hour, for inline chat animations
    pub const CHAT_TTL: Duration = Duration::from_secs(3_600);
    /// Three days, for thumbnails
    pub const THUMB_TTL: Duration = Duration::from_secs(259_200);
    /// Effect animations
    pub const EFFECT_TTL: Duration = Duration::from_secs(241_920);

    pub fn ttl(&self) -> Option<Duration> {
        match self {
            CachePolicy::None => None,
            CachePolicy::PersistTemporary(ttl) => Some(*ttl),
        }
    }
}

/// When playback stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlayPolicy {
    /// Wrap to the start frame forever
    #[default]
    Loop,
    /// Play the range once, settle on the last frame
    Once,
    /// Stop after this many complete loops
    PlayCount(u32),
    /// Stop after this many delivered frames
    FramesCount(u32),
    /// Stop on the first delivered frame at or past this index
    OnceToFrame(i32),
    /// Loop over `range` (`[start, end)`), entering it at `first_start`
    LoopAt { first_start: Option<i32>, range: (i32, i32) },
    /// Play once from this frame to the end
    ToEnd(i32),
}

impl PlayPolicy {
    /// True when playback never stops on its own
    pub fn loops_forever(&self) -> bool {
        matches!(self, PlayPolicy::Loop | PlayPolicy::LoopAt { .. })
    }
}

/// Compressed animation plus everything needed to decode and present it.
///
/// Immutable once constructed. Cloning is cheap (source bytes are shared).
#[derive(Clone)]
pub struct AnimationAsset {
    source: Arc<[u8]>,
    key: AnimationKey,
    cache: CachePolicy,
    play_policy: PlayPolicy,
    max_fps: u32,
}

impl fmt::Debug for AnimationAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnimationAsset")
            .field("key", &self.key)
            .field("source_len", &self.source.len())
            .field("cache", &self.cache)
            .field("play_policy", &self.play_policy)
            .field("max_fps", &self.max_fps)
            .finish()
    }
}

impl AnimationAsset {
    /// Create asset with defaults: no disk cache, looping, 60 fps cap.
    pub fn new(source: impl Into<Arc<[u8]>>, key: AnimationKey) -> Self {
        Self {
            source: source.into(),
            key,
            cache: CachePolicy::None,
            play_policy: PlayPolicy::Loop,
            max_fps: 60,
        }
    }

    pub fn with_cache_policy(mut self, cache: CachePolicy) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_play_policy(mut self, play_policy: PlayPolicy) -> Self {
        self.play_policy = play_policy;
        self
    }

    pub fn with_max_fps(mut self, max_fps: u32) -> Self {
        self.max_fps = max_fps.max(1);
        self
    }

    /// New asset for a different backing scale. Source bytes are shared.
    pub fn with_backing_scale(&self, backing_scale: u32) -> Self {
        Self {
            key: self.key.with_backing_scale(backing_scale),
            ..self.clone()
        }
    }

    /// New asset for a different logical size. Source bytes are shared.
    pub fn with_size(&self, width: u32, height: u32) -> Self {
        Self {
            key: self.key.with_size(width, height),
            ..self.clone()
        }
    }

    pub fn source(&self) -> &[u8] {
        &self.source
    }

    pub fn key(&self) -> &AnimationKey {
        &self.key
    }

    pub fn cache_policy(&self) -> CachePolicy {
        self.cache
    }

    pub fn play_policy(&self) -> PlayPolicy {
        self.play_policy
    }

    pub fn max_fps(&self) -> u32 {
        self.max_fps
    }

    /// Size in bytes of one rasterized frame (rows padded to 32 bytes).
    pub fn frame_buffer_len(&self) -> usize {
        self.key.pixel_height() * bytes_per_row(self.key.pixel_width())
    }

    /// Source bytes with gzip container removed (`.tgs` stickers are gzip'd JSON).
    ///
    /// Non-gzip data is returned as-is. Gzip data that fails to inflate is an error.
    pub fn decompressed(&self) -> Result<Vec<u8>, AssetOpenError> {
        if self.source.is_empty() {
            return Err(AssetOpenError::Empty);
        }
        if !self.source.starts_with(&GZIP_MAGIC) {
            return Ok(self.source.to_vec());
        }

        let mut out = Vec::new();
        GzDecoder::new(&self.source[..])
            .take(MAX_DECOMPRESSED_SIZE)
            .read_to_end(&mut out)
            .map_err(AssetOpenError::Decompress)?;
        if out.is_empty() {
            return Err(AssetOpenError::Empty);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn key() -> AnimationKey {
        AnimationKey::new(AnimationSource::Media { namespace: 1, id: 42 }, 100, 50)
    }

    #[test]
    fn test_derived_key_differs_by_scale() {
        let asset = AnimationAsset::new(b"{}".to_vec(), key());
        let scaled = asset.with_backing_scale(2);

        assert_ne!(asset.key(), scaled.key());
        assert_eq!(asset.key().backing_scale, 1);
        assert_eq!(scaled.key().pixel_width(), 200);
        assert_eq!(scaled.key().pixel_height(), 100);
        assert_eq!(scaled.source(), asset.source());
    }

    #[test]
    fn test_resized_asset_gets_new_key() {
        let asset = AnimationAsset::new(b"{}".to_vec(), key()).with_play_policy(PlayPolicy::Once);
        let resized = asset.with_size(40, 40);

        assert_ne!(asset.key(), resized.key());
        assert_eq!((resized.key().width, resized.key().height), (40, 40));
        assert_eq!(resized.key().source, asset.key().source);
        assert_eq!(resized.play_policy(), PlayPolicy::Once);
        assert_eq!(asset.key().width, 100);
    }

    #[test]
    fn test_cache_name_is_fs_safe() {
        let k = AnimationKey::new(AnimationSource::Bundle("intro/logo.json".into()), 64, 64)
            .with_backing_scale(2)
            .with_mirror(true);
        assert_eq!(k.cache_name(), "animation-intro_logo_json-64x64@2-mirror");
        assert_eq!(key().cache_name(), "animation-1-42-100x50@1");
    }

    #[test]
    fn test_decompress_gzip_and_raw() {
        let json = br#"{"fr":30,"ip":0,"op":30,"w":10,"h":10}"#;
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(json).unwrap();
        let gz = enc.finish().unwrap();

        let gz_asset = AnimationAsset::new(gz, key());
        assert_eq!(gz_asset.decompressed().unwrap(), json.to_vec());

        let raw_asset = AnimationAsset::new(json.to_vec(), key());
        assert_eq!(raw_asset.decompressed().unwrap(), json.to_vec());
    }

    #[test]
    fn test_decompress_rejects_empty_and_corrupt() {
        let empty = AnimationAsset::new(Vec::new(), key());
        assert!(matches!(empty.decompressed(), Err(AssetOpenError::Empty)));

        let corrupt = AnimationAsset::new(vec![0x1f, 0x8b, 0x08, 0xff, 0x00], key());
        assert!(matches!(corrupt.decompressed(), Err(AssetOpenError::Decompress(_))));
    }

    #[test]
    fn test_frame_buffer_len_padded() {
        // 100px * 4 bytes = 400, padded to 416
        let asset = AnimationAsset::new(b"{}".to_vec(), key());
        assert_eq!(asset.frame_buffer_len(), 50 * 416);
    }
}
