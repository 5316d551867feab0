//! Player settings, persisted as JSON.
//!
//! Missing fields take their defaults (`#[serde(default)]`), so settings files
//! written by older versions keep loading.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::disk_store::DEFAULT_FRAME_CEILING;
use crate::core::window::DEFAULT_CAPACITY;

/// Decode threads used when `decode_workers` is 0 (auto)
pub const AUTO_DECODE_WORKERS: usize = 4;

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerSettings {
    // Decode pool
    pub decode_workers: usize, // 0 = auto, N = override (applies on context creation)

    // Playback
    pub window_capacity: usize, // Frames decoded ahead of presentation (default 4)
    pub fps_floor: u32,         // Minimum tick rate (default 24)
    pub max_refresh_rate: u32,  // Display refresh rate limit (default 60)

    // Disk cache
    pub disk_frame_ceiling: u32, // Frames past this index are never persisted (default 180)
    pub cache_dir: Option<PathBuf>, // None = resolved by PathConfig
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            decode_workers: 0,
            window_capacity: DEFAULT_CAPACITY,
            fps_floor: 24,
            max_refresh_rate: 60,
            disk_frame_ceiling: DEFAULT_FRAME_CEILING,
            cache_dir: None,
        }
    }
}

impl PlayerSettings {
    /// Decode pool size: override, or auto bounded by the CPU count.
    pub fn resolved_decode_workers(&self) -> usize {
        if self.decode_workers > 0 {
            return self.decode_workers;
        }
        AUTO_DECODE_WORKERS.min(num_cpus::get()).max(1)
    }

    /// Load settings from JSON; defaults if the file is missing or invalid.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        let json = match fs::read_to_string(path) {
            Ok(json) => json,
            Err(e) => {
                debug!("No settings at {} ({}), using defaults", path.display(), e);
                return Self::default();
            }
        };
        match serde_json::from_str(&json) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Invalid settings file {}: {}, using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    /// Save settings as pretty JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let s = PlayerSettings::default();
        assert_eq!(s.window_capacity, 4);
        assert_eq!(s.fps_floor, 24);
        assert_eq!(s.disk_frame_ceiling, 180);
        let workers = s.resolved_decode_workers();
        assert!((1..=AUTO_DECODE_WORKERS).contains(&workers));
    }

    #[test]
    fn test_worker_override() {
        let s = PlayerSettings {
            decode_workers: 7,
            ..Default::default()
        };
        assert_eq!(s.resolved_decode_workers(), 7);
    }

    #[test]
    fn test_save_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("player.json");
        let s = PlayerSettings {
            window_capacity: 6,
            cache_dir: Some(PathBuf::from("/tmp/frames")),
            ..Default::default()
        };
        s.save(&path).unwrap();
        assert_eq!(PlayerSettings::load(&path), s);
    }

    #[test]
    fn test_partial_and_invalid_files() {
        let dir = TempDir::new().unwrap();
        let partial = dir.path().join("partial.json");
        fs::write(&partial, r#"{"fps_floor": 12}"#).unwrap();
        let s = PlayerSettings::load(&partial);
        assert_eq!(s.fps_floor, 12);
        assert_eq!(s.window_capacity, 4);

        let invalid = dir.path().join("invalid.json");
        fs::write(&invalid, "{not json").unwrap();
        assert_eq!(PlayerSettings::load(&invalid), PlayerSettings::default());
        assert_eq!(PlayerSettings::load(dir.path().join("missing.json")), PlayerSettings::default());
    }
}
