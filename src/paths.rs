use std::path::PathBuf;

/// Environment variable overriding the frame cache directory
pub const CACHE_DIR_ENV: &str = "LOTTIE_PLAYER_CACHE_DIR";

/// Configuration for overriding default cache paths
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    /// Custom frame cache directory (from CLI or ENV)
    pub cache_dir: Option<PathBuf>,
}

impl PathConfig {
    /// Create PathConfig from CLI arguments and environment variables
    ///
    /// Priority: CLI args → ENV var (LOTTIE_PLAYER_CACHE_DIR) → None (use defaults)
    pub fn from_env_and_cli(cli_dir: Option<PathBuf>) -> Self {
        let cache_dir = cli_dir.or_else(|| std::env::var(CACHE_DIR_ENV).ok().map(PathBuf::from));

        Self { cache_dir }
    }
}

/// Get the directory holding disk frame stores
///
/// Priority:
/// 1. CLI --cache-dir argument
/// 2. LOTTIE_PLAYER_CACHE_DIR environment variable
/// 3. Platform-specific cache directory from dirs-next (default)
///
/// Platform paths:
/// - Linux: ~/.cache/lottie-player/frames
/// - macOS: ~/Library/Caches/lottie-player/frames
/// - Windows: %LOCALAPPDATA%\lottie-player\frames
pub fn frames_dir(config: &PathConfig) -> PathBuf {
    if let Some(dir) = &config.cache_dir {
        return dir.clone();
    }

    if let Some(dir) = dirs_next::cache_dir() {
        return dir.join("lottie-player").join("frames");
    }

    // Fallback: local folder if the platform has no cache dir
    PathBuf::from("lottie-player").join("frames")
}

/// Get path to a configuration file (settings, logs)
///
/// Platform paths:
/// - Linux: ~/.config/lottie-player/{name}
/// - macOS: ~/Library/Application Support/lottie-player/{name}
/// - Windows: %APPDATA%\lottie-player\{name}
pub fn config_file(name: &str) -> PathBuf {
    dirs_next::config_dir()
        .map(|dir| dir.join("lottie-player"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(name)
}
