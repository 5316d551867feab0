use clap::Parser;
use std::path::PathBuf;

use crate::entities::PlayPolicy;

/// Lottie animation player
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Animation to play (Lottie JSON or gzipped .tgs)
    #[arg(value_name = "FILE")]
    pub file_path: PathBuf,

    /// Logical width in points
    #[arg(long = "width", value_name = "W", default_value_t = 256)]
    pub width: u32,

    /// Logical height in points
    #[arg(long = "height", value_name = "H", default_value_t = 256)]
    pub height: u32,

    /// Backing scale (pixels per point)
    #[arg(short = 's', long = "scale", value_name = "N", default_value_t = 1)]
    pub scale: u32,

    /// Frame rate cap
    #[arg(long = "max-fps", value_name = "FPS", default_value_t = 60)]
    pub max_fps: u32,

    /// Reflect frames horizontally
    #[arg(long = "mirror")]
    pub mirror: bool,

    /// Play the frame range once instead of looping
    #[arg(short = 'o', long = "once")]
    pub once: bool,

    /// Stop after this many complete loops
    #[arg(long = "loops", value_name = "N", conflicts_with_all = ["once", "frames"])]
    pub loops: Option<u32>,

    /// Stop after this many delivered frames
    #[arg(short = 'n', long = "frames", value_name = "N", conflicts_with = "once")]
    pub frames: Option<u32>,

    /// Play once from this frame to the end
    #[arg(long = "from", value_name = "FRAME", conflicts_with_all = ["once", "loops", "frames"])]
    pub from: Option<i32>,

    /// Write delivered frames as PNG into DIR
    #[arg(short = 'd', long = "dump", value_name = "DIR")]
    pub dump_dir: Option<PathBuf>,

    /// Persist decoded frames to the disk frame cache
    #[arg(long = "cache")]
    pub cache: bool,

    /// Disk frame cache directory (overrides LOTTIE_PLAYER_CACHE_DIR and platform default)
    #[arg(long = "cache-dir", value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Settings file (default: platform config dir)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable debug logging to file (default: lottie-player.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,
}

impl Args {
    /// Play policy selected by --once / --loops / --frames / --from
    pub fn play_policy(&self) -> PlayPolicy {
        if let Some(frame) = self.from {
            PlayPolicy::ToEnd(frame)
        } else if self.once {
            PlayPolicy::Once
        } else if let Some(n) = self.loops {
            PlayPolicy::PlayCount(n.max(1))
        } else if let Some(n) = self.frames {
            PlayPolicy::FramesCount(n.max(1))
        } else {
            PlayPolicy::Loop
        }
    }
}
