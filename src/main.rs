use anyhow::{Context, Result, bail};
use clap::Parser;
use crossbeam_channel::select;
use log::{debug, info, warn};
use std::path::Path;
use std::sync::Arc;

use lottie_player::cli::Args;
use lottie_player::config::PlayerSettings;
use lottie_player::core::DiskFrameStore;
use lottie_player::paths::{self, PathConfig};
use lottie_player::{
    AnimationAsset, AnimationKey, AnimationSource, CachePolicy, ChannelSurface, FrameBuffer,
    PlaybackContext, PlaybackState, PlayerSession, PreviewRasterizer,
};

fn init_logging(args: &Args) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .as_ref()
            .cloned()
            .unwrap_or_else(|| paths::config_file("lottie-player.log"));
        if let Some(parent) = log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating log directory {}", parent.display()))?;
        }
        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("creating log file {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Console logging, RUST_LOG wins if set
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

fn dump_frame(dir: &Path, frame: &FrameBuffer, seq: u64) -> Result<()> {
    let rgba = frame.to_rgba();
    let image = image::RgbaImage::from_raw(frame.width() as u32, frame.height() as u32, rgba)
        .context("frame buffer size does not match its dimensions")?;
    let path = dir.join(format!("frame_{:05}_{:04}.png", seq, frame.index()));
    image
        .save(&path)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    info!("Lottie player v{} starting...", env!("CARGO_PKG_VERSION"));
    debug!("Command-line args: {:?}", args);

    let settings_path = args
        .config
        .clone()
        .unwrap_or_else(|| paths::config_file("player.json"));
    let mut settings = PlayerSettings::load(&settings_path);
    info!("Settings: {}", settings_path.display());

    let path_config = PathConfig::from_env_and_cli(args.cache_dir.clone().or(settings.cache_dir.clone()));
    settings.cache_dir = Some(paths::frames_dir(&path_config));

    let source = std::fs::read(&args.file_path)
        .with_context(|| format!("reading {}", args.file_path.display()))?;
    let name = args
        .file_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "animation".to_string());

    let key = AnimationKey::new(AnimationSource::Bundle(name), args.width, args.height)
        .with_backing_scale(args.scale.max(1))
        .with_mirror(args.mirror);
    let cache_policy = if args.cache {
        CachePolicy::PersistTemporary(CachePolicy::CHAT_TTL)
    } else {
        CachePolicy::None
    };
    let asset = AnimationAsset::new(source, key)
        .with_cache_policy(cache_policy)
        .with_play_policy(args.play_policy())
        .with_max_fps(args.max_fps);

    if let (Some(ttl), Some(dir)) = (cache_policy.ttl(), settings.cache_dir.as_deref()) {
        let removed = DiskFrameStore::sweep_expired(dir, ttl);
        if removed > 0 {
            info!("Removed {} expired frame stores from {}", removed, dir.display());
        }
    }

    if let Some(dir) = &args.dump_dir {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    let ctx = PlaybackContext::new(settings);
    let (surface, frames) = ChannelSurface::unbounded();
    let session = PlayerSession::start(
        &ctx,
        asset,
        Arc::new(PreviewRasterizer::new()),
        Arc::new(surface),
    );
    let states = session.state_stream();

    let mut delivered: u64 = 0;
    loop {
        select! {
            recv(frames) -> frame => {
                let Ok(frame) = frame else { break };
                delivered += 1;
                if let Some(dir) = &args.dump_dir {
                    if let Err(e) = dump_frame(dir, &frame, delivered) {
                        warn!("Frame dump failed: {:#}", e);
                    }
                }
            }
            recv(states.receiver()) -> state => match state {
                Ok(PlaybackState::Failed) => {
                    bail!("cannot play {}", args.file_path.display());
                }
                Ok(PlaybackState::Stopped) => {
                    // Frames shown before the stop are already queued
                    for frame in frames.try_iter() {
                        delivered += 1;
                        if let Some(dir) = &args.dump_dir {
                            if let Err(e) = dump_frame(dir, &frame, delivered) {
                                warn!("Frame dump failed: {:#}", e);
                            }
                        }
                    }
                    break;
                }
                Ok(state) => debug!("Playback state: {:?}", state),
                Err(_) => break,
            },
        }
    }

    let stats = ctx.frame_cache().stats();
    println!(
        "{}: {} frames delivered (last {:?} of {:?}) at {} fps, cache hit rate {:.0}%",
        args.file_path.display(),
        delivered,
        session.current_frame(),
        session.total_frames(),
        session.fps().unwrap_or(0),
        stats.hit_rate() * 100.0
    );

    session.dispose();
    Ok(())
}
