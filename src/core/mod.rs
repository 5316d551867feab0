//! Playback engine: decode pool, frame window, caches, clock, sessions.
//!
//! Independent of any UI. Hosts provide a `Rasterizer` and a
//! `PresentationSurface` and drive everything through `PlayerSession`.

pub mod clock;
pub mod context;
pub mod decode;
pub mod disk_store;
pub mod frame_cache;
pub mod player;
pub mod state_queue;
pub mod surface;
pub mod window;
pub mod workers;

// Re-exports for convenience
pub use clock::{ClockToken, FpsLoops};
pub use context::PlaybackContext;
pub use decode::{FrameProducer, Pipeline, RefillReport};
pub use disk_store::{DiskFrameStore, StoreHeader};
pub use frame_cache::{CacheStats, SharedFrameCache};
pub use player::{PlaybackState, PlayerSession, StateStream};
pub use state_queue::StateQueue;
pub use surface::{ChannelSurface, FnSurface};
pub use window::{CommitOutcome, Delivery, PlaybackWindow, RefillGate, Reservation};
pub use workers::Workers;
