//! Presentation adapters.
//!
//! Sessions call `display` from the state queue. These adapters hand the
//! frame to whichever thread actually presents it.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, unbounded};
use log::trace;

use crate::entities::{FrameBuffer, PresentationSurface};

/// Forwards frames over a channel; the UI thread drains the receiver.
pub struct ChannelSurface {
    tx: Sender<FrameBuffer>,
}

impl ChannelSurface {
    /// Every frame is queued until the receiver takes it.
    pub fn unbounded() -> (Self, Receiver<FrameBuffer>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    /// At most `capacity` frames wait; newer frames are dropped while the
    /// receiver lags behind.
    pub fn bounded(capacity: usize) -> (Self, Receiver<FrameBuffer>) {
        let (tx, rx) = bounded(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl PresentationSurface for ChannelSurface {
    fn display(&self, frame: FrameBuffer) {
        match self.tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                trace!("Presentation behind, dropped frame {}", frame.index());
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Presents frames through a closure.
pub struct FnSurface<F>
where
    F: Fn(FrameBuffer) + Send + Sync,
{
    f: F,
}

impl<F> FnSurface<F>
where
    F: Fn(FrameBuffer) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> PresentationSurface for FnSurface<F>
where
    F: Fn(FrameBuffer) + Send + Sync,
{
    fn display(&self, frame: FrameBuffer) {
        (self.f)(frame)
    }
}
