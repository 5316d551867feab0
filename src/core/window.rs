//! Bounded frame window: decoded-but-not-yet-displayed frames of one session.
//!
//! **Why**: Decode runs ahead of presentation by at most `capacity` frames.
//! That bound is the backpressure between the decode pool (producer) and the
//! clock (consumer), and it caps how long shared frames stay alive.
//!
//! **Used by**: FrameProducer refill units (reserve/commit), PlayerSession ticks
//! (take_one, hungry check)
//!
//! # Protocol
//!
//! The window is always accessed under its session's lock, but the lock is
//! never held while a frame is decoded:
//!
//! ```text
//! lock  -> reserve()          cursor index + delta base
//! unlock-> produce frame      cache / disk / rasterize
//! lock  -> commit() | fail()  append + advance cursor
//! ```
//!
//! A reservation carries the window generation. Restart, jump and cancel bump
//! it, so a unit that was mid-decode during one of those cannot append a stale
//! frame.

use log::{debug, trace};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::entities::{FrameBuffer, PlayPolicy};

/// Frames held ahead of presentation
pub const DEFAULT_CAPACITY: usize = 4;

/// Permission to produce one frame at `index`.
#[derive(Debug)]
pub struct Reservation {
    pub index: i32,
    /// Frame this one follows in the window (delta base for the disk store)
    pub base: Option<FrameBuffer>,
    generation: u64,
}

/// Result of handing a produced frame (or a failure) back to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Appended, cursor advanced
    Stored,
    /// Appended (or failed) and the cursor wrapped to the start frame
    Wrapped,
    /// Producer reached the end of a non-looping range
    Exhausted,
    /// Window changed since the reservation; frame dropped
    Discarded,
}

/// Frame popped for presentation.
#[derive(Debug)]
pub struct Delivery {
    pub frame: FrameBuffer,
    /// Play policy is satisfied with this frame; playback stops
    pub completes: bool,
}

pub struct PlaybackWindow {
    start: i32,
    end: i32,
    step: i32,
    capacity: usize,
    policy: PlayPolicy,

    cursor: i32,
    queue: VecDeque<FrameBuffer>,
    previous: Option<FrameBuffer>,
    generation: u64,

    cancelled: bool,
    exhausted: bool,
    stopped: bool,

    delivered: u32,
    loops_completed: u32,
}

impl PlaybackWindow {
    /// Window over `[start, end)` advancing `step` source frames per produced frame.
    pub fn new(start: i32, end: i32, step: i32, capacity: usize, policy: PlayPolicy) -> Self {
        Self {
            start,
            end: end.max(start + 1),
            step: step.max(1),
            capacity: capacity.max(2),
            policy,
            cursor: start,
            queue: VecDeque::with_capacity(capacity),
            previous: None,
            generation: 0,
            cancelled: false,
            exhausted: false,
            stopped: false,
            delivered: 0,
            loops_completed: 0,
        }
    }

    /// Window for `policy` over the animation's `[start, end)`.
    ///
    /// `LoopAt` narrows the window to its range and may enter it at an earlier
    /// frame (an intro played once). `ToEnd` starts at its frame.
    pub fn for_policy(start: i32, end: i32, step: i32, capacity: usize, policy: PlayPolicy) -> Self {
        let end = end.max(start + 1);
        match policy {
            PlayPolicy::LoopAt { first_start, range: (from, to) } => {
                let lo = from.clamp(start, end - 1);
                let hi = to.clamp(lo + 1, end);
                let mut window = Self::new(lo, hi, step, capacity, policy);
                window.cursor = first_start.map_or(lo, |f| f.clamp(start, hi - 1));
                window
            }
            PlayPolicy::ToEnd(from) => {
                Self::new(from.clamp(start, end - 1), end, step, capacity, policy)
            }
            _ => Self::new(start, end, step, capacity, policy),
        }
    }

    // ========================================================================
    // Producer side
    // ========================================================================

    /// Claim the next cursor position, or None when nothing should be produced.
    ///
    /// The base is only set when it is the cursor's stepped predecessor; after
    /// a jump or at the start frame there is none.
    pub fn reserve(&self) -> Option<Reservation> {
        if self.cancelled || self.stopped || self.exhausted || self.queue.len() >= self.capacity {
            return None;
        }
        let base = if self.cursor == self.start {
            None
        } else {
            self.queue
                .back()
                .or(self.previous.as_ref())
                .filter(|f| f.index() == self.cursor - self.step)
                .cloned()
        };
        Some(Reservation {
            index: self.cursor,
            base,
            generation: self.generation,
        })
    }

    /// Append a produced frame and advance the cursor.
    pub fn commit(&mut self, reservation: Reservation, frame: FrameBuffer) -> CommitOutcome {
        if !self.accepts(&reservation) || self.queue.len() >= self.capacity {
            trace!("Window discarded frame {}", frame.index());
            return CommitOutcome::Discarded;
        }
        self.queue.push_back(frame);

        let next = reservation.index + self.step;
        if next < self.end {
            self.cursor = next;
            CommitOutcome::Stored
        } else {
            self.wrap_or_exhaust()
        }
    }

    /// The producer got no frame for the reservation (end of stream).
    ///
    /// Wraps to the start frame; a failure at the start frame itself means
    /// nothing can be produced and the window is exhausted.
    pub fn fail(&mut self, reservation: Reservation) -> CommitOutcome {
        if !self.accepts(&reservation) {
            return CommitOutcome::Discarded;
        }
        debug!("No frame for index {}, treating as end of stream", reservation.index);
        if reservation.index == self.start {
            self.exhausted = true;
            return CommitOutcome::Exhausted;
        }
        self.wrap_or_exhaust()
    }

    fn accepts(&self, reservation: &Reservation) -> bool {
        !self.cancelled
            && !self.stopped
            && reservation.generation == self.generation
            && reservation.index == self.cursor
    }

    fn wrap_or_exhaust(&mut self) -> CommitOutcome {
        if matches!(self.policy, PlayPolicy::Once | PlayPolicy::ToEnd(_)) {
            self.exhausted = true;
            CommitOutcome::Exhausted
        } else {
            self.cursor = self.start;
            CommitOutcome::Wrapped
        }
    }

    // ========================================================================
    // Consumer side
    // ========================================================================

    /// Pop the oldest frame (FIFO) and evaluate the play policy.
    pub fn take_one(&mut self) -> Option<Delivery> {
        if self.cancelled || self.stopped {
            return None;
        }
        let frame = self.queue.pop_front()?;
        let index = frame.index();
        self.delivered += 1;

        let last_of_loop = index + self.step >= self.end;
        if last_of_loop {
            self.loops_completed += 1;
        }

        let completes = match self.policy {
            PlayPolicy::Loop | PlayPolicy::LoopAt { .. } => false,
            PlayPolicy::Once | PlayPolicy::ToEnd(_) => last_of_loop,
            PlayPolicy::PlayCount(n) => last_of_loop && self.loops_completed >= n.max(1),
            PlayPolicy::FramesCount(n) => self.delivered >= n.max(1),
            PlayPolicy::OnceToFrame(target) => index >= target || last_of_loop,
        };

        self.previous = Some(frame.clone());
        if completes {
            self.stopped = true;
            // Frames decoded past the stop point are never shown
            self.queue.clear();
            debug!("Window complete at frame {} ({:?})", index, self.policy);
        }
        Some(Delivery { frame, completes })
    }

    /// Fewer than `capacity - 1` frames are queued and more can be produced.
    pub fn is_hungry(&self) -> bool {
        !self.cancelled
            && !self.stopped
            && !self.exhausted
            && self.queue.len() < self.capacity - 1
    }

    /// Producer is done and every produced frame has been taken.
    pub fn is_drained(&self) -> bool {
        self.exhausted && self.queue.is_empty()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Stop accepting frames and release queued ones. Irreversible.
    pub fn cancel(&mut self) {
        self.cancelled = true;
        self.generation += 1;
        self.queue.clear();
    }

    /// Rewind to the start frame for another pass (replay). A `LoopAt` intro
    /// is not replayed.
    pub fn restart(&mut self) {
        self.generation += 1;
        self.queue.clear();
        self.cursor = self.start;
        self.exhausted = false;
        self.stopped = false;
        self.delivered = 0;
        self.loops_completed = 0;
    }

    /// Move the decode cursor. Already queued frames still play first.
    pub fn jump_to(&mut self, frame: i32) {
        let frame = frame.clamp(self.start, self.end - 1);
        self.generation += 1;
        self.cursor = frame;
        self.exhausted = false;
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Next index the producer will decode
    pub fn cursor(&self) -> i32 {
        self.cursor
    }

    pub fn start_frame(&self) -> i32 {
        self.start
    }

    pub fn end_frame(&self) -> i32 {
        self.end
    }

    pub fn step(&self) -> i32 {
        self.step
    }

    pub fn policy(&self) -> PlayPolicy {
        self.policy
    }

    /// Most recently taken frame (stays displayed after a stop)
    pub fn previous_frame(&self) -> Option<&FrameBuffer> {
        self.previous.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

/// Single-flight guard: at most one refill unit per session is outstanding.
#[derive(Debug, Default)]
pub struct RefillGate {
    busy: AtomicBool,
}

impl RefillGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the caller now owns the gate and must release it when done.
    pub fn try_acquire(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{AnimationKey, AnimationSource, bytes_per_row};

    fn key() -> AnimationKey {
        AnimationKey::new(AnimationSource::Bundle("window".into()), 2, 2)
    }

    fn frame(index: i32) -> FrameBuffer {
        FrameBuffer::new(key(), index, vec![0u8; bytes_per_row(2) * 2]).unwrap()
    }

    /// Produce until the window refuses, like one refill unit.
    fn fill(window: &mut PlaybackWindow) -> Vec<CommitOutcome> {
        let mut outcomes = Vec::new();
        while let Some(r) = window.reserve() {
            let index = r.index;
            outcomes.push(window.commit(r, frame(index)));
        }
        outcomes
    }

    fn drain(window: &mut PlaybackWindow) -> Vec<(i32, bool)> {
        let mut out = Vec::new();
        while let Some(d) = window.take_one() {
            out.push((d.frame.index(), d.completes));
        }
        out
    }

    #[test]
    fn test_fills_to_capacity_in_order() {
        let mut w = PlaybackWindow::new(0, 10, 1, 4, PlayPolicy::Loop);
        fill(&mut w);
        assert_eq!(w.len(), 4);
        assert!(w.reserve().is_none());
        assert_eq!(w.cursor(), 4);
        assert_eq!(drain(&mut w).iter().map(|d| d.0).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_hungry_threshold() {
        let mut w = PlaybackWindow::new(0, 10, 1, 4, PlayPolicy::Loop);
        assert!(w.is_hungry());
        fill(&mut w);
        assert!(!w.is_hungry());
        w.take_one();
        assert!(!w.is_hungry()); // 3 queued
        w.take_one();
        assert!(w.is_hungry()); // 2 queued
    }

    #[test]
    fn test_loop_wraps_at_end() {
        let mut w = PlaybackWindow::new(0, 6, 1, 4, PlayPolicy::Loop);
        let mut seen = Vec::new();
        for _ in 0..4 {
            fill(&mut w);
            seen.extend(drain(&mut w).into_iter().map(|d| d.0));
        }
        assert_eq!(&seen[..10], &[0, 1, 2, 3, 4, 5, 0, 1, 2, 3]);
        assert!(seen.iter().all(|i| (0..6).contains(i)));
    }

    #[test]
    fn test_wrap_reported_once_per_loop() {
        let mut w = PlaybackWindow::new(0, 3, 1, 4, PlayPolicy::Loop);
        let outcomes = fill(&mut w);
        assert_eq!(
            outcomes,
            vec![
                CommitOutcome::Stored,
                CommitOutcome::Stored,
                CommitOutcome::Wrapped,
                CommitOutcome::Stored
            ]
        );
    }

    #[test]
    fn test_once_stops_at_last_frame() {
        let mut w = PlaybackWindow::new(0, 30, 1, 4, PlayPolicy::Once);
        let mut seen = Vec::new();
        while !w.is_stopped() {
            fill(&mut w);
            seen.extend(drain(&mut w));
        }
        let indices: Vec<i32> = seen.iter().map(|d| d.0).collect();
        assert_eq!(indices, (0..30).collect::<Vec<_>>());
        assert_eq!(seen.last(), Some(&(29, true)));
        assert!(seen[..29].iter().all(|d| !d.1));
        assert_eq!(w.previous_frame().map(FrameBuffer::index), Some(29));
        assert!(w.reserve().is_none());
    }

    #[test]
    fn test_restart_replays_from_start() {
        let mut w = PlaybackWindow::new(0, 5, 1, 4, PlayPolicy::Once);
        while !w.is_stopped() {
            fill(&mut w);
            drain(&mut w);
        }
        w.restart();
        let mut seen = Vec::new();
        while !w.is_stopped() {
            fill(&mut w);
            seen.extend(drain(&mut w).into_iter().map(|d| d.0));
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_step_skips_source_frames() {
        let mut w = PlaybackWindow::new(0, 10, 3, 4, PlayPolicy::Once);
        let mut seen = Vec::new();
        while !w.is_stopped() {
            fill(&mut w);
            seen.extend(drain(&mut w));
        }
        assert_eq!(seen, vec![(0, false), (3, false), (6, false), (9, true)]);
    }

    #[test]
    fn test_stale_reservation_discarded() {
        let mut w = PlaybackWindow::new(0, 10, 1, 4, PlayPolicy::Loop);
        let r = w.reserve().unwrap();
        w.jump_to(5);
        assert_eq!(w.commit(r, frame(0)), CommitOutcome::Discarded);
        assert!(w.is_empty());

        let r = w.reserve().unwrap();
        assert_eq!(r.index, 5);
        w.cancel();
        assert_eq!(w.commit(r, frame(5)), CommitOutcome::Discarded);
        assert!(w.reserve().is_none());
        assert!(w.take_one().is_none());
    }

    #[test]
    fn test_failure_wraps_or_exhausts() {
        let mut w = PlaybackWindow::new(0, 10, 1, 4, PlayPolicy::Loop);
        let r = w.reserve().unwrap();
        w.commit(r, frame(0));
        let r = w.reserve().unwrap();
        assert_eq!(w.fail(r), CommitOutcome::Wrapped);
        assert_eq!(w.cursor(), 0);

        let r = w.reserve().unwrap();
        assert_eq!(w.fail(r), CommitOutcome::Exhausted);
        assert!(w.reserve().is_none());
        w.take_one();
        assert!(w.is_drained());
    }

    #[test]
    fn test_delta_base_follows_queue() {
        let mut w = PlaybackWindow::new(0, 10, 1, 4, PlayPolicy::Loop);
        let r = w.reserve().unwrap();
        assert!(r.base.is_none());
        w.commit(r, frame(0));

        let r = w.reserve().unwrap();
        assert_eq!(r.base.as_ref().map(FrameBuffer::index), Some(0));
        w.commit(r, frame(1));

        w.take_one();
        w.take_one();
        // Queue empty: base falls back to the last taken frame
        let r = w.reserve().unwrap();
        assert_eq!(r.base.as_ref().map(FrameBuffer::index), Some(1));
    }

    #[test]
    fn test_frames_count_and_play_count() {
        let mut w = PlaybackWindow::new(0, 3, 1, 4, PlayPolicy::FramesCount(5));
        let mut seen = Vec::new();
        while !w.is_stopped() {
            fill(&mut w);
            seen.extend(drain(&mut w).into_iter().map(|d| d.0));
        }
        assert_eq!(seen, vec![0, 1, 2, 0, 1]);

        let mut w = PlaybackWindow::new(0, 3, 1, 4, PlayPolicy::PlayCount(2));
        let mut seen = Vec::new();
        while !w.is_stopped() {
            fill(&mut w);
            seen.extend(drain(&mut w).into_iter().map(|d| d.0));
        }
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_once_to_frame() {
        let mut w = PlaybackWindow::new(0, 30, 1, 4, PlayPolicy::OnceToFrame(6));
        let mut seen = Vec::new();
        while !w.is_stopped() {
            fill(&mut w);
            seen.extend(drain(&mut w).into_iter().map(|d| d.0));
        }
        assert_eq!(seen, (0..=6).collect::<Vec<_>>());
    }

    #[test]
    fn test_jump_drops_delta_base() {
        let mut w = PlaybackWindow::new(0, 10, 1, 4, PlayPolicy::Loop);
        fill(&mut w);
        w.jump_to(7);
        w.take_one();

        // Queue tail is frame 3, not the predecessor of 7
        let r = w.reserve().unwrap();
        assert_eq!(r.index, 7);
        assert!(r.base.is_none());
        w.commit(r, frame(7));
        w.take_one();

        let r = w.reserve().unwrap();
        assert_eq!(r.base.as_ref().map(FrameBuffer::index), Some(7));
    }

    #[test]
    fn test_loop_at_enters_then_loops_range() {
        let policy = PlayPolicy::LoopAt { first_start: Some(1), range: (6, 9) };
        let mut w = PlaybackWindow::for_policy(0, 10, 1, 4, policy);
        assert_eq!((w.start_frame(), w.end_frame(), w.cursor()), (6, 9, 1));

        let mut seen = Vec::new();
        while seen.len() < 12 {
            fill(&mut w);
            seen.extend(drain(&mut w));
        }
        seen.truncate(12);
        let indices: Vec<i32> = seen.iter().map(|d| d.0).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5, 6, 7, 8, 6, 7, 8, 6]);
        assert!(seen.iter().all(|d| !d.1));

        let w = PlaybackWindow::for_policy(
            0,
            10,
            1,
            4,
            PlayPolicy::LoopAt { first_start: None, range: (-5, 50) },
        );
        assert_eq!((w.start_frame(), w.end_frame(), w.cursor()), (0, 10, 0));
    }

    #[test]
    fn test_to_end_plays_tail_once() {
        let mut w = PlaybackWindow::for_policy(0, 10, 1, 4, PlayPolicy::ToEnd(7));
        let mut seen = Vec::new();
        while !w.is_stopped() {
            fill(&mut w);
            seen.extend(drain(&mut w));
        }
        assert_eq!(seen, vec![(7, false), (8, false), (9, true)]);

        // Past the end clamps to the last frame
        let mut w = PlaybackWindow::for_policy(0, 10, 1, 4, PlayPolicy::ToEnd(40));
        fill(&mut w);
        assert_eq!(drain(&mut w), vec![(9, true)]);

        w.restart();
        assert_eq!(w.cursor(), 9);
    }

    #[test]
    fn test_refill_gate_single_flight() {
        let gate = RefillGate::new();
        assert!(gate.try_acquire());
        assert!(!gate.try_acquire());
        assert!(gate.is_busy());
        gate.release();
        assert!(gate.try_acquire());
    }
}
