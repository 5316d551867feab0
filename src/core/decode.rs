//! Decode units: produce frames for a session's window on the decode pool.
//!
//! **Why**: Rasterization and disk I/O may block for milliseconds. They run
//! on `Workers`, never on the state queue or the presentation thread.
//!
//! **Used by**: PlayerSession (schedules `Pipeline::run_refill` when the window
//! is hungry)
//!
//! # Frame Sources
//!
//! In priority order:
//! 1. `SharedFrameCache` - another live session already decoded it
//! 2. `DiskFrameStore` - persisted by an earlier session, delta base matches
//!    (store-only sessions decode along the chain when it does not)
//! 3. Rasterizer - fresh decode, then registered in the cache and persisted
//!
//! # Teardown
//!
//! A running unit holds an `Arc<Pipeline>`. When the session is disposed
//! mid-unit, the unit's completion drops the last reference and releases the
//! decoder, store and window.

use log::{debug, trace};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::disk_store::DiskFrameStore;
use super::frame_cache::SharedFrameCache;
use super::window::{CommitOutcome, PlaybackWindow, RefillGate};
use crate::entities::frame::mirror_rows;
use crate::entities::{AnimationKey, DecoderHandle, FrameBuffer};

/// Produces single frames for one animation key.
pub struct FrameProducer {
    key: AnimationKey,
    /// None when playing purely from a finished disk store
    decoder: Option<Mutex<Box<dyn DecoderHandle>>>,
    store: Option<Arc<DiskFrameStore>>,
    cache: SharedFrameCache,
    end_bound: i32,
}

impl FrameProducer {
    pub fn new(
        key: AnimationKey,
        decoder: Option<Box<dyn DecoderHandle>>,
        store: Option<Arc<DiskFrameStore>>,
        cache: SharedFrameCache,
        end_bound: i32,
    ) -> Self {
        Self {
            key,
            decoder: decoder.map(Mutex::new),
            store,
            cache,
            end_bound,
        }
    }

    pub fn key(&self) -> &AnimationKey {
        &self.key
    }

    pub fn store(&self) -> Option<&Arc<DiskFrameStore>> {
        self.store.as_ref()
    }

    /// Frames come only from the disk store
    pub fn is_disk_only(&self) -> bool {
        self.decoder.is_none()
    }

    /// Frame `index`, following `base` in the window. None is end of stream.
    pub fn produce(&self, index: i32, base: Option<&FrameBuffer>) -> Option<FrameBuffer> {
        if let Some(frame) = self.cache.lookup(&self.key, index) {
            return Some(frame);
        }

        if let Some(store) = &self.store {
            // Without a rasterizer a base mismatch (after a jump) walks the chain
            let pixels = store
                .read_frame(base, index)
                .or_else(|| self.is_disk_only().then(|| store.read_chain(index)).flatten());
            if let Some(pixels) = pixels {
                if let Some(frame) = FrameBuffer::new(self.key.clone(), index, pixels) {
                    trace!("Frame {}:{} read from disk", self.key, index);
                    self.cache.register(&frame);
                    return Some(frame);
                }
            }
        }

        let frame = self.rasterize(index)?;
        self.cache.register(&frame);
        if let Some(store) = &self.store {
            store.write_frame(base, &frame, self.end_bound);
        }
        Some(frame)
    }

    fn rasterize(&self, index: i32) -> Option<FrameBuffer> {
        let decoder = self.decoder.as_ref()?;
        let width = self.key.pixel_width();
        let height = self.key.pixel_height();
        let stride = crate::entities::bytes_per_row(width);
        let mut pixels = vec![0u8; stride * height];

        let rendered = decoder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .render_frame(index, &mut pixels, width, height, stride);
        if !rendered {
            debug!("Rasterizer produced nothing for {}:{}", self.key, index);
            return None;
        }

        if self.key.mirror {
            mirror_rows(&mut pixels, width, stride);
        }
        trace!("Frame {}:{} rasterized", self.key, index);
        FrameBuffer::new(self.key.clone(), index, pixels)
    }
}

/// What one refill unit did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefillReport {
    pub produced: usize,
    pub wrapped: bool,
    pub exhausted: bool,
}

/// Everything a decode unit touches for one session.
pub struct Pipeline {
    pub window: Mutex<PlaybackWindow>,
    pub producer: FrameProducer,
    pub gate: RefillGate,
    pub cancelled: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(window: PlaybackWindow, producer: FrameProducer, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            window: Mutex::new(window),
            producer,
            gate: RefillGate::new(),
            cancelled,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Fill the window up to capacity. Caller must hold the refill gate;
    /// it is released before returning.
    pub fn run_refill(&self) -> RefillReport {
        let mut report = RefillReport::default();

        loop {
            if self.is_cancelled() {
                break;
            }
            let reservation = {
                let window = self.window.lock().unwrap_or_else(|e| e.into_inner());
                window.reserve()
            };
            let Some(reservation) = reservation else {
                break;
            };

            let frame = self.producer.produce(reservation.index, reservation.base.as_ref());
            if self.is_cancelled() {
                break;
            }

            let had_frame = frame.is_some();
            let outcome = {
                let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
                match frame {
                    Some(frame) => window.commit(reservation, frame),
                    None => window.fail(reservation),
                }
            };
            if had_frame && outcome != CommitOutcome::Discarded {
                report.produced += 1;
            }

            match outcome {
                CommitOutcome::Stored => {}
                CommitOutcome::Wrapped => {
                    report.wrapped = true;
                    if let Some(store) = self.producer.store() {
                        store.mark_finished();
                    }
                    // No frame: end of stream for this unit, next refill retries
                    if !had_frame {
                        break;
                    }
                }
                CommitOutcome::Exhausted => {
                    report.exhausted = true;
                    if let Some(store) = self.producer.store() {
                        store.mark_finished();
                    }
                    break;
                }
                CommitOutcome::Discarded => break,
            }
        }

        self.gate.release();
        debug!(
            "Refill {}: produced {}, wrapped={}, exhausted={}",
            self.producer.key(),
            report.produced,
            report.wrapped,
            report.exhausted
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::disk_store::StoreHeader;
    use crate::entities::{AnimationSource, PlayPolicy};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Fills each frame with its index, counts calls, fails past `end`.
    struct CountingDecoder {
        calls: Arc<AtomicUsize>,
        end: i32,
    }

    impl DecoderHandle for CountingDecoder {
        fn render_frame(&mut self, index: i32, out: &mut [u8], _w: usize, _h: usize, _s: usize) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if index >= self.end {
                return false;
            }
            out.fill(index as u8);
            out[0] = 0xAA;
            true
        }

        fn source_fps(&self) -> u32 {
            30
        }

        fn start_frame(&self) -> i32 {
            0
        }

        fn end_frame(&self) -> i32 {
            self.end
        }
    }

    fn key(name: &str) -> AnimationKey {
        AnimationKey::new(AnimationSource::Bundle(name.into()), 4, 4)
    }

    fn producer(
        key: &AnimationKey,
        cache: &SharedFrameCache,
        store: Option<Arc<DiskFrameStore>>,
        end: i32,
    ) -> (FrameProducer, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let decoder = CountingDecoder {
            calls: Arc::clone(&calls),
            end,
        };
        let p = FrameProducer::new(key.clone(), Some(Box::new(decoder)), store, cache.clone(), end);
        (p, calls)
    }

    #[test]
    fn test_cache_hit_skips_rasterizer() {
        let cache = SharedFrameCache::new();
        let k = key("hit");
        let (a, a_calls) = producer(&k, &cache, None, 10);
        let (b, b_calls) = producer(&k, &cache, None, 10);

        let first = a.produce(0, None).unwrap();
        let second = b.produce(0, None).unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);

        drop(first);
        drop(second);
        b.produce(0, None).unwrap();
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disk_read_skips_rasterizer() {
        let dir = TempDir::new().unwrap();
        let k = key("disk");
        let store = DiskFrameStore::open(dir.path(), &k, Duration::from_secs(60)).unwrap();
        store.initialize(StoreHeader::new(&k, 30, 1, 0, 10, 180));

        let (writer, _) = producer(&k, &SharedFrameCache::new(), Some(Arc::clone(&store)), 10);
        let f0 = writer.produce(0, None).unwrap();
        let f1 = writer.produce(1, Some(&f0)).unwrap();
        assert_eq!(store.len(), 2);

        let (reader, calls) = producer(&k, &SharedFrameCache::new(), Some(store), 10);
        let r0 = reader.produce(0, None).unwrap();
        let r1 = reader.produce(1, Some(&r0)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(r0.pixels(), f0.pixels());
        assert_eq!(r1.pixels(), f1.pixels());
    }

    #[test]
    fn test_disk_only_without_record_is_end_of_stream() {
        let cache = SharedFrameCache::new();
        let k = key("disk-only");
        let p = FrameProducer::new(k, None, None, cache, 10);
        assert!(p.is_disk_only());
        assert!(p.produce(0, None).is_none());
    }

    /// Run refills and take frames until `count` have been shown.
    fn play(pipeline: &Pipeline, count: usize) -> Vec<i32> {
        let mut shown = Vec::new();
        while shown.len() < count {
            pipeline.gate.try_acquire();
            let report = pipeline.run_refill();
            let mut window = pipeline.window.lock().unwrap();
            while let Some(d) = window.take_one() {
                shown.push(d.frame.index());
            }
            if window.is_stopped() || (report.exhausted && window.is_drained()) {
                break;
            }
        }
        shown
    }

    #[test]
    fn test_jump_keeps_store_chain_playable() {
        let dir = TempDir::new().unwrap();
        let k = key("jump");
        let store = DiskFrameStore::open(dir.path(), &k, Duration::from_secs(60)).unwrap();
        store.initialize(StoreHeader::new(&k, 30, 1, 0, 10, 180));

        let (p, _) = producer(&k, &SharedFrameCache::new(), Some(Arc::clone(&store)), 10);
        let pipeline = Pipeline::new(
            PlaybackWindow::new(0, 10, 1, 4, PlayPolicy::PlayCount(2)),
            p,
            Arc::new(AtomicBool::new(false)),
        );
        pipeline.gate.try_acquire();
        pipeline.run_refill();
        pipeline.window.lock().unwrap().jump_to(7);
        let shown = play(&pipeline, 64);
        assert_eq!(&shown[..7], &[0, 1, 2, 3, 7, 8, 9]);
        assert!(store.is_finished());
        drop(pipeline);

        // Store-only replay covers the whole range, including a jump
        let reader = FrameProducer::new(k.clone(), None, Some(Arc::clone(&store)), SharedFrameCache::new(), 10);
        let pipeline = Pipeline::new(
            PlaybackWindow::new(0, 10, 1, 4, PlayPolicy::Once),
            reader,
            Arc::new(AtomicBool::new(false)),
        );
        assert_eq!(play(&pipeline, 64), (0..10).collect::<Vec<_>>());

        let (reference, _) = producer(&k, &SharedFrameCache::new(), None, 10);
        let reader = FrameProducer::new(k, None, Some(store), SharedFrameCache::new(), 10);
        let jumped = reader.produce(6, None).unwrap();
        assert_eq!(jumped.pixels(), reference.produce(6, None).unwrap().pixels());
    }

    #[test]
    fn test_mirror_applied_before_cache() {
        let cache = SharedFrameCache::new();
        let k = key("mirror").with_mirror(true);
        let (p, _) = producer(&k, &cache, None, 10);
        let frame = p.produce(3, None).unwrap();
        // Marker byte written at pixel 0 ends up in the last pixel of row 0
        assert_eq!(frame.pixels()[0], 3);
        assert_eq!(frame.pixels()[3 * 4], 0xAA);
    }

    #[test]
    fn test_refill_fills_window_and_releases_gate() {
        let cache = SharedFrameCache::new();
        let k = key("refill");
        let (p, calls) = producer(&k, &cache, None, 10);
        let window = PlaybackWindow::new(0, 10, 1, 4, PlayPolicy::Loop);
        let pipeline = Pipeline::new(window, p, Arc::new(AtomicBool::new(false)));

        assert!(pipeline.gate.try_acquire());
        let report = pipeline.run_refill();
        assert_eq!(report.produced, 4);
        assert!(!pipeline.gate.is_busy());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(pipeline.window.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_refill_cancelled_produces_nothing() {
        let cache = SharedFrameCache::new();
        let k = key("cancel");
        let (p, calls) = producer(&k, &cache, None, 10);
        let window = PlaybackWindow::new(0, 10, 1, 4, PlayPolicy::Loop);
        let pipeline = Pipeline::new(window, p, Arc::new(AtomicBool::new(true)));

        pipeline.gate.try_acquire();
        let report = pipeline.run_refill();
        assert_eq!(report, RefillReport::default());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!pipeline.gate.is_busy());
    }

    #[test]
    fn test_refill_stops_on_decode_failure() {
        let cache = SharedFrameCache::new();
        let k = key("stall");
        // Reported range is 10 frames, decoder gives up after 2
        let calls = Arc::new(AtomicUsize::new(0));
        let decoder = CountingDecoder {
            calls: Arc::clone(&calls),
            end: 2,
        };
        let p = FrameProducer::new(k, Some(Box::new(decoder)), None, cache, 10);
        let window = PlaybackWindow::new(0, 10, 1, 4, PlayPolicy::Loop);
        let pipeline = Pipeline::new(window, p, Arc::new(AtomicBool::new(false)));

        pipeline.gate.try_acquire();
        let report = pipeline.run_refill();
        assert_eq!(report.produced, 2);
        assert!(report.wrapped);
        assert_eq!(pipeline.window.lock().unwrap().cursor(), 0);
    }
}
