//! On-disk frame store: LZ4-compressed, delta-encoded decoded frames.
//!
//! **Why**: Re-rasterizing a vector animation costs far more than reading and
//! inflating a frame. A later session of the same animation key reads frames
//! back instead of rasterizing them.
//!
//! **Used by**: FrameProducer (read before rasterize, write after), PlayerSession
//! (disk-only playback once a store is complete)
//!
//! # File Layout
//!
//! One file per animation key, `<cache_name>.lfc`:
//!
//! ```text
//! StoreHeader   (40 bytes)
//! Record*       RecordHeader (20 bytes) + payload
//! ```
//!
//! Payload is `lz4(pixels XOR base_pixels)` with the uncompressed size
//! prepended, or `lz4(pixels)` when the record has no base. The base is the
//! frame that preceded this one in the playback window; a read only succeeds
//! when the caller supplies the same base.
//!
//! The format is a private cache: any inconsistency wipes the file.
//!
//! # Concurrency
//!
//! One store per key per process ([`DiskFrameStore::open`] hands out the same
//! instance while any session holds it). All file access goes through one
//! mutex, so reads and writes are serialized.

use log::{debug, info, trace, warn};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

use crate::entities::{AnimationKey, FrameBuffer};
use crate::error::StoreError;

/// Magic bytes identifying a frame store file.
pub const STORE_MAGIC: &[u8; 4] = b"LTFC";

/// Current format version.
pub const STORE_VERSION: u16 = 1;

/// File extension for frame store files.
pub const STORE_EXTENSION: &str = "lfc";

/// Frames past this index are never persisted.
pub const DEFAULT_FRAME_CEILING: u32 = 180;

const FLAG_FINISHED: u16 = 1;
const FLAGS_OFFSET: u64 = 6;
const NO_BASE: i32 = -1;

static OPEN_STORES: Lazy<Mutex<HashMap<PathBuf, Weak<DiskFrameStore>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

// ============================================================================
// Binary format
// ============================================================================

/// File header. Describes the animation the records belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreHeader {
    /// Pixel width
    pub width: u32,
    /// Pixel height
    pub height: u32,
    pub bytes_per_row: u32,
    /// Intrinsic fps of the animation
    pub source_fps: u32,
    /// Cursor stride the records were produced with
    pub step: u32,
    pub start_frame: i32,
    pub end_frame: i32,
    /// Highest index + 1 that may be persisted
    pub ceiling: u32,
    /// Every frame of one full loop is stored
    pub finished: bool,
}

impl StoreHeader {
    /// Magic(4) + Version(2) + Flags(2) + Width(4) + Height(4) + Stride(4) +
    /// Fps(4) + Step(4) + Start(4) + End(4) + Ceiling(4) = 40
    pub const SIZE: u64 = 40;

    pub fn new(
        key: &AnimationKey,
        source_fps: u32,
        step: i32,
        start_frame: i32,
        end_frame: i32,
        ceiling: u32,
    ) -> Self {
        let width = key.pixel_width();
        Self {
            width: width as u32,
            height: key.pixel_height() as u32,
            bytes_per_row: crate::entities::bytes_per_row(width) as u32,
            source_fps,
            step: step.max(1) as u32,
            start_frame,
            end_frame,
            ceiling,
            finished: false,
        }
    }

    /// Same animation layout (ignores the finished flag).
    pub fn matches(&self, other: &StoreHeader) -> bool {
        StoreHeader { finished: false, ..*self } == StoreHeader { finished: false, ..*other }
    }

    /// Uncompressed size of one frame
    pub fn frame_len(&self) -> usize {
        self.bytes_per_row as usize * self.height as usize
    }

    /// Base index a record at `index` is delta-encoded against: the stepped
    /// predecessor, or none at the start frame.
    pub fn delta_base(&self, index: i32) -> i32 {
        if index <= self.start_frame {
            NO_BASE
        } else {
            index - self.step as i32
        }
    }

    /// Index lies on the stepped grid from the start frame
    pub fn on_grid(&self, index: i32) -> bool {
        index >= self.start_frame && (index - self.start_frame) % self.step.max(1) as i32 == 0
    }

    /// Exclusive bound of indices this store can ever hold
    pub fn persist_bound(&self) -> i32 {
        self.end_frame.min(self.ceiling as i32)
    }

    fn flags(&self) -> u16 {
        if self.finished { FLAG_FINISHED } else { 0 }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(STORE_MAGIC)?;
        w.write_all(&STORE_VERSION.to_le_bytes())?;
        w.write_all(&self.flags().to_le_bytes())?;
        w.write_all(&self.width.to_le_bytes())?;
        w.write_all(&self.height.to_le_bytes())?;
        w.write_all(&self.bytes_per_row.to_le_bytes())?;
        w.write_all(&self.source_fps.to_le_bytes())?;
        w.write_all(&self.step.to_le_bytes())?;
        w.write_all(&self.start_frame.to_le_bytes())?;
        w.write_all(&self.end_frame.to_le_bytes())?;
        w.write_all(&self.ceiling.to_le_bytes())?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, StoreError> {
        let mut magic = [0u8; 4];
        read_exact_or_truncated(r, &mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(StoreError::BadMagic);
        }

        let mut buf2 = [0u8; 2];

        read_exact_or_truncated(r, &mut buf2)?;
        let version = u16::from_le_bytes(buf2);
        if version != STORE_VERSION {
            return Err(StoreError::Version(version));
        }

        read_exact_or_truncated(r, &mut buf2)?;
        let flags = u16::from_le_bytes(buf2);

        let width = read_u32(r)?;
        let height = read_u32(r)?;
        let bytes_per_row = read_u32(r)?;
        let source_fps = read_u32(r)?;
        let step = read_u32(r)?;
        let start_frame = read_u32(r)? as i32;
        let end_frame = read_u32(r)? as i32;
        let ceiling = read_u32(r)?;

        Ok(Self {
            width,
            height,
            bytes_per_row,
            source_fps,
            step,
            start_frame,
            end_frame,
            ceiling,
            finished: flags & FLAG_FINISHED != 0,
        })
    }
}

/// Per-frame record header, followed by `payload_len` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecordHeader {
    index: i32,
    /// Index of the delta base, `NO_BASE` for a key frame
    base: i32,
    width: u32,
    height: u32,
    payload_len: u32,
}

impl RecordHeader {
    const SIZE: u64 = 20;

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.index.to_le_bytes())?;
        w.write_all(&self.base.to_le_bytes())?;
        w.write_all(&self.width.to_le_bytes())?;
        w.write_all(&self.height.to_le_bytes())?;
        w.write_all(&self.payload_len.to_le_bytes())?;
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R) -> Result<Self, StoreError> {
        let mut buf = [0u8; Self::SIZE as usize];
        read_exact_or_truncated(r, &mut buf)?;
        let word = |i: usize| [buf[i], buf[i + 1], buf[i + 2], buf[i + 3]];
        Ok(Self {
            index: i32::from_le_bytes(word(0)),
            base: i32::from_le_bytes(word(4)),
            width: u32::from_le_bytes(word(8)),
            height: u32::from_le_bytes(word(12)),
            payload_len: u32::from_le_bytes(word(16)),
        })
    }
}

fn read_exact_or_truncated<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<(), StoreError> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => StoreError::Truncated,
        _ => StoreError::Io(e),
    })
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, StoreError> {
    let mut buf4 = [0u8; 4];
    read_exact_or_truncated(r, &mut buf4)?;
    Ok(u32::from_le_bytes(buf4))
}

/// XOR `base` into `pixels` in place. Used for both encode and decode.
fn xor_in_place(pixels: &mut [u8], base: &[u8]) {
    for (p, b) in pixels.iter_mut().zip(base) {
        *p ^= b;
    }
}

// ============================================================================
// Store
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct RecordEntry {
    base: i32,
    payload_offset: u64,
    payload_len: u32,
}

struct StoreInner {
    file: Option<File>,
    header: Option<StoreHeader>,
    records: HashMap<i32, RecordEntry>,
}

/// Persisted frames of one animation key.
pub struct DiskFrameStore {
    path: PathBuf,
    key: AnimationKey,
    inner: Mutex<StoreInner>,
}

impl DiskFrameStore {
    /// Open (or create) the store for `key` under `dir`.
    ///
    /// Sessions of the same key share one instance. A file older than `ttl`
    /// is wiped first. Returns None if the directory is unusable.
    pub fn open(dir: &Path, key: &AnimationKey, ttl: Duration) -> Option<Arc<DiskFrameStore>> {
        let path = Self::path_for(dir, key);

        let mut open = OPEN_STORES.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(store) = open.get(&path).and_then(Weak::upgrade) {
            return Some(store);
        }
        open.retain(|_, store| store.strong_count() > 0);

        match Self::open_file(&path, key, ttl) {
            Ok(store) => {
                let store = Arc::new(store);
                open.insert(path, Arc::downgrade(&store));
                Some(store)
            }
            Err(e) => {
                warn!("Frame store {} unavailable: {}", path.display(), e);
                None
            }
        }
    }

    /// File path used for `key` under `dir`
    pub fn path_for(dir: &Path, key: &AnimationKey) -> PathBuf {
        dir.join(format!("{}.{}", key.cache_name(), STORE_EXTENSION))
    }

    fn open_file(path: &Path, key: &AnimationKey, ttl: Duration) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if is_expired(path, ttl) {
            debug!("Frame store {} expired, wiping", path.display());
            fs::remove_file(path)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let (header, records) = match scan(&mut file) {
            Ok(found) => found,
            Err(e) => {
                debug!("Frame store {} unreadable ({}), wiping", path.display(), e);
                file.set_len(0)?;
                (None, HashMap::new())
            }
        };

        if let Some(h) = &header {
            info!(
                "Frame store {}: {} records, frames [{}, {}), finished={}",
                path.display(),
                records.len(),
                h.start_frame,
                h.end_frame,
                h.finished
            );
        }

        Ok(Self {
            path: path.to_path_buf(),
            key: key.clone(),
            inner: Mutex::new(StoreInner {
                file: Some(file),
                header,
                records,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key(&self) -> &AnimationKey {
        &self.key
    }

    /// Header of the stored animation, None before [`initialize`](Self::initialize).
    pub fn metadata(&self) -> Option<StoreHeader> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).header
    }

    /// True once a full loop has been persisted.
    pub fn is_finished(&self) -> bool {
        self.metadata().is_some_and(|h| h.finished)
    }

    /// Number of persisted frames
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, index: i32) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .records
            .contains_key(&index)
    }

    /// Bind the store to an animation layout.
    ///
    /// Keeps existing records when the layout matches, otherwise starts a
    /// fresh file.
    pub fn initialize(&self, header: StoreHeader) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.header.is_some_and(|h| h.matches(&header)) {
            return true;
        }
        if inner.header.is_some() {
            debug!("Frame store {}: {}", self.path.display(), StoreError::HeaderMismatch);
        }
        match reset_file(&mut inner, header) {
            Ok(()) => true,
            Err(e) => {
                warn!("Frame store {} init failed: {}", self.path.display(), e);
                inner.file = None;
                false
            }
        }
    }

    /// Decompressed pixels for `index`, if stored with `previous` as its delta base.
    ///
    /// Any mismatch or read error yields None; the caller rasterizes instead.
    pub fn read_frame(&self, previous: Option<&FrameBuffer>, index: i32) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = *inner.records.get(&index)?;
        let header = inner.header?;

        let expected_base = previous.map_or(NO_BASE, FrameBuffer::index);
        if entry.base != expected_base {
            trace!(
                "Frame store {}: base mismatch for {} (stored {}, have {})",
                self.key, index, entry.base, expected_base
            );
            return None;
        }

        match read_payload(&mut inner, entry, header.frame_len(), previous.map(FrameBuffer::pixels)) {
            Ok(pixels) => Some(pixels),
            Err(e) => {
                debug!("Frame store {}: read {} failed: {}", self.key, index, e);
                inner.records.remove(&index);
                None
            }
        }
    }

    /// Pixels for `index` with no base in hand, decoded along the delta chain
    /// from its keyframe. Lets a store-only session resume after a jump.
    pub fn read_chain(&self, index: i32) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let header = inner.header?;

        let mut chain = vec![*inner.records.get(&index)?];
        while let Some(base) = chain.last().map(|e| e.base).filter(|b| *b != NO_BASE) {
            if chain.len() > inner.records.len() {
                return None;
            }
            chain.push(*inner.records.get(&base)?);
        }

        let mut pixels: Option<Vec<u8>> = None;
        for entry in chain.into_iter().rev() {
            match read_payload(&mut inner, entry, header.frame_len(), pixels.as_deref()) {
                Ok(next) => pixels = Some(next),
                Err(e) => {
                    debug!("Frame store {}: chain read {} failed: {}", self.key, index, e);
                    return None;
                }
            }
        }
        trace!("Frame store {}: {} decoded along its chain", self.key, index);
        pixels
    }

    /// Append `frame`, delta-encoded against `previous`. Best effort.
    ///
    /// Skipped when the frame is already stored, off the step grid, past the
    /// ceiling or `end_bound`, or when the store is finished or uninitialized.
    /// `previous` must be the stepped predecessor (none at the start frame),
    /// so every record decodes along one chain.
    pub fn write_frame(&self, previous: Option<&FrameBuffer>, frame: &FrameBuffer, end_bound: i32) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(header) = inner.header else {
            return;
        };
        let index = frame.index();
        if header.finished
            || index >= end_bound
            || index >= header.persist_bound()
            || inner.records.contains_key(&index)
            || !header.on_grid(index)
        {
            return;
        }
        if frame.pixels().len() != header.frame_len() {
            return;
        }
        let base = previous.map_or(NO_BASE, FrameBuffer::index);
        if base != header.delta_base(index) {
            trace!("Frame store {}: {} not written, base {} is off the chain", self.key, index, base);
            return;
        }

        if let Err(e) = append_record(&mut inner, previous, frame) {
            warn!("Frame store {}: write {} failed: {}", self.key, index, e);
        }
    }

    /// Flag the store complete once one full loop has been written.
    ///
    /// Ignored unless every index the cursor visits in `[start, end)` is
    /// stored, so animations longer than the ceiling never finish.
    pub fn mark_finished(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(mut header) = inner.header else {
            return;
        };
        if header.finished || !covers_full_range(&header, &inner.records) {
            return;
        }
        header.finished = true;

        let result = match inner.file.as_mut() {
            Some(file) => file
                .seek(SeekFrom::Start(FLAGS_OFFSET))
                .and_then(|_| file.write_all(&header.flags().to_le_bytes())),
            None => return,
        };
        match result {
            Ok(()) => {
                inner.header = Some(header);
                info!("Frame store {} finished ({} frames)", self.key, inner.records.len());
            }
            Err(e) => warn!("Frame store {}: mark finished failed: {}", self.key, e),
        }
    }

    /// Remove store files under `dir` not modified within `ttl`.
    ///
    /// Returns the number of files removed.
    pub fn sweep_expired(dir: &Path, ttl: Duration) -> usize {
        let Ok(entries) = fs::read_dir(dir) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(STORE_EXTENSION) {
                continue;
            }
            if is_expired(&path, ttl) && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Swept {} expired frame stores from {}", removed, dir.display());
        }
        removed
    }
}

fn covers_full_range(header: &StoreHeader, records: &HashMap<i32, RecordEntry>) -> bool {
    if header.end_frame > header.ceiling as i32 || records.is_empty() {
        return false;
    }
    (header.start_frame..header.end_frame)
        .step_by(header.step.max(1) as usize)
        .all(|index| records.contains_key(&index))
}

fn is_expired(path: &Path, ttl: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > ttl)
}

/// Read header and record index. Trailing partial records are cut off.
fn scan(file: &mut File) -> Result<(Option<StoreHeader>, HashMap<i32, RecordEntry>), StoreError> {
    let file_len = file.metadata()?.len();
    let mut records = HashMap::new();
    if file_len == 0 {
        return Ok((None, records));
    }

    file.seek(SeekFrom::Start(0))?;
    let mut reader = io::BufReader::new(&mut *file);
    let header = StoreHeader::read_from(&mut reader)?;

    let mut offset = StoreHeader::SIZE;
    let mut valid_len = offset;
    while offset + RecordHeader::SIZE <= file_len {
        let record = match RecordHeader::read_from(&mut reader) {
            Ok(r) => r,
            Err(StoreError::Truncated) => break,
            Err(e) => return Err(e),
        };
        let payload_offset = offset + RecordHeader::SIZE;
        let next = payload_offset + record.payload_len as u64;
        if next > file_len || record.width != header.width || record.height != header.height {
            break;
        }
        reader.seek_relative(record.payload_len as i64)?;
        records.insert(
            record.index,
            RecordEntry {
                base: record.base,
                payload_offset,
                payload_len: record.payload_len,
            },
        );
        offset = next;
        valid_len = next;
    }
    drop(reader);

    if valid_len < file_len {
        debug!("Frame store: dropping {} trailing bytes", file_len - valid_len);
        file.set_len(valid_len)?;
    }
    Ok((Some(header), records))
}

fn reset_file(inner: &mut StoreInner, header: StoreHeader) -> Result<(), StoreError> {
    let file = inner.file.as_mut().ok_or(StoreError::HeaderMismatch)?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    header.write_to(file)?;
    file.flush()?;
    inner.header = Some(header);
    inner.records.clear();
    Ok(())
}

fn read_payload(
    inner: &mut StoreInner,
    entry: RecordEntry,
    frame_len: usize,
    base: Option<&[u8]>,
) -> Result<Vec<u8>, StoreError> {
    let file = inner.file.as_mut().ok_or(StoreError::Truncated)?;
    file.seek(SeekFrom::Start(entry.payload_offset))?;
    let mut compressed = vec![0u8; entry.payload_len as usize];
    read_exact_or_truncated(file, &mut compressed)?;

    let mut pixels = lz4_flex::decompress_size_prepended(&compressed)?;
    if pixels.len() != frame_len {
        return Err(StoreError::HeaderMismatch);
    }
    if let Some(base) = base {
        if base.len() != frame_len {
            return Err(StoreError::HeaderMismatch);
        }
        xor_in_place(&mut pixels, base);
    }
    Ok(pixels)
}

fn append_record(
    inner: &mut StoreInner,
    previous: Option<&FrameBuffer>,
    frame: &FrameBuffer,
) -> Result<(), StoreError> {
    let base = previous.filter(|p| p.pixels().len() == frame.pixels().len());

    let mut delta = frame.pixels().to_vec();
    if let Some(base) = base {
        xor_in_place(&mut delta, base.pixels());
    }
    let payload = lz4_flex::compress_prepend_size(&delta);

    let record = RecordHeader {
        index: frame.index(),
        base: base.map_or(NO_BASE, FrameBuffer::index),
        width: frame.width() as u32,
        height: frame.height() as u32,
        payload_len: payload.len() as u32,
    };

    let file = inner.file.as_mut().ok_or(StoreError::Truncated)?;
    let offset = file.seek(SeekFrom::End(0))?;
    let mut buf = Vec::with_capacity(RecordHeader::SIZE as usize + payload.len());
    record.write_to(&mut buf)?;
    buf.extend_from_slice(&payload);
    file.write_all(&buf)?;

    trace!(
        "Stored frame {} (base {}, {} -> {} bytes)",
        record.index,
        record.base,
        delta.len(),
        payload.len()
    );
    inner.records.insert(
        record.index,
        RecordEntry {
            base: record.base,
            payload_offset: offset + RecordHeader::SIZE,
            payload_len: record.payload_len,
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{AnimationSource, bytes_per_row};
    use tempfile::TempDir;

    const TTL: Duration = Duration::from_secs(3600);

    fn key(name: &str) -> AnimationKey {
        AnimationKey::new(AnimationSource::Bundle(name.into()), 8, 4)
    }

    fn frame(key: &AnimationKey, index: i32, fill: u8) -> FrameBuffer {
        let mut px = vec![fill; bytes_per_row(8) * 4];
        px[0] = index as u8;
        FrameBuffer::new(key.clone(), index, px).unwrap()
    }

    fn header(key: &AnimationKey, end: i32) -> StoreHeader {
        StoreHeader::new(key, 30, 1, 0, end, DEFAULT_FRAME_CEILING)
    }

    #[test]
    fn test_header_bytes() {
        let h = header(&key("h"), 30);
        let mut buf = Vec::new();
        h.write_to(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, StoreHeader::SIZE);
        let back = StoreHeader::read_from(&mut &buf[..]).unwrap();
        assert_eq!(back, h);

        buf[0] = b'X';
        assert!(matches!(StoreHeader::read_from(&mut &buf[..]), Err(StoreError::BadMagic)));
        assert!(matches!(
            StoreHeader::read_from(&mut &buf[..10]),
            Err(StoreError::BadMagic) | Err(StoreError::Truncated)
        ));
    }

    #[test]
    fn test_write_then_read_with_delta_chain() {
        let dir = TempDir::new().unwrap();
        let k = key("chain");
        let store = DiskFrameStore::open(dir.path(), &k, TTL).unwrap();
        assert!(store.initialize(header(&k, 30)));

        let f0 = frame(&k, 0, 10);
        let f1 = frame(&k, 1, 20);
        store.write_frame(None, &f0, 30);
        store.write_frame(Some(&f0), &f1, 30);
        assert_eq!(store.len(), 2);

        assert_eq!(store.read_frame(None, 0).unwrap(), f0.pixels());
        assert_eq!(store.read_frame(Some(&f0), 1).unwrap(), f1.pixels());
    }

    #[test]
    fn test_read_base_mismatch_returns_none() {
        let dir = TempDir::new().unwrap();
        let k = key("mismatch");
        let store = DiskFrameStore::open(dir.path(), &k, TTL).unwrap();
        store.initialize(header(&k, 30));

        let f0 = frame(&k, 0, 1);
        let f1 = frame(&k, 1, 2);
        let f5 = frame(&k, 5, 3);
        store.write_frame(None, &f0, 30);
        store.write_frame(Some(&f0), &f1, 30);

        assert!(store.read_frame(None, 1).is_none());
        assert!(store.read_frame(Some(&f5), 1).is_none());
        assert!(store.read_frame(Some(&f0), 0).is_none());
        assert!(store.read_frame(None, 7).is_none());
    }

    #[test]
    fn test_ceiling_and_end_bound_skip_writes() {
        let dir = TempDir::new().unwrap();
        let k = key("ceiling");
        let store = DiskFrameStore::open(dir.path(), &k, TTL).unwrap();
        store.initialize(StoreHeader::new(&k, 30, 1, 0, 300, 2));

        let f0 = frame(&k, 0, 0);
        let f1 = frame(&k, 1, 0);
        store.write_frame(None, &f0, 300);
        store.write_frame(Some(&f0), &f1, 1);
        store.write_frame(Some(&f1), &frame(&k, 2, 0), 300);
        assert!(store.contains(0));
        assert!(!store.contains(1));
        assert!(!store.contains(2));
    }

    #[test]
    fn test_reopen_keeps_records_and_finished_flag() {
        let dir = TempDir::new().unwrap();
        let k = key("reopen");
        let f0 = frame(&k, 0, 5);
        {
            let store = DiskFrameStore::open(dir.path(), &k, TTL).unwrap();
            store.initialize(header(&k, 1));
            store.write_frame(None, &f0, 1);
            store.mark_finished();
            assert!(store.is_finished());
        }

        let store = DiskFrameStore::open(dir.path(), &k, TTL).unwrap();
        assert!(store.is_finished());
        assert_eq!(store.metadata().unwrap().end_frame, 1);
        assert_eq!(store.read_frame(None, 0).unwrap(), f0.pixels());
    }

    #[test]
    fn test_open_shares_instance() {
        let dir = TempDir::new().unwrap();
        let k = key("shared");
        let a = DiskFrameStore::open(dir.path(), &k, TTL).unwrap();
        let b = DiskFrameStore::open(dir.path(), &k, TTL).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_mark_finished_requires_full_range() {
        let dir = TempDir::new().unwrap();
        let k = key("long");
        let store = DiskFrameStore::open(dir.path(), &k, TTL).unwrap();
        store.initialize(StoreHeader::new(&k, 30, 1, 0, 400, DEFAULT_FRAME_CEILING));
        store.write_frame(None, &frame(&k, 0, 0), 400);
        store.mark_finished();
        assert!(!store.is_finished());
    }

    #[test]
    fn test_mark_finished_requires_every_frame() {
        let dir = TempDir::new().unwrap();
        let k = key("gaps");
        let store = DiskFrameStore::open(dir.path(), &k, TTL).unwrap();
        store.initialize(header(&k, 3));
        let f0 = frame(&k, 0, 0);
        let f1 = frame(&k, 1, 0);
        store.write_frame(None, &f0, 3);
        store.write_frame(Some(&f1), &frame(&k, 2, 0), 3);
        store.mark_finished();
        assert!(!store.is_finished());

        store.write_frame(Some(&f0), &f1, 3);
        store.mark_finished();
        assert!(store.is_finished());
    }

    #[test]
    fn test_off_chain_base_not_written() {
        let dir = TempDir::new().unwrap();
        let k = key("offchain");
        let store = DiskFrameStore::open(dir.path(), &k, TTL).unwrap();
        store.initialize(StoreHeader::new(&k, 60, 2, 0, 20, DEFAULT_FRAME_CEILING));

        let f0 = frame(&k, 0, 1);
        let f2 = frame(&k, 2, 2);
        // Base left over from before a jump
        store.write_frame(Some(&f2), &frame(&k, 8, 3), 20);
        store.write_frame(None, &frame(&k, 8, 3), 20);
        store.write_frame(Some(&f0), &frame(&k, 3, 3), 20);
        assert!(store.is_empty());

        store.write_frame(None, &f0, 20);
        store.write_frame(Some(&f0), &f2, 20);
        assert_eq!(store.len(), 2);
        assert_eq!(store.metadata().unwrap().delta_base(2), 0);
        assert_eq!(store.metadata().unwrap().delta_base(0), NO_BASE);
    }

    #[test]
    fn test_read_chain_without_base() {
        let dir = TempDir::new().unwrap();
        let k = key("walk");
        let store = DiskFrameStore::open(dir.path(), &k, TTL).unwrap();
        store.initialize(header(&k, 4));

        let frames: Vec<FrameBuffer> = (0..4).map(|i| frame(&k, i, 10 * i as u8)).collect();
        store.write_frame(None, &frames[0], 4);
        for pair in frames.windows(2) {
            store.write_frame(Some(&pair[0]), &pair[1], 4);
        }

        assert!(store.read_frame(None, 3).is_none());
        assert_eq!(store.read_chain(3).unwrap(), frames[3].pixels());
        assert_eq!(store.read_chain(0).unwrap(), frames[0].pixels());
        assert!(store.read_chain(9).is_none());
    }

    #[test]
    fn test_truncated_tail_dropped_on_reopen() {
        let dir = TempDir::new().unwrap();
        let k = key("tail");
        let f0 = frame(&k, 0, 9);
        let path = {
            let store = DiskFrameStore::open(dir.path(), &k, TTL).unwrap();
            store.initialize(header(&k, 30));
            store.write_frame(None, &f0, 30);
            store.path().to_path_buf()
        };
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[1, 2, 3, 4, 5, 6, 7]).unwrap();
        drop(file);

        let store = DiskFrameStore::open(dir.path(), &k, TTL).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.read_frame(None, 0).unwrap(), f0.pixels());
    }

    #[test]
    fn test_garbage_file_is_wiped() {
        let dir = TempDir::new().unwrap();
        let k = key("garbage");
        fs::write(DiskFrameStore::path_for(dir.path(), &k), b"not a frame store at all").unwrap();

        let store = DiskFrameStore::open(dir.path(), &k, TTL).unwrap();
        assert!(store.metadata().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_layout_change_resets_store() {
        let dir = TempDir::new().unwrap();
        let k = key("relayout");
        let store = DiskFrameStore::open(dir.path(), &k, TTL).unwrap();
        store.initialize(header(&k, 30));
        store.write_frame(None, &frame(&k, 0, 0), 30);

        assert!(store.initialize(header(&k, 60)));
        assert!(store.is_empty());
        assert_eq!(store.metadata().unwrap().end_frame, 60);
    }

    #[test]
    fn test_sweep_expired() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.lfc"), b"x").unwrap();
        fs::write(dir.path().join("keep.txt"), b"x").unwrap();

        assert_eq!(DiskFrameStore::sweep_expired(dir.path(), TTL), 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(DiskFrameStore::sweep_expired(dir.path(), Duration::from_millis(1)), 1);
        assert!(dir.path().join("keep.txt").exists());
    }
}
