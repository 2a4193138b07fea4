//! Log-structured engine.
//!
//! Layout of an engine directory:
//!
//! ```text
//! <dir>/
//!   000001.vlog      value-log segments, append-only, rotated by size
//!   000002.vlog
//!   index.sst        sorted key index snapshot written by `flatten`
//! ```
//!
//! Every write appends a record to the active segment and updates an
//! in-memory key → pointer index. `flatten` persists the index together with
//! the value-log watermark it covers, so reopening replays only the tail.
//! Value-log GC rewrites the live records of the segment with the most stale
//! data into the active segment and deletes the old file.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;

use profstore_core::{Result, StoreError};

use super::record::{self, RecordKind};
use super::{Engine, EngineOptions, GcOutcome};

const SEGMENT_EXT: &str = "vlog";
const INDEX_FILE: &str = "index.sst";
const INDEX_TMP_FILE: &str = "index.sst.tmp";
const INDEX_MAGIC: [u8; 4] = *b"PSST";
const INDEX_VERSION: u32 = 1;
const INDEX_HEADER_LEN: usize = 4 + 4 + 8 + 8 + 8;

/// Emit an engine log line only if the engine's configured level allows it.
macro_rules! engine_log {
    ($opts:expr, $level:ident, $($arg:tt)+) => {{
        let opts: &EngineOptions = &$opts;
        if tracing::Level::$level <= opts.log_level {
            tracing::event!(
                target: "profstore::engine",
                tracing::Level::$level,
                engine = %opts.name,
                $($arg)+
            );
        }
    }};
}

/// Location of a record in the value log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pointer {
    segment: u64,
    offset: u64,
    len: u32,
}

#[derive(Debug, Default, Clone, Copy)]
struct SegmentStats {
    /// Bytes in the file
    size: u64,
    /// Bytes of records still referenced by the index
    live: u64,
}

impl SegmentStats {
    fn stale_ratio(&self) -> f64 {
        if self.size == 0 {
            return 0.0;
        }
        self.size.saturating_sub(self.live) as f64 / self.size as f64
    }
}

struct Inner {
    index: BTreeMap<Vec<u8>, Pointer>,
    segments: BTreeMap<u64, SegmentStats>,
    active: File,
    active_id: u64,
    readers: HashMap<u64, File>,
    index_size: u64,
    closed: bool,
}

/// Append-only value log with an in-memory index.
pub struct LogEngine {
    dir: PathBuf,
    options: EngineOptions,
    inner: Mutex<Inner>,
}

struct IndexSnapshot {
    watermark: (u64, u64),
    entries: BTreeMap<Vec<u8>, Pointer>,
}

impl LogEngine {
    /// Open the engine in `dir`, creating it if needed, and rebuild the index.
    pub fn open(dir: impl AsRef<Path>, options: EngineOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut segments = BTreeMap::new();
        for id in list_segments(&dir)? {
            let size = fs::metadata(segment_path(&dir, id))?.len();
            segments.insert(id, SegmentStats { size, live: 0 });
        }

        let index_path = dir.join(INDEX_FILE);
        let (mut index, watermark, index_size) = match load_index(&index_path) {
            Ok(Some(snapshot)) => {
                let size = fs::metadata(&index_path)?.len();
                (snapshot.entries, snapshot.watermark, size)
            }
            Ok(None) => (BTreeMap::new(), (0, 0), 0),
            Err(e) => {
                engine_log!(options, WARN, error = %e, "ignoring unreadable index snapshot, replaying full value log");
                (BTreeMap::new(), (0, 0), 0)
            }
        };
        index.retain(|_, p| segments.contains_key(&p.segment));

        let ids: Vec<u64> = segments.keys().copied().collect();
        for id in ids {
            if id < watermark.0 {
                continue;
            }
            let from = if id == watermark.0 { watermark.1 } else { 0 };
            let size = replay_segment(&dir, id, from, &mut index, &options)?;
            if let Some(stats) = segments.get_mut(&id) {
                stats.size = size;
            }
        }

        for ptr in index.values() {
            if let Some(stats) = segments.get_mut(&ptr.segment) {
                stats.live += ptr.len as u64;
            }
        }

        let active_id = segments.keys().next_back().copied().unwrap_or(1);
        segments.entry(active_id).or_default();
        let active = OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(&dir, active_id))?;

        engine_log!(
            options,
            DEBUG,
            keys = index.len(),
            segments = segments.len(),
            "engine opened"
        );

        Ok(Self {
            dir,
            options,
            inner: Mutex::new(Inner {
                index,
                segments,
                active,
                active_id,
                readers: HashMap::new(),
                index_size,
                closed: false,
            }),
        })
    }

    /// Number of live keys
    pub fn key_count(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// Number of value-log segment files
    pub fn segment_count(&self) -> usize {
        self.inner.lock().segments.len()
    }

    fn ensure_open(inner: &Inner) -> Result<()> {
        if inner.closed {
            return Err(StoreError::engine("engine is closed"));
        }
        Ok(())
    }

    fn read_record(&self, inner: &mut Inner, ptr: Pointer) -> Result<Vec<u8>> {
        let file = match inner.readers.entry(ptr.segment) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(File::open(segment_path(&self.dir, ptr.segment))?),
        };
        file.seek(SeekFrom::Start(ptr.offset))?;
        let mut buf = vec![0u8; ptr.len as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_value(&self, inner: &mut Inner, ptr: Pointer) -> Result<Vec<u8>> {
        let buf = self.read_record(inner, ptr)?;
        let (rec, _) = record::decode(&buf).map_err(|e| {
            StoreError::Corruption(format!(
                "segment {} offset {}: {}",
                ptr.segment, ptr.offset, e
            ))
        })?;
        Ok(rec.value.to_vec())
    }

    fn rotate_if_needed(&self, inner: &mut Inner, incoming: u64) -> Result<()> {
        let current = inner
            .segments
            .get(&inner.active_id)
            .map(|s| s.size)
            .unwrap_or(0);
        if current == 0 || current + incoming <= self.options.value_log_file_size {
            return Ok(());
        }

        inner.active.sync_data()?;
        let next = inner.active_id + 1;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(&self.dir, next))?;
        inner.active = file;
        inner.active_id = next;
        inner.segments.entry(next).or_default();
        engine_log!(self.options, DEBUG, segment = next, "rotated value log");
        Ok(())
    }

    fn append(&self, inner: &mut Inner, kind: RecordKind, key: &[u8], value: &[u8]) -> Result<Pointer> {
        let body_len = record::body_len(key, value);
        if body_len > record::MAX_BODY_LEN {
            return Err(StoreError::InvalidOperation(format!(
                "record of {} bytes exceeds the {} byte limit",
                body_len,
                record::MAX_BODY_LEN
            )));
        }
        let buf = record::encode(kind, key, value);
        self.rotate_if_needed(inner, buf.len() as u64)?;

        let id = inner.active_id;
        let stats = inner.segments.entry(id).or_default();
        let offset = stats.size;
        inner.active.write_all(&buf)?;
        if self.options.sync_writes {
            inner.active.sync_data()?;
        }
        stats.size += buf.len() as u64;

        Ok(Pointer {
            segment: id,
            offset,
            len: buf.len() as u32,
        })
    }

    fn release(inner: &mut Inner, ptr: Pointer) {
        if let Some(stats) = inner.segments.get_mut(&ptr.segment) {
            stats.live = stats.live.saturating_sub(ptr.len as u64);
        }
    }

    fn retain(inner: &mut Inner, ptr: Pointer) {
        if let Some(stats) = inner.segments.get_mut(&ptr.segment) {
            stats.live += ptr.len as u64;
        }
    }

    /// Keys deleted in `segment` that no later put brought back.
    fn shadowing_tombstones(&self, inner: &Inner, segment: u64) -> Result<Vec<Vec<u8>>> {
        let buf = fs::read(segment_path(&self.dir, segment))?;
        let mut keys = BTreeSet::new();
        let mut offset = 0;
        while offset < buf.len() {
            let (rec, n) = record::decode(&buf[offset..]).map_err(|e| {
                StoreError::Corruption(format!("segment {} offset {}: {}", segment, offset, e))
            })?;
            if rec.kind == RecordKind::Delete && !inner.index.contains_key(rec.key) {
                keys.insert(rec.key.to_vec());
            }
            offset += n;
        }
        Ok(keys.into_iter().collect())
    }

    fn write_snapshot(&self, inner: &mut Inner) -> Result<()> {
        inner.active.sync_data()?;
        let watermark_offset = inner
            .segments
            .get(&inner.active_id)
            .map(|s| s.size)
            .unwrap_or(0);
        inner.index_size = write_index(
            &self.dir,
            &inner.index,
            (inner.active_id, watermark_offset),
        )?;
        Ok(())
    }
}

impl Engine for LogEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;
        match inner.index.get(key).copied() {
            Some(ptr) => self.read_value(&mut inner, ptr).map(Some),
            None => Ok(None),
        }
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;
        let ptr = self.append(&mut inner, RecordKind::Put, key, value)?;
        if let Some(old) = inner.index.insert(key.to_vec(), ptr) {
            Self::release(&mut inner, old);
        }
        Self::retain(&mut inner, ptr);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;
        if !inner.index.contains_key(key) {
            return Ok(());
        }
        self.append(&mut inner, RecordKind::Delete, key, &[])?;
        if let Some(old) = inner.index.remove(key) {
            Self::release(&mut inner, old);
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;
        let matches: Vec<(Vec<u8>, Pointer)> = inner
            .index
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, p)| (k.clone(), *p))
            .collect();

        let mut out = Vec::with_capacity(matches.len());
        for (key, ptr) in matches {
            let value = self.read_value(&mut inner, ptr)?;
            out.push((key, value));
        }
        Ok(out)
    }

    fn size(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        let vlog = inner.segments.values().map(|s| s.size).sum();
        (inner.index_size, vlog)
    }

    fn flatten(&self, workers: usize) -> Result<()> {
        if workers == 0 {
            return Err(StoreError::InvalidOperation(
                "flatten requires at least one worker".to_string(),
            ));
        }
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;
        self.write_snapshot(&mut inner)?;
        engine_log!(
            self.options,
            DEBUG,
            keys = inner.index.len(),
            index_bytes = inner.index_size,
            "flattened index"
        );
        Ok(())
    }

    fn run_value_log_gc(&self, discard_ratio: f64) -> Result<GcOutcome> {
        if !(discard_ratio > 0.0 && discard_ratio < 1.0) {
            return Err(StoreError::InvalidOperation(format!(
                "discard ratio must be in (0, 1), got {}",
                discard_ratio
            )));
        }
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;

        let active_id = inner.active_id;
        let victim = inner
            .segments
            .iter()
            .filter(|(id, s)| **id != active_id && s.size > 0 && s.stale_ratio() >= discard_ratio)
            .max_by(|a, b| {
                a.1.stale_ratio()
                    .partial_cmp(&b.1.stale_ratio())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(id, _)| *id);

        let Some(victim) = victim else {
            return Ok(GcOutcome::NoRewrite);
        };

        let live: Vec<(Vec<u8>, Pointer)> = inner
            .index
            .iter()
            .filter(|(_, p)| p.segment == victim)
            .map(|(k, p)| (k.clone(), *p))
            .collect();

        for (key, old) in &live {
            let value = self.read_value(&mut inner, *old)?;
            let ptr = self.append(&mut inner, RecordKind::Put, key, &value)?;
            inner.index.insert(key.clone(), ptr);
            Self::release(&mut inner, *old);
            Self::retain(&mut inner, ptr);
        }

        // An older segment may still hold a put that a tombstone in the
        // victim shadows; a full replay must keep seeing the delete.
        let tombstones = if inner.segments.range(..victim).next().is_some() {
            self.shadowing_tombstones(&inner, victim)?
        } else {
            Vec::new()
        };
        for key in &tombstones {
            self.append(&mut inner, RecordKind::Delete, key, &[])?;
        }

        // The snapshot must stop referencing the victim before its file goes away.
        self.write_snapshot(&mut inner)?;
        inner.readers.remove(&victim);
        let reclaimed = inner.segments.remove(&victim).map(|s| s.size).unwrap_or(0);
        fs::remove_file(segment_path(&self.dir, victim))?;

        engine_log!(
            self.options,
            INFO,
            segment = victim,
            rewritten = live.len(),
            tombstones = tombstones.len(),
            reclaimed_bytes = reclaimed,
            "value log GC rewrote segment"
        );
        Ok(GcOutcome::Rewritten)
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        if self.options.compact_on_close {
            self.write_snapshot(&mut inner)?;
        }
        inner.active.sync_all()?;
        inner.readers.clear();
        inner.closed = true;
        engine_log!(self.options, DEBUG, "engine closed");
        Ok(())
    }
}

fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:06}.{}", id, SEGMENT_EXT))
}

fn list_segments(dir: &Path) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
            continue;
        }
        if let Some(id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Apply the records of one segment starting at `from`; returns the segment's
/// valid size (smaller than the file if a torn tail was truncated).
fn replay_segment(
    dir: &Path,
    id: u64,
    from: u64,
    index: &mut BTreeMap<Vec<u8>, Pointer>,
    options: &EngineOptions,
) -> Result<u64> {
    let path = segment_path(dir, id);
    let mut buf = Vec::new();
    File::open(&path)?.read_to_end(&mut buf)?;

    let mut offset = from as usize;
    if offset > buf.len() {
        return Err(StoreError::Corruption(format!(
            "index watermark {} beyond end of {}",
            offset,
            path.display()
        )));
    }

    while offset < buf.len() {
        match record::decode(&buf[offset..]) {
            Ok((rec, n)) => {
                match rec.kind {
                    RecordKind::Put => {
                        index.insert(
                            rec.key.to_vec(),
                            Pointer {
                                segment: id,
                                offset: offset as u64,
                                len: n as u32,
                            },
                        );
                    }
                    RecordKind::Delete => {
                        index.remove(rec.key);
                    }
                }
                offset += n;
            }
            Err(e) => {
                if !options.truncate {
                    return Err(StoreError::Corruption(format!(
                        "{} at offset {}: {}",
                        path.display(),
                        offset,
                        e
                    )));
                }
                engine_log!(
                    options,
                    WARN,
                    segment = id,
                    offset = offset,
                    error = %e,
                    "truncating value log tail"
                );
                OpenOptions::new()
                    .write(true)
                    .open(&path)?
                    .set_len(offset as u64)?;
                return Ok(offset as u64);
            }
        }
    }
    Ok(buf.len() as u64)
}

fn write_index(
    dir: &Path,
    index: &BTreeMap<Vec<u8>, Pointer>,
    watermark: (u64, u64),
) -> Result<u64> {
    let mut buf = Vec::with_capacity(INDEX_HEADER_LEN + index.len() * 32);
    buf.extend_from_slice(&INDEX_MAGIC);
    let mut scratch = [0u8; 8];
    LittleEndian::write_u32(&mut scratch[..4], INDEX_VERSION);
    buf.extend_from_slice(&scratch[..4]);
    for n in [watermark.0, watermark.1, index.len() as u64] {
        LittleEndian::write_u64(&mut scratch, n);
        buf.extend_from_slice(&scratch);
    }
    for (key, ptr) in index {
        LittleEndian::write_u32(&mut scratch[..4], key.len() as u32);
        buf.extend_from_slice(&scratch[..4]);
        buf.extend_from_slice(key);
        LittleEndian::write_u64(&mut scratch, ptr.segment);
        buf.extend_from_slice(&scratch);
        LittleEndian::write_u64(&mut scratch, ptr.offset);
        buf.extend_from_slice(&scratch);
        LittleEndian::write_u32(&mut scratch[..4], ptr.len);
        buf.extend_from_slice(&scratch[..4]);
    }
    let crc = crc32fast::hash(&buf);
    LittleEndian::write_u32(&mut scratch[..4], crc);
    buf.extend_from_slice(&scratch[..4]);

    let tmp = dir.join(INDEX_TMP_FILE);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dir.join(INDEX_FILE))?;
    Ok(buf.len() as u64)
}

fn load_index(path: &Path) -> Result<Option<IndexSnapshot>> {
    let buf = match fs::read(path) {
        Ok(buf) => buf,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let corrupt = |what: &str| StoreError::Corruption(format!("{}: {}", path.display(), what));

    if buf.len() < INDEX_HEADER_LEN + 4 {
        return Err(corrupt("index file too short"));
    }
    let (body, trailer) = buf.split_at(buf.len() - 4);
    if crc32fast::hash(body) != LittleEndian::read_u32(trailer) {
        return Err(corrupt("index checksum mismatch"));
    }
    if body[0..4] != INDEX_MAGIC {
        return Err(corrupt("bad index magic"));
    }
    if LittleEndian::read_u32(&body[4..8]) != INDEX_VERSION {
        return Err(corrupt("unsupported index version"));
    }
    let watermark = (
        LittleEndian::read_u64(&body[8..16]),
        LittleEndian::read_u64(&body[16..24]),
    );
    let count = LittleEndian::read_u64(&body[24..32]);

    let mut entries = BTreeMap::new();
    let mut pos = INDEX_HEADER_LEN;
    for _ in 0..count {
        if pos + 4 > body.len() {
            return Err(corrupt("truncated index entry"));
        }
        let key_len = LittleEndian::read_u32(&body[pos..pos + 4]) as usize;
        pos += 4;
        if pos + key_len + 20 > body.len() {
            return Err(corrupt("truncated index entry"));
        }
        let key = body[pos..pos + key_len].to_vec();
        pos += key_len;
        let ptr = Pointer {
            segment: LittleEndian::read_u64(&body[pos..pos + 8]),
            offset: LittleEndian::read_u64(&body[pos + 8..pos + 16]),
            len: LittleEndian::read_u32(&body[pos + 16..pos + 20]),
        };
        pos += 20;
        entries.insert(key, ptr);
    }

    Ok(Some(IndexSnapshot { watermark, entries }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_segments() -> EngineOptions {
        EngineOptions {
            name: "test".to_string(),
            value_log_file_size: 256,
            ..EngineOptions::default()
        }
    }

    #[test]
    fn test_set_get_delete() {
        let dir = TempDir::new().unwrap();
        let engine = LogEngine::open(dir.path(), EngineOptions::default()).unwrap();

        engine.set(b"a", b"1").unwrap();
        engine.set(b"b", b"2").unwrap();
        assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));

        engine.set(b"a", b"10").unwrap();
        assert_eq!(engine.get(b"a").unwrap(), Some(b"10".to_vec()));

        engine.delete(b"a").unwrap();
        assert_eq!(engine.get(b"a").unwrap(), None);
        assert_eq!(engine.key_count(), 1);
    }

    #[test]
    fn test_scan_prefix_is_ordered_and_bounded() {
        let dir = TempDir::new().unwrap();
        let engine = LogEngine::open(dir.path(), EngineOptions::default()).unwrap();
        engine.set(b"t:b", b"2").unwrap();
        engine.set(b"t:a", b"1").unwrap();
        engine.set(b"s:a", b"x").unwrap();
        engine.set(b"u:a", b"y").unwrap();

        let got = engine.scan_prefix(b"t:").unwrap();
        assert_eq!(
            got,
            vec![
                (b"t:a".to_vec(), b"1".to_vec()),
                (b"t:b".to_vec(), b"2".to_vec())
            ]
        );
    }

    #[test]
    fn test_reopen_replays_value_log() {
        let dir = TempDir::new().unwrap();
        {
            let engine = LogEngine::open(dir.path(), small_segments()).unwrap();
            for i in 0..50u32 {
                engine.set(format!("k{}", i).as_bytes(), &i.to_le_bytes()).unwrap();
            }
            engine.delete(b"k7").unwrap();
            engine.close().unwrap();
        }
        let engine = LogEngine::open(dir.path(), small_segments()).unwrap();
        assert_eq!(engine.key_count(), 49);
        assert_eq!(engine.get(b"k7").unwrap(), None);
        assert_eq!(engine.get(b"k42").unwrap(), Some(42u32.to_le_bytes().to_vec()));
    }

    #[test]
    fn test_reopen_after_flatten_uses_snapshot_and_tail() {
        let dir = TempDir::new().unwrap();
        {
            let engine = LogEngine::open(dir.path(), small_segments()).unwrap();
            engine.set(b"before", b"1").unwrap();
            engine.flatten(2).unwrap();
            engine.set(b"after", b"2").unwrap();
            engine.delete(b"before").unwrap();
            engine.close().unwrap();
        }
        assert!(dir.path().join(INDEX_FILE).exists());

        let engine = LogEngine::open(dir.path(), small_segments()).unwrap();
        assert_eq!(engine.get(b"before").unwrap(), None);
        assert_eq!(engine.get(b"after").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_size_reports_index_and_value_log() {
        let dir = TempDir::new().unwrap();
        let engine = LogEngine::open(dir.path(), EngineOptions::default()).unwrap();
        assert_eq!(engine.size(), (0, 0));

        engine.set(b"key", b"value").unwrap();
        let (index, vlog) = engine.size();
        assert_eq!(index, 0);
        assert!(vlog > 0);

        engine.flatten(1).unwrap();
        let (index, _) = engine.size();
        assert!(index > 0);
    }

    #[test]
    fn test_value_log_gc_reclaims_stale_segment() {
        let dir = TempDir::new().unwrap();
        let engine = LogEngine::open(dir.path(), small_segments()).unwrap();

        // Fill several segments, then overwrite everything so older segments go stale.
        for round in 0..3u8 {
            for i in 0..20u8 {
                engine.set(&[b'k', i], &[round; 16]).unwrap();
            }
        }
        let segments_before = engine.segment_count();
        let (_, vlog_before) = engine.size();
        assert!(segments_before > 2);

        let mut rewrites = 0;
        while engine.run_value_log_gc(0.7).unwrap() == GcOutcome::Rewritten {
            rewrites += 1;
        }
        assert!(rewrites > 0);
        let (_, vlog_after) = engine.size();
        assert!(vlog_after < vlog_before);
        assert!(engine.segment_count() < segments_before);

        for i in 0..20u8 {
            assert_eq!(engine.get(&[b'k', i]).unwrap(), Some(vec![2u8; 16]));
        }
    }

    #[test]
    fn test_value_log_gc_nothing_to_reclaim() {
        let dir = TempDir::new().unwrap();
        let engine = LogEngine::open(dir.path(), EngineOptions::default()).unwrap();
        engine.set(b"k", b"v").unwrap();
        assert_eq!(engine.run_value_log_gc(0.7).unwrap(), GcOutcome::NoRewrite);
    }

    #[test]
    fn test_value_log_gc_rejects_bad_ratio() {
        let dir = TempDir::new().unwrap();
        let engine = LogEngine::open(dir.path(), EngineOptions::default()).unwrap();
        assert!(engine.run_value_log_gc(0.0).is_err());
        assert!(engine.run_value_log_gc(1.0).is_err());
    }

    #[test]
    fn test_gc_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let engine = LogEngine::open(dir.path(), small_segments()).unwrap();
            for round in 0..3u8 {
                for i in 0..20u8 {
                    engine.set(&[b'k', i], &[round; 16]).unwrap();
                }
            }
            while engine.run_value_log_gc(0.5).unwrap() == GcOutcome::Rewritten {}
            engine.close().unwrap();
        }
        let engine = LogEngine::open(dir.path(), small_segments()).unwrap();
        assert_eq!(engine.key_count(), 20);
        for i in 0..20u8 {
            assert_eq!(engine.get(&[b'k', i]).unwrap(), Some(vec![2u8; 16]));
        }
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        {
            let engine = LogEngine::open(dir.path(), EngineOptions::default()).unwrap();
            engine.set(b"good", b"1").unwrap();
            engine.close().unwrap();
        }
        let path = segment_path(dir.path(), 1);
        let good_len = fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            let partial = record::encode(RecordKind::Put, b"torn", b"value");
            file.write_all(&partial[..partial.len() / 2]).unwrap();
        }

        let engine = LogEngine::open(dir.path(), EngineOptions::default()).unwrap();
        assert_eq!(engine.get(b"good").unwrap(), Some(b"1".to_vec()));
        assert_eq!(engine.get(b"torn").unwrap(), None);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
    }

    #[test]
    fn test_torn_tail_without_truncate_fails() {
        let dir = TempDir::new().unwrap();
        {
            let engine = LogEngine::open(dir.path(), EngineOptions::default()).unwrap();
            engine.set(b"good", b"1").unwrap();
            engine.close().unwrap();
        }
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(segment_path(dir.path(), 1))
                .unwrap();
            file.write_all(&[0xAB; 5]).unwrap();
        }
        let options = EngineOptions {
            truncate: false,
            ..EngineOptions::default()
        };
        let result = LogEngine::open(dir.path(), options);
        assert!(matches!(result, Err(StoreError::Corruption(_))));
    }

    #[test]
    fn test_corrupt_index_falls_back_to_full_replay() {
        let dir = TempDir::new().unwrap();
        {
            let engine = LogEngine::open(dir.path(), EngineOptions::default()).unwrap();
            engine.set(b"k", b"v").unwrap();
            engine.flatten(1).unwrap();
            engine.close().unwrap();
        }
        fs::write(dir.path().join(INDEX_FILE), b"garbage").unwrap();

        let engine = LogEngine::open(dir.path(), EngineOptions::default()).unwrap();
        assert_eq!(engine.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_operations_fail_after_close() {
        let dir = TempDir::new().unwrap();
        let engine = LogEngine::open(dir.path(), EngineOptions::default()).unwrap();
        engine.close().unwrap();
        assert!(engine.get(b"k").is_err());
        assert!(engine.set(b"k", b"v").is_err());
        assert!(engine.flatten(1).is_err());
        // Closing twice is harmless.
        engine.close().unwrap();
    }

    #[test]
    fn test_compact_on_close_writes_snapshot() {
        let dir = TempDir::new().unwrap();
        let options = EngineOptions {
            compact_on_close: true,
            ..EngineOptions::default()
        };
        let engine = LogEngine::open(dir.path(), options).unwrap();
        engine.set(b"k", b"v").unwrap();
        engine.close().unwrap();
        assert!(dir.path().join(INDEX_FILE).exists());
    }

    #[test]
    fn test_gc_keeps_deletes_visible_to_full_replay() {
        let dir = TempDir::new().unwrap();
        {
            let engine = LogEngine::open(dir.path(), small_segments()).unwrap();
            // Segment 1: the doomed key plus values that stay live.
            engine.set(b"victim", b"old").unwrap();
            for i in 0..4u8 {
                engine.set(&[b'a', i], &[i; 41]).unwrap();
            }
            // Segment 2 onwards: the delete, buried under overwritten filler.
            engine.delete(b"victim").unwrap();
            for i in 0..20u8 {
                engine.set(b"f", &[i; 32]).unwrap();
            }
            while engine.run_value_log_gc(0.7).unwrap() == GcOutcome::Rewritten {}
            assert!(segment_path(dir.path(), 1).exists());
            assert!(!segment_path(dir.path(), 2).exists());
            engine.close().unwrap();
        }
        fs::write(dir.path().join(INDEX_FILE), b"garbage").unwrap();

        let engine = LogEngine::open(dir.path(), small_segments()).unwrap();
        assert_eq!(engine.get(b"victim").unwrap(), None);
        assert_eq!(engine.get(b"f").unwrap(), Some(vec![19u8; 32]));
        for i in 0..4u8 {
            assert_eq!(engine.get(&[b'a', i]).unwrap(), Some(vec![i; 41]));
        }
    }

    #[test]
    fn test_oversized_record_is_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = LogEngine::open(dir.path(), EngineOptions::default()).unwrap();
        engine.set(b"small", b"1").unwrap();

        let value = vec![7u8; record::MAX_BODY_LEN];
        let result = engine.set(b"big", &value);
        assert!(matches!(result, Err(StoreError::InvalidOperation(_))));
        drop(value);

        assert_eq!(engine.get(b"big").unwrap(), None);
        assert_eq!(engine.size().1, fs::metadata(segment_path(dir.path(), 1)).unwrap().len());
        engine.close().unwrap();

        let engine = LogEngine::open(dir.path(), EngineOptions::default()).unwrap();
        assert_eq!(engine.get(b"small").unwrap(), Some(b"1".to_vec()));
    }
}
