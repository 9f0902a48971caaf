//! Append-only segment files.
//!
//! Durable storage is an ordered set of segments under
//! `storage_path/segments/`.  Each segment is a write-only file with a fixed
//! 48-byte header followed by codec frames; every append is written, flushed,
//! and fsync'd, then journaled in the segment's manifest before the write is
//! acknowledged.  Sealed segments are immutable except for compaction, which
//! rewrites the live records into a fresh segment and unlinks the old files.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::{Codec, RecordBody, RecordKind};
use crate::error::{MemoryError, Result};
use crate::manifest::{self, ManifestEntry, ManifestWriter, manifest_path};

pub const SEGMENT_MAGIC: [u8; 4] = *b"MSEG";
pub const SEGMENT_VERSION: u8 = 1;
pub const SEGMENT_HEADER_LEN: u64 = 48;

const FLAG_SEALED: u8 = 0b0000_0001;

/// Fixed-size segment file header, rewritten in place when the segment is
/// sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub segment_id: u64,
    pub created_at_ms: i64,
    pub sealed: bool,
    pub record_count: u64,
    pub min_created_ms: i64,
    pub max_created_ms: i64,
}

impl SegmentHeader {
    fn encode(&self) -> [u8; SEGMENT_HEADER_LEN as usize] {
        let mut buf = [0u8; SEGMENT_HEADER_LEN as usize];
        buf[..4].copy_from_slice(&SEGMENT_MAGIC);
        buf[4] = SEGMENT_VERSION;
        buf[5] = if self.sealed { FLAG_SEALED } else { 0 };
        buf[8..16].copy_from_slice(&self.segment_id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.created_at_ms.to_le_bytes());
        buf[24..32].copy_from_slice(&self.record_count.to_le_bytes());
        buf[32..40].copy_from_slice(&self.min_created_ms.to_le_bytes());
        buf[40..48].copy_from_slice(&self.max_created_ms.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; SEGMENT_HEADER_LEN as usize], segment_id: u64) -> Result<Self> {
        if buf[..4] != SEGMENT_MAGIC {
            return Err(MemoryError::CorruptRecord {
                segment: segment_id,
                offset: 0,
                reason: "bad segment magic".into(),
            });
        }
        if buf[4] != SEGMENT_VERSION {
            return Err(MemoryError::CorruptRecord {
                segment: segment_id,
                offset: 0,
                reason: format!("unsupported segment version {}", buf[4]),
            });
        }
        Ok(Self {
            segment_id: read_u64(buf, 8),
            created_at_ms: read_u64(buf, 16) as i64,
            sealed: buf[5] & FLAG_SEALED != 0,
            record_count: read_u64(buf, 24),
            min_created_ms: read_u64(buf, 32) as i64,
            max_created_ms: read_u64(buf, 40) as i64,
        })
    }
}

fn read_u64(buf: &[u8; SEGMENT_HEADER_LEN as usize], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(word)
}

/// Where a frame lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLocation {
    pub segment_id: u64,
    pub offset: u64,
    pub len: u32,
}

/// Catalog entry tracked for every on-disk segment.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub sealed: bool,
    pub bytes: u64,
    /// Frames appended (puts, tombstones, access updates).
    pub total_records: u64,
    /// Put frames still referenced by the indexes.
    pub live_records: u64,
}

impl SegmentInfo {
    pub fn live_ratio(&self) -> f64 {
        if self.total_records == 0 {
            1.0
        } else {
            self.live_records as f64 / self.total_records as f64
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SegmentStats {
    pub segment_count: usize,
    pub total_bytes: u64,
    pub total_records: u64,
    pub live_records: u64,
}

struct ActiveSegment {
    segment_id: u64,
    file: File,
    manifest: ManifestWriter,
    offset: u64,
    record_count: u64,
    created_at_ms: i64,
    min_created_ms: i64,
    max_created_ms: i64,
}

pub struct SegmentStore {
    dir: PathBuf,
    codec: Codec,
    roll_bytes: u64,
    next_segment_id: AtomicU64,
    active: Mutex<ActiveSegment>,
    catalog: RwLock<BTreeMap<u64, SegmentInfo>>,
}

pub fn segment_path(dir: &Path, segment_id: u64) -> PathBuf {
    dir.join(format!("{segment_id:010}.seg"))
}

fn parse_segment_id(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    if path.extension()?.to_str()? != "seg" {
        return None;
    }
    stem.parse().ok()
}

impl SegmentStore {
    /// Open the segment directory, adopt the newest unsealed segment as the
    /// active one (truncating any bytes past its manifest watermark), and
    /// build the catalog.  `live_records` counts are provisional until the
    /// store recalibrates them from the indexes.
    pub fn open(dir: impl Into<PathBuf>, codec: Codec, roll_bytes: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut catalog = BTreeMap::new();
        let mut max_id = 0u64;
        for dir_entry in fs::read_dir(&dir)? {
            let path = dir_entry?.path();
            let Some(segment_id) = parse_segment_id(&path) else {
                continue;
            };
            let header = read_header(&path, segment_id)?;
            let bytes = fs::metadata(&path)?.len();
            let total_records = if header.sealed {
                header.record_count
            } else {
                manifest::load(&manifest_path(&dir, segment_id))?.len() as u64
            };
            catalog.insert(
                segment_id,
                SegmentInfo {
                    sealed: header.sealed,
                    bytes,
                    total_records,
                    live_records: total_records,
                },
            );
            max_id = max_id.max(segment_id);
        }

        let active_id = catalog
            .iter()
            .rev()
            .find(|(_, info)| !info.sealed)
            .map(|(id, _)| *id);

        let active = match active_id {
            Some(segment_id) => open_active(&dir, segment_id)?,
            None => {
                let segment_id = max_id + 1;
                let active = create_segment(&dir, segment_id)?;
                catalog.insert(
                    segment_id,
                    SegmentInfo {
                        sealed: false,
                        bytes: SEGMENT_HEADER_LEN,
                        total_records: 0,
                        live_records: 0,
                    },
                );
                active
            }
        };
        // Compaction can leave sealed segments with ids above the active one,
        // so the next id must clear every segment on disk.
        let next_segment_id = AtomicU64::new(max_id.max(active.segment_id) + 1);

        info!(
            dir = %dir.display(),
            segments = catalog.len(),
            active = active.segment_id,
            "segment store opened"
        );

        Ok(Self {
            dir,
            codec,
            roll_bytes,
            next_segment_id,
            active: Mutex::new(active),
            catalog: RwLock::new(catalog),
        })
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Append a frame to the active segment: write, flush, fsync, then
    /// journal in the manifest.  Globally serialized; this is the only
    /// critical section writers to different users share.
    pub fn append(
        &self,
        body: &RecordBody,
        index_version_pre: u64,
        index_version_post: u64,
    ) -> Result<RecordLocation> {
        let frame = self.codec.encode(body)?;
        let mut active = self.active.lock();

        if active.record_count > 0 && active.offset + frame.len() as u64 > self.roll_bytes {
            self.roll_locked(&mut active)?;
        }

        let location = RecordLocation {
            segment_id: active.segment_id,
            offset: active.offset,
            len: frame.len() as u32,
        };
        active.file.write_all(&frame)?;
        active.file.flush()?;
        active.file.sync_data()?;

        active.manifest.append(&ManifestEntry {
            record_id: body.record_id(),
            kind: body.kind(),
            segment_id: location.segment_id,
            offset: location.offset,
            len: location.len,
            index_version_pre,
            index_version_post,
        })?;

        active.offset += frame.len() as u64;
        active.record_count += 1;
        if let RecordBody::Put(memory) = body {
            let created = memory.created_ms();
            active.min_created_ms = active.min_created_ms.min(created);
            active.max_created_ms = active.max_created_ms.max(created);
        }

        let mut catalog = self.catalog.write();
        if let Some(info) = catalog.get_mut(&location.segment_id) {
            info.bytes = active.offset;
            info.total_records = active.record_count;
            if body.kind() == RecordKind::Put {
                info.live_records += 1;
            }
        }
        Ok(location)
    }

    /// Read and decode the frame at `location`.  Uses an independent read
    /// handle, so readers never contend with the appender.
    pub fn read(&self, location: RecordLocation) -> Result<RecordBody> {
        let path = segment_path(&self.dir, location.segment_id);
        let mut file = File::open(&path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => MemoryError::CorruptRecord {
                segment: location.segment_id,
                offset: location.offset,
                reason: "segment file missing".into(),
            },
            _ => MemoryError::Io(err),
        })?;
        file.seek(SeekFrom::Start(location.offset))?;
        let mut frame = vec![0u8; location.len as usize];
        file.read_exact(&mut frame).map_err(|err| match err.kind() {
            std::io::ErrorKind::UnexpectedEof => MemoryError::CorruptRecord {
                segment: location.segment_id,
                offset: location.offset,
                reason: "frame extends past end of segment".into(),
            },
            _ => MemoryError::Io(err),
        })?;
        Codec::decode(&frame, location.segment_id, location.offset)
    }

    /// A put at `segment_id` is no longer referenced (tombstoned, evicted,
    /// or superseded by a rewrite).
    pub fn note_dead(&self, segment_id: u64) {
        let mut catalog = self.catalog.write();
        if let Some(info) = catalog.get_mut(&segment_id) {
            info.live_records = info.live_records.saturating_sub(1);
        }
    }

    /// Replace provisional live counts with authoritative per-segment counts
    /// derived from the indexes after startup replay.
    pub fn recalibrate_live(&self, live_by_segment: &HashMap<u64, u64>) {
        let mut catalog = self.catalog.write();
        for (segment_id, info) in catalog.iter_mut() {
            info.live_records = live_by_segment.get(segment_id).copied().unwrap_or(0);
        }
    }

    pub fn active_segment_id(&self) -> u64 {
        self.active.lock().segment_id
    }

    /// Sealed segments whose live fraction has dropped to or below
    /// `threshold`.  `include_any_dead` widens the pick to every sealed
    /// segment carrying at least one dead record (forced compaction).
    pub fn compactable(&self, threshold: f64, include_any_dead: bool) -> Vec<u64> {
        let catalog = self.catalog.read();
        catalog
            .iter()
            .filter(|(_, info)| info.sealed)
            .filter(|(_, info)| {
                if include_any_dead {
                    info.live_records < info.total_records
                } else {
                    info.live_ratio() < threshold
                }
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Rewrite `segment_id` keeping only the given live records.  Returns the
    /// new location for every rewritten record so the caller can repoint the
    /// indexes.  The old segment and its manifest are unlinked only after the
    /// replacement's manifest has been fsync'd.
    pub fn compact(
        &self,
        segment_id: u64,
        live: &[(Uuid, RecordLocation)],
        index_version: u64,
    ) -> Result<Vec<(Uuid, RecordLocation)>> {
        {
            let catalog = self.catalog.read();
            match catalog.get(&segment_id) {
                Some(info) if info.sealed => {}
                Some(_) => {
                    return Err(MemoryError::Internal(format!(
                        "refusing to compact unsealed segment {segment_id}"
                    )));
                }
                None => {
                    return Err(MemoryError::NotFound(format!("segment {segment_id}")));
                }
            }
        }

        let mut moved = Vec::with_capacity(live.len());
        if live.is_empty() {
            remove_segment_files(&self.dir, segment_id)?;
            self.catalog.write().remove(&segment_id);
            info!(segment = segment_id, "dropped fully-dead segment");
            return Ok(moved);
        }

        let new_id = self.next_segment_id.fetch_add(1, Ordering::SeqCst);
        let mut target = create_segment(&self.dir, new_id)?;

        for (record_id, old_location) in live {
            let body = self.read(*old_location)?;
            let frame = self.codec.encode(&body)?;
            let new_location = RecordLocation {
                segment_id: new_id,
                offset: target.offset,
                len: frame.len() as u32,
            };
            target.file.write_all(&frame)?;
            target.record_count += 1;
            target.offset += frame.len() as u64;
            if let RecordBody::Put(memory) = &body {
                let created = memory.created_ms();
                target.min_created_ms = target.min_created_ms.min(created);
                target.max_created_ms = target.max_created_ms.max(created);
            }
            target.manifest.append(&ManifestEntry {
                record_id: *record_id,
                kind: body.kind(),
                segment_id: new_id,
                offset: new_location.offset,
                len: new_location.len,
                index_version_pre: index_version,
                index_version_post: index_version,
            })?;
            moved.push((*record_id, new_location));
        }

        target.file.flush()?;
        target.file.sync_data()?;
        seal_file(&mut target)?;

        {
            let mut catalog = self.catalog.write();
            catalog.insert(
                new_id,
                SegmentInfo {
                    sealed: true,
                    bytes: target.offset,
                    total_records: target.record_count,
                    live_records: target.record_count,
                },
            );
        }

        remove_segment_files(&self.dir, segment_id)?;
        self.catalog.write().remove(&segment_id);

        info!(
            from = segment_id,
            to = new_id,
            live = live.len(),
            "segment compacted"
        );
        Ok(moved)
    }

    /// Seal the active segment and open a fresh one.  Exposed for the
    /// snapshot path, which wants sealed segments at snapshot boundaries.
    pub fn roll(&self) -> Result<()> {
        let mut active = self.active.lock();
        if active.record_count == 0 {
            return Ok(());
        }
        self.roll_locked(&mut active)
    }

    pub fn flush(&self) -> Result<()> {
        let active = self.active.lock();
        active.file.sync_data()?;
        Ok(())
    }

    pub fn stats(&self) -> SegmentStats {
        let catalog = self.catalog.read();
        let mut stats = SegmentStats {
            segment_count: catalog.len(),
            ..SegmentStats::default()
        };
        for info in catalog.values() {
            stats.total_bytes += info.bytes;
            stats.total_records += info.total_records;
            stats.live_records += info.live_records;
        }
        stats
    }

    fn roll_locked(&self, active: &mut ActiveSegment) -> Result<()> {
        seal_file(active)?;
        {
            let mut catalog = self.catalog.write();
            if let Some(info) = catalog.get_mut(&active.segment_id) {
                info.sealed = true;
                info.bytes = active.offset;
                info.total_records = active.record_count;
            }
        }

        let new_id = self.next_segment_id.fetch_add(1, Ordering::SeqCst);
        let replacement = create_segment(&self.dir, new_id)?;
        debug!(sealed = active.segment_id, opened = new_id, "segment rolled");
        *active = replacement;
        self.catalog.write().insert(
            new_id,
            SegmentInfo {
                sealed: false,
                bytes: SEGMENT_HEADER_LEN,
                total_records: 0,
                live_records: 0,
            },
        );
        Ok(())
    }
}

fn read_header(path: &Path, segment_id: u64) -> Result<SegmentHeader> {
    let mut file = File::open(path)?;
    let mut buf = [0u8; SEGMENT_HEADER_LEN as usize];
    file.read_exact(&mut buf).map_err(|err| match err.kind() {
        std::io::ErrorKind::UnexpectedEof => MemoryError::CorruptRecord {
            segment: segment_id,
            offset: 0,
            reason: "segment shorter than its header".into(),
        },
        _ => MemoryError::Io(err),
    })?;
    SegmentHeader::decode(&buf, segment_id)
}

fn create_segment(dir: &Path, segment_id: u64) -> Result<ActiveSegment> {
    let path = segment_path(dir, segment_id);
    let mut file = OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .open(&path)?;
    let now_ms = unix_now_ms();
    let header = SegmentHeader {
        segment_id,
        created_at_ms: now_ms,
        sealed: false,
        record_count: 0,
        min_created_ms: i64::MAX,
        max_created_ms: i64::MIN,
    };
    file.write_all(&header.encode())?;
    file.sync_data()?;

    let manifest = ManifestWriter::open(manifest_path(dir, segment_id))?;
    Ok(ActiveSegment {
        segment_id,
        file,
        manifest,
        offset: SEGMENT_HEADER_LEN,
        record_count: 0,
        created_at_ms: now_ms,
        min_created_ms: i64::MAX,
        max_created_ms: i64::MIN,
    })
}

/// Reopen an unsealed segment for append.  The manifest is the authority on
/// how far acknowledged writes reach; anything past that watermark is a torn
/// unacknowledged tail and is truncated away.
fn open_active(dir: &Path, segment_id: u64) -> Result<ActiveSegment> {
    let path = segment_path(dir, segment_id);
    let entries = manifest::load(&manifest_path(dir, segment_id))?;
    let watermark = entries
        .iter()
        .map(ManifestEntry::end_offset)
        .max()
        .unwrap_or(SEGMENT_HEADER_LEN);

    let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
    let file_len = file.metadata()?.len();
    if file_len > watermark {
        warn!(
            segment = segment_id,
            torn_bytes = file_len - watermark,
            "truncating unacknowledged tail"
        );
        file.set_len(watermark)?;
        file.sync_data()?;
    }
    file.seek(SeekFrom::Start(watermark.min(file_len)))?;

    let header = read_header(&path, segment_id)?;
    let mut min_created_ms = i64::MAX;
    let mut max_created_ms = i64::MIN;
    if header.min_created_ms != i64::MAX {
        min_created_ms = header.min_created_ms;
        max_created_ms = header.max_created_ms;
    }

    let manifest = ManifestWriter::open(manifest_path(dir, segment_id))?;
    Ok(ActiveSegment {
        segment_id,
        file,
        manifest,
        offset: watermark.min(file_len.max(SEGMENT_HEADER_LEN)),
        record_count: entries.len() as u64,
        created_at_ms: header.created_at_ms,
        min_created_ms,
        max_created_ms,
    })
}

fn seal_file(active: &mut ActiveSegment) -> Result<()> {
    let header = SegmentHeader {
        segment_id: active.segment_id,
        created_at_ms: active.created_at_ms,
        sealed: true,
        record_count: active.record_count,
        min_created_ms: active.min_created_ms,
        max_created_ms: active.max_created_ms,
    };
    active.file.seek(SeekFrom::Start(0))?;
    active.file.write_all(&header.encode())?;
    active.file.seek(SeekFrom::Start(active.offset))?;
    active.file.sync_data()?;
    Ok(())
}

fn unix_now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

fn remove_segment_files(dir: &Path, segment_id: u64) -> Result<()> {
    fs::remove_file(segment_path(dir, segment_id))?;
    let manifest = manifest_path(dir, segment_id);
    if manifest.exists() {
        fs::remove_file(manifest)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::{RecordLocation, SEGMENT_HEADER_LEN, SegmentStore, segment_path};
    use crate::codec::{Codec, RecordBody, Tombstone};
    use crate::error::MemoryError;
    use crate::record::Memory;

    fn codec() -> Codec {
        Codec::new(true, 1024)
    }

    fn put(content: &str) -> RecordBody {
        let now = Utc::now();
        RecordBody::Put(Memory {
            id: Uuid::now_v7(),
            user_id: "u1".into(),
            session_id: "s1".into(),
            content: content.into(),
            metadata: Default::default(),
            importance: 0.5,
            initial_importance: 0.5,
            created_at: now,
            expires_at: None,
            last_accessed_at: now,
            access_count: 0,
        })
    }

    #[test]
    fn append_then_read_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SegmentStore::open(dir.path(), codec(), 1 << 20).expect("open");

        let body = put("hello segment");
        let location = store.append(&body, 0, 1).expect("append");
        assert_eq!(location.offset, SEGMENT_HEADER_LEN);

        let loaded = store.read(location).expect("read");
        assert_eq!(loaded, body);
    }

    #[test]
    fn rolls_to_a_new_segment_when_full() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SegmentStore::open(dir.path(), codec(), 256).expect("open");

        let mut locations = Vec::new();
        for i in 0..8 {
            let body = put(&format!("record number {i} with some padding text"));
            locations.push((body.clone(), store.append(&body, i, i + 1).expect("append")));
        }
        assert!(store.stats().segment_count > 1, "expected at least one roll");

        for (body, location) in &locations {
            assert_eq!(&store.read(*location).expect("read"), body);
        }
    }

    #[test]
    fn reopen_resumes_after_torn_tail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let body = put("durable");
        let first;
        {
            let store = SegmentStore::open(dir.path(), codec(), 1 << 20).expect("open");
            first = store.append(&body, 0, 1).expect("append");
            // Simulate a torn unacknowledged write past the manifest watermark.
            let path = segment_path(dir.path(), first.segment_id);
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(path)
                .expect("reopen");
            use std::io::Write;
            file.write_all(b"partial-frame-garbage").expect("tear");
        }

        let store = SegmentStore::open(dir.path(), codec(), 1 << 20).expect("reopen");
        assert_eq!(store.read(first).expect("read"), body);

        // The torn tail was truncated, so the next append lands cleanly.
        let second = store.append(&put("after recovery"), 1, 2).expect("append");
        assert_eq!(second.offset, first.offset + first.len as u64);
    }

    #[test]
    fn compaction_preserves_live_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SegmentStore::open(dir.path(), codec(), 512).expect("open");

        let keep_body = put("keep me");
        let keep_id = keep_body.record_id();
        let keep_location = store.append(&keep_body, 0, 1).expect("append");
        let drop_body = put("drop me");
        store.append(&drop_body, 1, 2).expect("append");
        let tombstone = RecordBody::Tombstone(Tombstone {
            id: drop_body.record_id(),
            user_id: "u1".into(),
            session_id: "s1".into(),
        });
        store.append(&tombstone, 2, 3).expect("append");
        let sealed_segment = keep_location.segment_id;
        store.roll().expect("roll");
        store.note_dead(sealed_segment);

        let moved = store
            .compact(sealed_segment, &[(keep_id, keep_location)], 3)
            .expect("compact");
        assert_eq!(moved.len(), 1);
        let (moved_id, new_location) = moved[0];
        assert_eq!(moved_id, keep_id);
        assert_ne!(new_location.segment_id, sealed_segment);
        assert_eq!(store.read(new_location).expect("read"), keep_body);
        assert!(!segment_path(dir.path(), sealed_segment).exists());
    }

    #[test]
    fn read_of_missing_segment_is_corrupt_not_io() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SegmentStore::open(dir.path(), codec(), 1 << 20).expect("open");
        let bogus = RecordLocation {
            segment_id: 999,
            offset: SEGMENT_HEADER_LEN,
            len: 32,
        };
        assert!(matches!(
            store.read(bogus),
            Err(MemoryError::CorruptRecord { segment: 999, .. })
        ));
    }
}
