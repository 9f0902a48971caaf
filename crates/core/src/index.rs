//! In-memory secondary indexes.
//!
//! Five structures, all maintained from one `apply` entry point so segment
//! writes and manifest replay share a single code path: by-user, by-session,
//! hourly time buckets, fixed importance buckets, and the inverted term
//! index.  Every mutation is idempotent keyed on record id, which makes
//! startup replay safe to over-apply.  The whole structure snapshots to disk
//! periodically and reloads from the newest snapshot plus manifest tail.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::analyzer;
use crate::codec::{AccessUpdate, RecordBody, Tombstone};
use crate::error::{MemoryError, Result};
use crate::record::Memory;
use crate::segment::RecordLocation;

/// Importance is partitioned into ten fixed-width buckets over [0, 1].
pub const IMPORTANCE_BUCKET_COUNT: u8 = 10;
/// Time index granularity: one bucket per hour.
pub const TIME_BUCKET_MS: i64 = 3_600_000;

pub fn importance_bucket(importance: f32) -> u8 {
    // The epsilon absorbs f32 representation error at bucket boundaries
    // (0.9f32 scales to 8.9999998, which must land in bucket 9).
    let scaled = importance.clamp(0.0, 1.0) as f64 * IMPORTANCE_BUCKET_COUNT as f64;
    ((scaled + 1e-6).floor() as u8).min(IMPORTANCE_BUCKET_COUNT - 1)
}

pub fn time_bucket(created_ms: i64) -> i64 {
    created_ms.div_euclid(TIME_BUCKET_MS)
}

/// Compact per-record metadata held in memory.  Carries enough for the
/// planner and the decay engine to filter and rank without touching disk;
/// the segment read happens only for records that make the final cut.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocEntry {
    pub user_id: String,
    pub session_id: String,
    pub created_ms: i64,
    pub importance: f32,
    pub initial_importance: f32,
    pub expires_ms: Option<i64>,
    pub last_accessed_ms: i64,
    pub access_count: u64,
    pub location: RecordLocation,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStats {
    pub version: u64,
    pub memory_count: usize,
    pub user_count: usize,
    pub session_count: usize,
    pub term_count: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Indexes {
    version: u64,
    docs: HashMap<Uuid, DocEntry>,
    /// user → (created_ms, id), iterated in reverse for newest-first scans.
    by_user: HashMap<String, BTreeSet<(i64, Uuid)>>,
    by_session: HashMap<String, BTreeSet<(i64, Uuid)>>,
    /// First writer wins; cross-user reuse of a session id is rejected
    /// upstream against this map.
    session_owner: HashMap<String, String>,
    by_time: HashMap<(String, i64), HashSet<Uuid>>,
    by_importance: HashMap<(String, u8), HashSet<Uuid>>,
    /// term → posting map of id → term frequency.
    terms: HashMap<String, HashMap<Uuid, u32>>,
    /// Unique terms per doc, kept so removal doesn't rescan every posting.
    doc_terms: HashMap<Uuid, Vec<String>>,
    /// segment id → end offset of the last applied record.
    applied: HashMap<u64, u64>,
}

impl Indexes {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn set_version(&mut self, version: u64) {
        self.version = self.version.max(version);
    }

    /// Apply one journaled record.  Dispatches on kind; every path is
    /// idempotent keyed on the record id.
    pub fn apply(&mut self, body: &RecordBody, location: RecordLocation) {
        match body {
            RecordBody::Put(memory) => self.apply_put(memory, location),
            RecordBody::Tombstone(tombstone) => self.apply_tombstone(tombstone, location),
            RecordBody::Access(access) => self.apply_access(access, location),
        }
    }

    pub fn apply_put(&mut self, memory: &Memory, location: RecordLocation) {
        self.advance_watermark(location);
        if let Some(existing) = self.docs.get(&memory.id) {
            if existing.location == location {
                return;
            }
            // Rewrite (attenuation or compaction move): drop the old entries
            // before re-inserting under the new location and importance.
            self.remove_doc(memory.id);
        }

        let entry = DocEntry {
            user_id: memory.user_id.clone(),
            session_id: memory.session_id.clone(),
            created_ms: memory.created_ms(),
            importance: memory.importance,
            initial_importance: memory.initial_importance,
            expires_ms: memory.expires_at.map(|at| at.timestamp_millis()),
            last_accessed_ms: memory.last_accessed_at.timestamp_millis(),
            access_count: memory.access_count,
            location,
        };

        self.by_user
            .entry(entry.user_id.clone())
            .or_default()
            .insert((entry.created_ms, memory.id));
        self.by_session
            .entry(entry.session_id.clone())
            .or_default()
            .insert((entry.created_ms, memory.id));
        self.session_owner
            .entry(entry.session_id.clone())
            .or_insert_with(|| entry.user_id.clone());
        self.by_time
            .entry((entry.user_id.clone(), time_bucket(entry.created_ms)))
            .or_default()
            .insert(memory.id);
        self.by_importance
            .entry((entry.user_id.clone(), importance_bucket(entry.importance)))
            .or_default()
            .insert(memory.id);

        let frequencies = analyzer::term_frequencies(&memory.content);
        let mut unique_terms = Vec::with_capacity(frequencies.len());
        for (term, tf) in frequencies {
            self.terms
                .entry(term.clone())
                .or_default()
                .insert(memory.id, tf);
            unique_terms.push(term);
        }
        unique_terms.sort_unstable();
        self.doc_terms.insert(memory.id, unique_terms);
        self.docs.insert(memory.id, entry);
    }

    pub fn apply_tombstone(&mut self, tombstone: &Tombstone, location: RecordLocation) {
        self.advance_watermark(location);
        self.remove_doc(tombstone.id);
    }

    pub fn apply_access(&mut self, access: &AccessUpdate, location: RecordLocation) {
        self.advance_watermark(location);
        if let Some(entry) = self.docs.get_mut(&access.id) {
            // Access metadata only ever advances.
            entry.last_accessed_ms = entry
                .last_accessed_ms
                .max(access.last_accessed_at.timestamp_millis());
            entry.access_count = entry.access_count.max(access.access_count);
        }
    }

    /// Remove every trace of a record.  Returns the removed entry so callers
    /// can adjust segment live counts.
    pub fn remove_doc(&mut self, id: Uuid) -> Option<DocEntry> {
        let entry = self.docs.remove(&id)?;

        if let Some(set) = self.by_user.get_mut(&entry.user_id) {
            set.remove(&(entry.created_ms, id));
            if set.is_empty() {
                self.by_user.remove(&entry.user_id);
            }
        }
        if let Some(set) = self.by_session.get_mut(&entry.session_id) {
            set.remove(&(entry.created_ms, id));
            if set.is_empty() {
                self.by_session.remove(&entry.session_id);
                self.session_owner.remove(&entry.session_id);
            }
        }
        let time_key = (entry.user_id.clone(), time_bucket(entry.created_ms));
        if let Some(set) = self.by_time.get_mut(&time_key) {
            set.remove(&id);
            if set.is_empty() {
                self.by_time.remove(&time_key);
            }
        }
        let importance_key = (entry.user_id.clone(), importance_bucket(entry.importance));
        if let Some(set) = self.by_importance.get_mut(&importance_key) {
            set.remove(&id);
            if set.is_empty() {
                self.by_importance.remove(&importance_key);
            }
        }
        if let Some(doc_terms) = self.doc_terms.remove(&id) {
            for term in doc_terms {
                if let Some(posting) = self.terms.get_mut(&term) {
                    posting.remove(&id);
                    if posting.is_empty() {
                        self.terms.remove(&term);
                    }
                }
            }
        }
        Some(entry)
    }

    fn advance_watermark(&mut self, location: RecordLocation) {
        let end = location.offset + location.len as u64;
        let watermark = self.applied.entry(location.segment_id).or_insert(0);
        *watermark = (*watermark).max(end);
    }

    pub fn watermark(&self, segment_id: u64) -> u64 {
        self.applied.get(&segment_id).copied().unwrap_or(0)
    }

    // ── Lookups ────────────────────────────────────────────────────────────

    pub fn doc(&self, id: &Uuid) -> Option<&DocEntry> {
        self.docs.get(id)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.docs.contains_key(id)
    }

    pub fn memory_count(&self) -> usize {
        self.docs.len()
    }

    pub fn user_memory_count(&self, user_id: &str) -> usize {
        self.by_user.get(user_id).map_or(0, BTreeSet::len)
    }

    /// All users with at least one live memory, lexicographic.
    pub fn users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.by_user.keys().cloned().collect();
        users.sort_unstable();
        users
    }

    /// Newest-first ids for one user.
    pub fn user_docs_newest_first(&self, user_id: &str) -> impl Iterator<Item = Uuid> + '_ {
        self.by_user
            .get(user_id)
            .into_iter()
            .flat_map(|set| set.iter().rev().map(|(_, id)| *id))
    }

    pub fn session_docs_newest_first(&self, session_id: &str) -> impl Iterator<Item = Uuid> + '_ {
        self.by_session
            .get(session_id)
            .into_iter()
            .flat_map(|set| set.iter().rev().map(|(_, id)| *id))
    }

    pub fn session_owner(&self, session_id: &str) -> Option<&str> {
        self.session_owner.get(session_id).map(String::as_str)
    }

    /// Sessions with live memories for one user:
    /// `(session_id, memory_count, first_created_ms, last_created_ms)`.
    pub fn sessions_for_user(&self, user_id: &str) -> Vec<(String, usize, i64, i64)> {
        let mut sessions: Vec<(String, usize, i64, i64)> = self
            .session_owner
            .iter()
            .filter(|(_, owner)| owner.as_str() == user_id)
            .filter_map(|(session_id, _)| {
                let set = self.by_session.get(session_id)?;
                let first = set.iter().next()?.0;
                let last = set.iter().next_back()?.0;
                Some((session_id.clone(), set.len(), first, last))
            })
            .collect();
        sessions.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        sessions
    }

    pub fn session_count(&self) -> usize {
        self.session_owner.len()
    }

    pub fn time_bucket_ids(&self, user_id: &str, bucket: i64) -> Option<&HashSet<Uuid>> {
        self.by_time.get(&(user_id.to_string(), bucket))
    }

    pub fn importance_bucket_ids(&self, user_id: &str, bucket: u8) -> Option<&HashSet<Uuid>> {
        self.by_importance.get(&(user_id.to_string(), bucket))
    }

    pub fn posting(&self, term: &str) -> Option<&HashMap<Uuid, u32>> {
        self.terms.get(term)
    }

    pub fn document_frequency(&self, term: &str) -> usize {
        self.terms.get(term).map_or(0, HashMap::len)
    }

    /// Live put-record counts per segment, for catalog recalibration.
    pub fn live_by_segment(&self) -> HashMap<u64, u64> {
        let mut live = HashMap::new();
        for entry in self.docs.values() {
            *live.entry(entry.location.segment_id).or_insert(0u64) += 1;
        }
        live
    }

    /// Live records grouped by segment as `(id, location)` pairs, the shape
    /// compaction consumes.
    pub fn live_in_segment(&self, segment_id: u64) -> Vec<(Uuid, RecordLocation)> {
        let mut live: Vec<(Uuid, RecordLocation)> = self
            .docs
            .iter()
            .filter(|(_, entry)| entry.location.segment_id == segment_id)
            .map(|(id, entry)| (*id, entry.location))
            .collect();
        live.sort_unstable_by_key(|(_, location)| location.offset);
        live
    }

    pub fn repoint(&mut self, id: Uuid, location: RecordLocation) {
        self.advance_watermark(location);
        if let Some(entry) = self.docs.get_mut(&id) {
            entry.location = location;
        }
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            version: self.version,
            memory_count: self.docs.len(),
            user_count: self.by_user.len(),
            session_count: self.session_owner.len(),
            term_count: self.terms.len(),
        }
    }

    // ── Snapshots ──────────────────────────────────────────────────────────

    /// Write a full-image snapshot as `snapshot-<version>.idx`, temp file
    /// then rename so a crash never leaves a half-written snapshot behind.
    /// Older snapshots are unlinked after the new one is durable.
    pub fn write_snapshot(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let bytes = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|err| MemoryError::Internal(format!("snapshot encode failed: {err}")))?;

        let final_path = dir.join(format!("snapshot-{}.idx", self.version));
        let tmp_path = dir.join(format!("snapshot-{}.idx.tmp", self.version));
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;

        for (epoch, path) in list_snapshots(dir)? {
            if epoch < self.version {
                let _ = fs::remove_file(path);
            }
        }
        info!(version = self.version, path = %final_path.display(), "index snapshot written");
        Ok(final_path)
    }

    /// Load the newest readable snapshot, falling back through older ones if
    /// the newest fails to decode.
    pub fn load_newest(dir: &Path) -> Result<Option<Indexes>> {
        let mut snapshots = list_snapshots(dir)?;
        snapshots.sort_unstable_by_key(|(epoch, _)| std::cmp::Reverse(*epoch));
        for (epoch, path) in snapshots {
            let bytes = fs::read(&path)?;
            match bincode::serde::decode_from_slice::<Indexes, _>(
                &bytes,
                bincode::config::standard(),
            ) {
                Ok((indexes, _)) => {
                    info!(version = epoch, path = %path.display(), "index snapshot loaded");
                    return Ok(Some(indexes));
                }
                Err(err) => {
                    warn!(%err, path = %path.display(), "unreadable index snapshot, trying older");
                }
            }
        }
        Ok(None)
    }
}

fn list_snapshots(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut snapshots = Vec::new();
    if !dir.exists() {
        return Ok(snapshots);
    }
    for dir_entry in fs::read_dir(dir)? {
        let path = dir_entry?.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if let Some(epoch) = name
            .strip_prefix("snapshot-")
            .and_then(|rest| rest.strip_suffix(".idx"))
            .and_then(|epoch| epoch.parse::<u64>().ok())
        {
            snapshots.push((epoch, path));
        }
    }
    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::{Indexes, importance_bucket, time_bucket};
    use crate::codec::Tombstone;
    use crate::record::Memory;
    use crate::segment::RecordLocation;

    fn memory(user: &str, session: &str, content: &str, importance: f32) -> Memory {
        let now = Utc::now();
        Memory {
            id: Uuid::now_v7(),
            user_id: user.into(),
            session_id: session.into(),
            content: content.into(),
            metadata: Default::default(),
            importance,
            initial_importance: importance,
            created_at: now,
            expires_at: None,
            last_accessed_at: now,
            access_count: 0,
        }
    }

    fn location(segment_id: u64, offset: u64) -> RecordLocation {
        RecordLocation {
            segment_id,
            offset,
            len: 64,
        }
    }

    #[test]
    fn importance_buckets_cover_the_unit_interval() {
        assert_eq!(importance_bucket(0.0), 0);
        assert_eq!(importance_bucket(0.05), 0);
        assert_eq!(importance_bucket(0.45), 4);
        assert_eq!(importance_bucket(0.9), 9);
        assert_eq!(importance_bucket(1.0), 9);
    }

    #[test]
    fn put_populates_every_index() {
        let mut indexes = Indexes::default();
        let memory = memory("u1", "s1", "memory decay is fascinating", 0.8);
        indexes.apply_put(&memory, location(1, 48));

        assert!(indexes.contains(&memory.id));
        assert_eq!(indexes.user_memory_count("u1"), 1);
        assert_eq!(
            indexes.user_docs_newest_first("u1").collect::<Vec<_>>(),
            vec![memory.id]
        );
        assert_eq!(indexes.session_owner("s1"), Some("u1"));
        assert!(
            indexes
                .time_bucket_ids("u1", time_bucket(memory.created_ms()))
                .is_some_and(|set| set.contains(&memory.id))
        );
        assert!(
            indexes
                .importance_bucket_ids("u1", 8)
                .is_some_and(|set| set.contains(&memory.id))
        );
        assert!(
            indexes
                .posting("decay")
                .is_some_and(|posting| posting.contains_key(&memory.id))
        );
    }

    #[test]
    fn tombstone_removes_every_trace() {
        let mut indexes = Indexes::default();
        let memory = memory("u1", "s1", "short lived thought", 0.4);
        indexes.apply_put(&memory, location(1, 48));
        indexes.apply_tombstone(
            &Tombstone {
                id: memory.id,
                user_id: "u1".into(),
                session_id: "s1".into(),
            },
            location(1, 112),
        );

        assert!(!indexes.contains(&memory.id));
        assert_eq!(indexes.user_memory_count("u1"), 0);
        assert_eq!(indexes.session_owner("s1"), None);
        assert!(indexes.posting("thought").is_none());
        assert_eq!(indexes.watermark(1), 176);
    }

    #[test]
    fn reapplying_the_same_put_is_a_no_op() {
        let mut indexes = Indexes::default();
        let memory = memory("u1", "s1", "idempotent replay", 0.6);
        indexes.apply_put(&memory, location(1, 48));
        indexes.apply_put(&memory, location(1, 48));

        assert_eq!(indexes.memory_count(), 1);
        assert_eq!(indexes.user_memory_count("u1"), 1);
    }

    #[test]
    fn rewrite_moves_importance_bucket() {
        let mut indexes = Indexes::default();
        let mut memory = memory("u1", "s1", "slowly fading", 0.9);
        indexes.apply_put(&memory, location(1, 48));
        assert!(indexes.importance_bucket_ids("u1", 9).is_some());

        memory.importance = 0.35;
        indexes.apply_put(&memory, location(1, 160));

        assert!(indexes.importance_bucket_ids("u1", 9).is_none());
        assert!(
            indexes
                .importance_bucket_ids("u1", 3)
                .is_some_and(|set| set.contains(&memory.id))
        );
        assert_eq!(indexes.memory_count(), 1);
    }

    #[test]
    fn snapshot_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut indexes = Indexes::default();
        let memory = memory("u1", "s1", "snapshot survivor", 0.7);
        indexes.apply_put(&memory, location(3, 48));
        indexes.set_version(5);
        indexes.write_snapshot(dir.path()).expect("write snapshot");

        let restored = Indexes::load_newest(dir.path())
            .expect("load")
            .expect("snapshot present");
        assert_eq!(restored.version(), 5);
        assert!(restored.contains(&memory.id));
        assert_eq!(restored.watermark(3), 112);
        assert_eq!(
            restored.doc(&memory.id),
            indexes.doc(&memory.id)
        );
    }

    #[test]
    fn sessions_for_user_derives_bounds() {
        let mut indexes = Indexes::default();
        let first = memory("u1", "s1", "first", 0.5);
        let second = memory("u1", "s1", "second", 0.5);
        indexes.apply_put(&first, location(1, 48));
        indexes.apply_put(&second, location(1, 112));

        let sessions = indexes.sessions_for_user("u1");
        assert_eq!(sessions.len(), 1);
        let (session_id, count, first_ms, last_ms) = &sessions[0];
        assert_eq!(session_id, "s1");
        assert_eq!(*count, 2);
        assert!(first_ms <= last_ms);
    }
}
