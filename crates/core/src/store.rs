//! Transactional facade over segments and indexes.
//!
//! Write-side operations (`put`, `delete`, access flush, decay rewrites) are
//! serialized per user through a striped lock; the segment appender has its
//! own short global critical section; readers run against an index read
//! guard and never wait behind fsyncs.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, warn};
use uuid::{NoContext, Timestamp, Uuid};

use crate::clock::Clock;
use crate::codec::{AccessUpdate, RecordBody, Tombstone};
use crate::error::{MemoryError, Result, with_io_retry};
use crate::index::Indexes;
use crate::query;
use crate::record::{DEFAULT_IMPORTANCE, Memory, MemoryInput};
use crate::segment::SegmentStore;

/// Stripe count for the per-user write locks.
pub const LOCK_STRIPES: usize = 64;
/// Hot-record cache capacity.
const RECORD_CACHE_CAPACITY: usize = 256;

pub(crate) struct StripeSet {
    stripes: Vec<Mutex<()>>,
}

impl StripeSet {
    fn new() -> Self {
        Self {
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub(crate) fn lock(&self, user_id: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        self.stripes[hasher.finish() as usize % LOCK_STRIPES].lock()
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub max_memories_per_user: usize,
    pub default_ttl_hours: u64,
}

/// Pending advisory access update for one record.
#[derive(Debug, Clone, Copy)]
struct PendingAccess {
    last_accessed_ms: i64,
    access_count: u64,
}

pub struct Store {
    pub(crate) segments: SegmentStore,
    pub(crate) indexes: RwLock<Indexes>,
    pub(crate) stripes: StripeSet,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: StoreConfig,
    cache: Mutex<LruCache<Uuid, Memory>>,
    access_batch: Mutex<HashMap<Uuid, PendingAccess>>,
    /// Records that failed CRC on read; tombstoned by the next decay sweep so
    /// the store self-heals.
    heal_queue: Mutex<HashSet<Uuid>>,
    /// Monotonic identity guard: `(created_ms, id)` of the last issued record.
    last_issued: Mutex<(i64, Uuid)>,
}

impl Store {
    pub fn new(
        segments: SegmentStore,
        indexes: Indexes,
        clock: Arc<dyn Clock>,
        config: StoreConfig,
    ) -> Self {
        segments.recalibrate_live(&indexes.live_by_segment());
        Self {
            segments,
            indexes: RwLock::new(indexes),
            stripes: StripeSet::new(),
            clock,
            config,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(RECORD_CACHE_CAPACITY).expect("nonzero cache capacity"),
            )),
            access_batch: Mutex::new(HashMap::new()),
            heal_queue: Mutex::new(HashSet::new()),
            last_issued: Mutex::new((0, Uuid::nil())),
        }
    }

    /// Persist a new memory: stamp identity and timestamps, enforce the
    /// per-user cap by evicting ahead of the insert, append, index.
    pub fn put(&self, input: MemoryInput) -> Result<Memory> {
        input.validate()?;
        let _user_guard = self.stripes.lock(&input.user_id);

        {
            let indexes = self.indexes.read();
            if let Some(owner) = indexes.session_owner(&input.session_id) {
                if owner != input.user_id {
                    return Err(MemoryError::Forbidden(format!(
                        "session {} belongs to another user",
                        input.session_id
                    )));
                }
            }
        }

        // I5: the cap is enforced by eviction, never by rejecting the write.
        loop {
            let over = {
                let indexes = self.indexes.read();
                indexes.user_memory_count(&input.user_id) >= self.config.max_memories_per_user
            };
            if !over {
                break;
            }
            self.evict_lowest_scored(&input.user_id)?;
        }

        let (created_at, id) = self.next_identity();
        let importance = input.importance.unwrap_or(DEFAULT_IMPORTANCE);
        let expires_at = input
            .ttl_hours
            .map(|hours| created_at + Duration::hours(hours as i64));

        let memory = Memory {
            id,
            user_id: input.user_id,
            session_id: input.session_id,
            content: input.content,
            metadata: input.metadata,
            importance,
            initial_importance: importance,
            created_at,
            expires_at,
            last_accessed_at: created_at,
            access_count: 0,
        };

        self.append_and_index(&RecordBody::Put(memory.clone()))?;
        self.cache.lock().put(memory.id, memory.clone());
        debug!(
            id = %memory.id,
            user = %memory.user_id,
            session = %memory.session_id,
            content_len = memory.content.len(),
            "memory saved"
        );
        Ok(memory)
    }

    /// Fetch one record by id.  Access metadata lives authoritatively in the
    /// index (the put frame is immutable), so it is overlaid onto the loaded
    /// record.
    pub fn get(&self, id: Uuid) -> Result<Memory> {
        if let Some(memory) = self.cache.lock().get(&id) {
            let mut memory = memory.clone();
            self.overlay_access(&mut memory);
            return Ok(memory);
        }
        let location = {
            let indexes = self.indexes.read();
            indexes
                .doc(&id)
                .map(|doc| doc.location)
                .ok_or_else(|| MemoryError::NotFound(format!("memory {id}")))?
        };
        let body = with_io_retry("segment read", || self.segments.read(location));
        match body {
            Ok(RecordBody::Put(mut memory)) if memory.id == id => {
                self.cache.lock().put(id, memory.clone());
                self.overlay_access(&mut memory);
                Ok(memory)
            }
            Ok(_) => Err(MemoryError::Internal(format!(
                "index points {id} at a non-put frame"
            ))),
            Err(err @ MemoryError::CorruptRecord { .. }) => {
                warn!(%id, %err, "corrupt record excluded and queued for healing");
                self.heal_queue.lock().insert(id);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Like [`get`], but corruption yields `None` so scans continue past the
    /// bad record instead of failing the whole call.
    pub fn fetch_live(&self, id: Uuid) -> Result<Option<Memory>> {
        match self.get(id) {
            Ok(memory) => Ok(Some(memory)),
            Err(MemoryError::NotFound(_) | MemoryError::CorruptRecord { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Queue advisory access updates for the given ids.  Batched in memory
    /// and flushed periodically; a crash loses at most one unflushed window.
    pub fn touch(&self, ids: &[Uuid]) {
        if ids.is_empty() {
            return;
        }
        let now_ms = self.clock.now().timestamp_millis();
        let indexes = self.indexes.read();
        let mut batch = self.access_batch.lock();
        for id in ids {
            let Some(doc) = indexes.doc(id) else {
                continue;
            };
            let pending = batch.entry(*id).or_insert(PendingAccess {
                last_accessed_ms: doc.last_accessed_ms,
                access_count: doc.access_count,
            });
            pending.access_count += 1;
            pending.last_accessed_ms = pending.last_accessed_ms.max(now_ms);
        }
    }

    /// Flush the batched access updates as durable frames.  Returns how many
    /// records were flushed.
    pub fn flush_access(&self) -> Result<usize> {
        let drained: Vec<(Uuid, PendingAccess)> = {
            let mut batch = self.access_batch.lock();
            batch.drain().collect()
        };
        if drained.is_empty() {
            return Ok(0);
        }
        let flushed = drained.len();
        for (id, pending) in drained {
            let Some(user_id) = self
                .indexes
                .read()
                .doc(&id)
                .map(|doc| doc.user_id.clone())
            else {
                continue;
            };
            let _user_guard = self.stripes.lock(&user_id);
            let last_accessed_at = DateTime::from_timestamp_millis(pending.last_accessed_ms)
                .unwrap_or_else(|| self.clock.now());
            self.append_and_index(&RecordBody::Access(AccessUpdate {
                id,
                last_accessed_at,
                access_count: pending.access_count,
            }))?;
            self.cache.lock().pop(&id);
        }
        debug!(flushed, "access metadata flushed");
        Ok(flushed)
    }

    /// Tombstone a single record after an ownership check.
    pub fn delete(&self, user_id: &str, id: Uuid) -> Result<()> {
        crate::record::validate_principal("user_id", user_id)?;
        let _user_guard = self.stripes.lock(user_id);
        let owner = {
            let indexes = self.indexes.read();
            indexes
                .doc(&id)
                .map(|doc| doc.user_id.clone())
                .ok_or_else(|| MemoryError::NotFound(format!("memory {id}")))?
        };
        if owner != user_id {
            return Err(MemoryError::Forbidden(format!(
                "memory {id} belongs to another user"
            )));
        }
        self.tombstone(id)
    }

    /// Tombstone every memory in a session.  Returns the number removed.
    pub fn delete_session(&self, user_id: &str, session_id: &str) -> Result<usize> {
        let _user_guard = self.stripes.lock(user_id);
        let ids: Vec<Uuid> = {
            let indexes = self.indexes.read();
            match indexes.session_owner(session_id) {
                Some(owner) if owner != user_id => {
                    return Err(MemoryError::Forbidden(format!(
                        "session {session_id} belongs to another user"
                    )));
                }
                Some(_) => indexes.session_docs_newest_first(session_id).collect(),
                None => Vec::new(),
            }
        };
        for id in &ids {
            self.tombstone(*id)?;
        }
        Ok(ids.len())
    }

    /// Append a tombstone for `id` and drop it from the indexes.  Caller
    /// holds the user stripe.
    pub(crate) fn tombstone(&self, id: Uuid) -> Result<()> {
        let Some((user_id, session_id, old_segment)) = ({
            let indexes = self.indexes.read();
            indexes
                .doc(&id)
                .map(|doc| (doc.user_id.clone(), doc.session_id.clone(), doc.location.segment_id))
        }) else {
            return Ok(());
        };
        self.append_and_index(&RecordBody::Tombstone(Tombstone {
            id,
            user_id,
            session_id,
        }))?;
        self.segments.note_dead(old_segment);
        self.cache.lock().pop(&id);
        Ok(())
    }

    /// Rewrite a record in place with a new current importance.  Used by the
    /// decay engine when attenuation moves a record across a bucket boundary.
    pub(crate) fn rewrite_importance(&self, id: Uuid, importance: f32) -> Result<()> {
        let mut memory = self.get(id)?;
        let old_segment = {
            let indexes = self.indexes.read();
            indexes.doc(&id).map(|doc| doc.location.segment_id)
        };
        memory.importance = importance;
        self.append_and_index(&RecordBody::Put(memory.clone()))?;
        if let Some(segment_id) = old_segment {
            self.segments.note_dead(segment_id);
        }
        self.cache.lock().put(id, memory);
        Ok(())
    }

    /// Evict the lowest-scored record for `user_id`.  Ties break on older
    /// `created_at`, then id, so repeated evictions are deterministic.
    pub(crate) fn evict_lowest_scored(&self, user_id: &str) -> Result<()> {
        let now_ms = self.clock.now().timestamp_millis();
        let victim = {
            let indexes = self.indexes.read();
            indexes
                .user_docs_newest_first(user_id)
                .filter_map(|id| {
                    let doc = indexes.doc(&id)?;
                    let score = query::base_score(
                        doc.importance,
                        now_ms - doc.created_ms,
                        doc.access_count,
                    );
                    Some((id, score, doc.created_ms))
                })
                .min_by(|(a_id, a_score, a_created), (b_id, b_score, b_created)| {
                    a_score
                        .total_cmp(b_score)
                        .then_with(|| a_created.cmp(b_created))
                        .then_with(|| a_id.cmp(b_id))
                })
                .map(|(id, _, _)| id)
        };
        let Some(victim) = victim else {
            return Err(MemoryError::Internal(format!(
                "cap eviction found no candidate for {user_id}"
            )));
        };
        debug!(user = user_id, id = %victim, "evicting lowest-scored memory under per-user cap");
        self.tombstone(victim)
    }

    /// Append a frame and apply it to the indexes.  The manifest carries the
    /// index versions either side of the update so restart replay knows what
    /// was applied.
    fn append_and_index(&self, body: &RecordBody) -> Result<()> {
        let version_pre = self.indexes.read().version();
        let location = with_io_retry("segment append", || {
            self.segments.append(body, version_pre, version_pre + 1)
        })?;
        let mut indexes = self.indexes.write();
        indexes.apply(body, location);
        indexes.set_version(version_pre + 1);
        Ok(())
    }

    /// Stamp `(created_at, id)` for a fresh record.  `created_at` never runs
    /// backwards and ids sort strictly above every previously issued id, so
    /// id order and time order agree within this writer.
    fn next_identity(&self) -> (DateTime<Utc>, Uuid) {
        let now_ms = self.clock.now().timestamp_millis();
        let mut last = self.last_issued.lock();
        let created_ms = now_ms.max(last.0);
        let created_at = DateTime::from_timestamp_millis(created_ms)
            .unwrap_or_else(|| self.clock.now());
        let seconds = created_ms.div_euclid(1000) as u64;
        let subsec_nanos = (created_ms.rem_euclid(1000) * 1_000_000) as u32;
        let mut id = Uuid::new_v7(Timestamp::from_unix(NoContext, seconds, subsec_nanos));
        while id <= last.1 {
            id = Uuid::new_v7(Timestamp::from_unix(NoContext, seconds, subsec_nanos));
        }
        *last = (created_ms, id);
        (created_at, id)
    }

    fn overlay_access(&self, memory: &mut Memory) {
        let indexes = self.indexes.read();
        if let Some(doc) = indexes.doc(&memory.id) {
            memory.access_count = memory.access_count.max(doc.access_count);
            if let Some(last_accessed) = DateTime::from_timestamp_millis(doc.last_accessed_ms) {
                memory.last_accessed_at = memory.last_accessed_at.max(last_accessed);
            }
        }
    }

    pub(crate) fn drain_heal_queue(&self) -> Vec<Uuid> {
        self.heal_queue.lock().drain().collect()
    }

    pub fn pending_access_len(&self) -> usize {
        self.access_batch.lock().len()
    }

    /// Run a closure against the current index state.
    pub fn with_indexes<R>(&self, f: impl FnOnce(&Indexes) -> R) -> R {
        f(&self.indexes.read())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::{Store, StoreConfig};
    use crate::clock::SystemClock;
    use crate::codec::Codec;
    use crate::error::MemoryError;
    use crate::index::Indexes;
    use crate::record::MemoryInput;
    use crate::segment::SegmentStore;

    fn open_store(dir: &std::path::Path, max_per_user: usize) -> Store {
        let segments =
            SegmentStore::open(dir.join("segments"), Codec::new(true, 1024), 1 << 20)
                .expect("segments");
        Store::new(
            segments,
            Indexes::default(),
            Arc::new(SystemClock),
            StoreConfig {
                max_memories_per_user: max_per_user,
                default_ttl_hours: 720,
            },
        )
    }

    fn input(user: &str, session: &str, content: &str, importance: f32) -> MemoryInput {
        MemoryInput {
            user_id: user.into(),
            session_id: session.into(),
            content: content.into(),
            importance: Some(importance),
            ..MemoryInput::default()
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(dir.path(), 100);

        let saved = store
            .put(input("u1", "s1", "I learned about memory decay", 0.8))
            .expect("put");
        let loaded = store.get(saved.id).expect("get");
        assert_eq!(loaded, saved);
        assert_eq!(loaded.access_count, 0);
    }

    #[test]
    fn ids_sort_with_save_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(dir.path(), 100);

        let first = store.put(input("u1", "s1", "first", 0.5)).expect("put");
        let second = store.put(input("u1", "s1", "second", 0.5)).expect("put");
        let third = store.put(input("u1", "s1", "third", 0.5)).expect("put");
        assert!(first.id < second.id && second.id < third.id);
        assert!(first.created_at <= second.created_at);
    }

    #[test]
    fn cross_user_session_reuse_is_forbidden() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(dir.path(), 100);

        store.put(input("owner", "shared", "mine", 0.5)).expect("put");
        let err = store
            .put(input("intruder", "shared", "theirs", 0.5))
            .expect_err("cross-user session");
        assert!(matches!(err, MemoryError::Forbidden(_)));
    }

    #[test]
    fn cap_evicts_lowest_scored_before_insert() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(dir.path(), 3);

        store.put(input("u1", "s1", "least salient", 0.1)).expect("put");
        let keep_a = store.put(input("u1", "s1", "somewhat", 0.4)).expect("put");
        let keep_b = store.put(input("u1", "s1", "important", 0.7)).expect("put");
        let keep_c = store.put(input("u1", "s1", "critical", 0.9)).expect("put");

        let remaining: Vec<Uuid> =
            store.with_indexes(|indexes| indexes.user_docs_newest_first("u1").collect());
        assert_eq!(remaining.len(), 3);
        assert!(remaining.contains(&keep_a.id));
        assert!(remaining.contains(&keep_b.id));
        assert!(remaining.contains(&keep_c.id));
    }

    #[test]
    fn delete_checks_ownership() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(dir.path(), 100);

        let saved = store.put(input("u1", "s1", "mine alone", 0.5)).expect("put");
        assert!(matches!(
            store.delete("u2", saved.id),
            Err(MemoryError::Forbidden(_))
        ));
        store.delete("u1", saved.id).expect("delete");
        assert!(matches!(
            store.get(saved.id),
            Err(MemoryError::NotFound(_))
        ));
    }

    #[test]
    fn delete_session_removes_only_that_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(dir.path(), 100);

        store.put(input("u1", "doomed", "one", 0.5)).expect("put");
        store.put(input("u1", "doomed", "two", 0.5)).expect("put");
        let survivor = store.put(input("u1", "kept", "three", 0.5)).expect("put");

        let removed = store.delete_session("u1", "doomed").expect("delete session");
        assert_eq!(removed, 2);
        assert!(store.get(survivor.id).is_ok());
        assert_eq!(store.delete_session("u1", "missing").expect("noop"), 0);
    }

    #[test]
    fn touch_batches_then_flushes_durably() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(dir.path(), 100);

        let saved = store.put(input("u1", "s1", "often recalled", 0.5)).expect("put");
        store.touch(&[saved.id]);
        store.touch(&[saved.id]);
        assert_eq!(store.pending_access_len(), 1);

        let flushed = store.flush_access().expect("flush");
        assert_eq!(flushed, 1);
        let reloaded = store.get(saved.id).expect("get");
        assert_eq!(reloaded.access_count, 2);
        assert!(reloaded.last_accessed_at >= reloaded.created_at);
    }
}
