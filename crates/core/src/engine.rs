//! The public coordinator.
//!
//! [`MindCache`] owns configuration, builds the stack in dependency order
//! (codec, segments, indexes, store, planner, summarizer, decay), runs the
//! maintenance thread, and exposes the operations an HTTP or CLI layer binds
//! to.  Mutating operations carry an optional request id; retries within a
//! five-minute window are deduplicated on `(user_id, request_id)`.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::DateTime;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mindcache_config::MindCacheConfig;

use crate::clock::{Clock, SystemClock};
use crate::codec::Codec;
use crate::decay::{DecayConfig, DecayStats};
use crate::error::{MemoryError, Result};
use crate::index::{IndexStats, Indexes};
use crate::manifest;
use crate::query::{self, RecallFilter};
use crate::record::{
    Memory, MemoryInput, Metadata, SessionMeta, SessionSummary, metadata_to_json,
    validate_principal,
};
use crate::segment::{RecordLocation, SegmentStats, SegmentStore};
use crate::store::{Store, StoreConfig};
use crate::summary::{SessionDigest, summarize_session};

/// Retried mutations are deduplicated within this window.
const REQUEST_DEDUP_WINDOW: Duration = Duration::from_secs(300);
/// Maintenance thread tick.
const MAINTENANCE_TICK: Duration = Duration::from_secs(1);

/// Per-call options: an idempotency key for retried mutations and an
/// optional deadline.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub request_id: Option<String>,
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn with_request_id(request_id: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    fn start(options: &CallOptions) -> Self {
        Self {
            at: options.timeout.map(|timeout| Instant::now() + timeout),
        }
    }

    /// Deadline checks sit before each durable step: a call either completes
    /// durably in time or leaves no durable effect.
    fn check(&self) -> Result<()> {
        match self.at {
            Some(at) if Instant::now() >= at => Err(MemoryError::Timeout),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
enum DedupOutcome {
    Saved(Uuid),
    SessionCreated(String),
    SessionDeleted(usize),
    MemoryDeleted,
}

struct DedupEntry {
    fingerprint: u64,
    outcome: DedupOutcome,
    at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecallResult {
    pub memories: Vec<Memory>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub index: IndexStats,
    pub segments: SegmentStats,
    pub session_sidecars: usize,
    pub pending_access_updates: usize,
    pub last_decay: Option<DecayStats>,
}

struct Shared {
    store: Store,
    decay_config: DecayConfig,
    indexes_dir: PathBuf,
    last_decay: Mutex<Option<DecayStats>>,
}

impl Shared {
    fn run_sweep(&self, force_compaction: bool) -> Result<DecayStats> {
        let stats = self.store.run_decay_sweep(&self.decay_config, force_compaction)?;
        *self.last_decay.lock() = Some(stats);
        Ok(stats)
    }

    fn snapshot(&self) -> Result<()> {
        self.store
            .with_indexes(|indexes| indexes.write_snapshot(&self.indexes_dir))?;
        Ok(())
    }
}

struct MaintenanceWorker {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct MindCache {
    config: MindCacheConfig,
    shared: Arc<Shared>,
    clock: Arc<dyn Clock>,
    sessions_dir: PathBuf,
    session_meta: RwLock<HashMap<String, SessionMeta>>,
    dedup: Mutex<HashMap<(String, String), DedupEntry>>,
    /// Recent `(user, session, content)` saves, for retry folding when the
    /// caller supplies no request id.
    content_dedup: Mutex<HashMap<(String, u64), (Uuid, Instant)>>,
    worker: Mutex<Option<MaintenanceWorker>>,
}

impl MindCache {
    /// Open (or initialize) a store at `config.storage_path` with the system
    /// clock.
    pub fn open(config: MindCacheConfig) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Open with an injected clock; decay and TTL tests advance time through
    /// this.
    pub fn open_with_clock(config: MindCacheConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config
            .validate()
            .map_err(|err| MemoryError::InvalidArgument(err.to_string()))?;

        let root = config.storage_path.clone();
        fs::create_dir_all(&root)?;
        let config = freeze_config(&root, config)?;

        let segments_dir = root.join("segments");
        let indexes_dir = root.join("indexes");
        let sessions_dir = root.join("sessions");
        fs::create_dir_all(&sessions_dir)?;

        let codec = Codec::new(config.enable_compression, config.compression_threshold);
        let segments = SegmentStore::open(&segments_dir, codec, config.segment_roll_bytes)?;

        let mut indexes = Indexes::load_newest(&indexes_dir)?.unwrap_or_default();
        replay_manifests(&segments_dir, &segments, &mut indexes)?;

        let store = Store::new(
            segments,
            indexes,
            Arc::clone(&clock),
            StoreConfig {
                max_memories_per_user: config.max_memories_per_user,
                default_ttl_hours: config.default_memory_ttl_hours,
            },
        );

        let shared = Arc::new(Shared {
            store,
            decay_config: DecayConfig {
                importance_threshold: config.importance_threshold,
                compaction_threshold: config.compaction_threshold,
                compaction_min_evictions: config.compaction_min_evictions,
            },
            indexes_dir,
            last_decay: Mutex::new(None),
        });

        let session_meta = load_session_sidecars(&sessions_dir)?;
        info!(
            root = %root.display(),
            memories = shared.store.with_indexes(Indexes::memory_count),
            sessions = session_meta.len(),
            "mindcache opened"
        );

        let engine = Self {
            shared,
            clock,
            sessions_dir,
            session_meta: RwLock::new(session_meta),
            dedup: Mutex::new(HashMap::new()),
            content_dedup: Mutex::new(HashMap::new()),
            worker: Mutex::new(None),
            config,
        };
        if engine.config.auto_decay_enabled {
            engine.start_maintenance();
        }
        Ok(engine)
    }

    // ── Write path ─────────────────────────────────────────────────────────

    /// Persist one memory; returns its id.  A retried call with the same
    /// request id (or, lacking one, an identical user/session/content triple
    /// within the window) returns the original id.
    pub fn save(&self, input: MemoryInput, options: &CallOptions) -> Result<Uuid> {
        let deadline = Deadline::start(options);
        deadline.check()?;
        input.validate()?;

        let fingerprint = save_fingerprint(&input);
        let content_key = content_fingerprint(&input);
        if let Some(request_id) = &options.request_id {
            if let Some(outcome) =
                self.check_request_dedup(&input.user_id, request_id, fingerprint)?
            {
                match outcome {
                    DedupOutcome::Saved(id) => return Ok(id),
                    _ => {
                        return Err(MemoryError::Conflict(format!(
                            "request id {request_id} was used for a different operation"
                        )));
                    }
                }
            }
        } else {
            let key = (input.user_id.clone(), content_key);
            let mut content_dedup = self.content_dedup.lock();
            content_dedup.retain(|_, (_, at)| at.elapsed() < REQUEST_DEDUP_WINDOW);
            if let Some((id, _)) = content_dedup.get(&key) {
                debug!(id = %id, "identical save within the window, treated as a retry");
                return Ok(*id);
            }
        }

        // Engine-level half of I3: sidecar-only sessions have an owner too.
        if let Some(meta) = self.session_meta.read().get(&input.session_id) {
            if meta.user_id != input.user_id {
                return Err(MemoryError::Forbidden(format!(
                    "session {} belongs to another user",
                    input.session_id
                )));
            }
        }

        deadline.check()?;
        let memory = self.shared.store.put(input)?;

        if let Some(request_id) = &options.request_id {
            self.record_request_dedup(
                &memory.user_id,
                request_id,
                fingerprint,
                DedupOutcome::Saved(memory.id),
            );
        } else {
            self.content_dedup.lock().insert(
                (memory.user_id.clone(), content_key),
                (memory.id, Instant::now()),
            );
        }
        Ok(memory.id)
    }

    /// Tombstone one memory after an ownership check.
    pub fn delete_memory(&self, user_id: &str, id: Uuid, options: &CallOptions) -> Result<()> {
        let deadline = Deadline::start(options);
        deadline.check()?;
        let fingerprint = fingerprint_of(&("delete_memory", user_id, id));
        if let Some(request_id) = &options.request_id {
            if let Some(outcome) = self.check_request_dedup(user_id, request_id, fingerprint)? {
                return match outcome {
                    DedupOutcome::MemoryDeleted => Ok(()),
                    _ => Err(MemoryError::Conflict(format!(
                        "request id {request_id} was used for a different operation"
                    ))),
                };
            }
        }
        self.shared.store.delete(user_id, id)?;
        if let Some(request_id) = &options.request_id {
            self.record_request_dedup(user_id, request_id, fingerprint, DedupOutcome::MemoryDeleted);
        }
        Ok(())
    }

    // ── Read path ──────────────────────────────────────────────────────────

    /// Multi-criterion recall.  Returned memories are touched (batched
    /// access-metadata advance).
    pub fn recall(&self, filter: &RecallFilter, options: &CallOptions) -> Result<RecallResult> {
        let deadline = Deadline::start(options);
        deadline.check()?;
        let now = self.clock.now();
        let hits = self
            .shared
            .store
            .with_indexes(|indexes| query::plan(indexes, filter, now))?;

        let mut memories = Vec::with_capacity(hits.len());
        let mut touched = Vec::with_capacity(hits.len());
        for hit in hits {
            deadline.check()?;
            if let Some(memory) = self.shared.store.fetch_live(hit.id)? {
                touched.push(memory.id);
                memories.push(memory);
            }
        }
        self.shared.store.touch(&touched);
        let count = memories.len();
        Ok(RecallResult { memories, count })
    }

    pub fn get(&self, id: Uuid) -> Result<Memory> {
        self.shared.store.get(id)
    }

    /// Stream every live memory for one user, newest first.
    pub fn export_user(
        &self,
        user_id: &str,
    ) -> Result<impl Iterator<Item = Result<Memory>> + '_> {
        validate_principal("user_id", user_id)?;
        let ids: Vec<Uuid> = self
            .shared
            .store
            .with_indexes(|indexes| indexes.user_docs_newest_first(user_id).collect());
        let store = &self.shared.store;
        Ok(ids.into_iter().filter_map(move |id| {
            store.fetch_live(id).transpose()
        }))
    }

    /// Deterministic digest of one session.
    pub fn summarize(&self, session_id: &str, options: &CallOptions) -> Result<SessionDigest> {
        let deadline = Deadline::start(options);
        deadline.check()?;
        summarize_session(&self.shared.store, session_id, self.clock.now())
    }

    // ── Sessions ───────────────────────────────────────────────────────────

    /// Create an empty named session; returns its generated id.
    pub fn create_session(
        &self,
        user_id: &str,
        name: Option<String>,
        metadata: Metadata,
        options: &CallOptions,
    ) -> Result<String> {
        let deadline = Deadline::start(options);
        deadline.check()?;
        validate_principal("user_id", user_id)?;

        let fingerprint = fingerprint_of(&("create_session", user_id, &name));
        if let Some(request_id) = &options.request_id {
            if let Some(outcome) = self.check_request_dedup(user_id, request_id, fingerprint)? {
                return match outcome {
                    DedupOutcome::SessionCreated(session_id) => Ok(session_id),
                    _ => Err(MemoryError::Conflict(format!(
                        "request id {request_id} was used for a different operation"
                    ))),
                };
            }
        }

        let session_id = Uuid::now_v7().to_string();
        let meta = SessionMeta {
            session_id: session_id.clone(),
            user_id: user_id.to_string(),
            name,
            metadata,
            created_at: self.clock.now(),
        };
        self.write_session_sidecar(&meta)?;
        self.session_meta
            .write()
            .insert(session_id.clone(), meta);
        if let Some(request_id) = &options.request_id {
            self.record_request_dedup(
                user_id,
                request_id,
                fingerprint,
                DedupOutcome::SessionCreated(session_id.clone()),
            );
        }
        Ok(session_id)
    }

    /// Replace a session's sidecar name/metadata.
    pub fn update_session(
        &self,
        user_id: &str,
        session_id: &str,
        name: Option<String>,
        metadata: Metadata,
    ) -> Result<()> {
        validate_principal("user_id", user_id)?;
        let owner = self.session_owner(session_id);
        match owner {
            Some(owner) if owner != user_id => {
                return Err(MemoryError::Forbidden(format!(
                    "session {session_id} belongs to another user"
                )));
            }
            None => {
                return Err(MemoryError::NotFound(format!("session {session_id}")));
            }
            Some(_) => {}
        }

        let created_at = self
            .session_meta
            .read()
            .get(session_id)
            .map(|meta| meta.created_at)
            .unwrap_or_else(|| self.clock.now());
        let meta = SessionMeta {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            name,
            metadata,
            created_at,
        };
        self.write_session_sidecar(&meta)?;
        self.session_meta
            .write()
            .insert(session_id.to_string(), meta);
        Ok(())
    }

    /// Sessions for one user: index-derived members merged with sidecar-only
    /// sessions, ordered by session id.
    pub fn list_sessions(&self, user_id: &str) -> Result<Vec<SessionSummary>> {
        validate_principal("user_id", user_id)?;
        let derived = self
            .shared
            .store
            .with_indexes(|indexes| indexes.sessions_for_user(user_id));
        let sidecars = self.session_meta.read();

        let mut summaries: Vec<SessionSummary> = Vec::with_capacity(derived.len());
        let mut seen: std::collections::HashSet<&str> = std::collections::HashSet::new();
        for (session_id, memory_count, first_ms, last_ms) in &derived {
            let meta = sidecars.get(session_id);
            summaries.push(SessionSummary {
                session_id: session_id.clone(),
                user_id: user_id.to_string(),
                name: meta.and_then(|meta| meta.name.clone()),
                memory_count: *memory_count,
                created_at: DateTime::from_timestamp_millis(*first_ms),
                last_active_at: DateTime::from_timestamp_millis(*last_ms),
            });
        }
        seen.extend(derived.iter().map(|(session_id, ..)| session_id.as_str()));
        for (session_id, meta) in sidecars.iter() {
            if meta.user_id == user_id && !seen.contains(session_id.as_str()) {
                summaries.push(SessionSummary {
                    session_id: session_id.clone(),
                    user_id: user_id.to_string(),
                    name: meta.name.clone(),
                    memory_count: 0,
                    created_at: Some(meta.created_at),
                    last_active_at: Some(meta.created_at),
                });
            }
        }
        summaries.sort_unstable_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(summaries)
    }

    /// Delete a session and everything in it.  Returns the number of
    /// memories removed.
    pub fn delete_session(
        &self,
        user_id: &str,
        session_id: &str,
        options: &CallOptions,
    ) -> Result<usize> {
        let deadline = Deadline::start(options);
        deadline.check()?;
        validate_principal("user_id", user_id)?;

        let fingerprint = fingerprint_of(&("delete_session", user_id, session_id));
        if let Some(request_id) = &options.request_id {
            if let Some(outcome) = self.check_request_dedup(user_id, request_id, fingerprint)? {
                return match outcome {
                    DedupOutcome::SessionDeleted(count) => Ok(count),
                    _ => Err(MemoryError::Conflict(format!(
                        "request id {request_id} was used for a different operation"
                    ))),
                };
            }
        }

        match self.session_owner(session_id) {
            Some(owner) if owner != user_id => {
                return Err(MemoryError::Forbidden(format!(
                    "session {session_id} belongs to another user"
                )));
            }
            None => {
                return Err(MemoryError::NotFound(format!("session {session_id}")));
            }
            Some(_) => {}
        }

        deadline.check()?;
        let removed = self.shared.store.delete_session(user_id, session_id)?;
        let sidecar_path = self.session_sidecar_path(session_id);
        if sidecar_path.exists() {
            fs::remove_file(&sidecar_path)?;
        }
        self.session_meta.write().remove(session_id);
        if let Some(request_id) = &options.request_id {
            self.record_request_dedup(
                user_id,
                request_id,
                fingerprint,
                DedupOutcome::SessionDeleted(removed),
            );
        }
        Ok(removed)
    }

    // ── Decay & lifecycle ──────────────────────────────────────────────────

    /// Run a decay sweep now.  `force` additionally compacts every sealed
    /// segment carrying dead records, not just those past the live-ratio
    /// threshold.
    pub fn run_decay(&self, force: bool) -> Result<DecayStats> {
        self.shared.run_sweep(force)
    }

    pub fn last_decay_stats(&self) -> Option<DecayStats> {
        *self.shared.last_decay.lock()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            index: self.shared.store.with_indexes(Indexes::stats),
            segments: self.shared.store.segments.stats(),
            session_sidecars: self.session_meta.read().len(),
            pending_access_updates: self.shared.store.pending_access_len(),
            last_decay: self.last_decay_stats(),
        }
    }

    pub fn config(&self) -> &MindCacheConfig {
        &self.config
    }

    /// Stop the maintenance thread, flush batched access updates, snapshot
    /// the indexes, and fsync the active segment.  Idempotent.
    pub fn close(&self) -> Result<()> {
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.shutdown_tx.send(());
            if worker.handle.join().is_err() {
                warn!("maintenance thread panicked during shutdown");
            }
        }
        self.shared.store.flush_access()?;
        self.shared.snapshot()?;
        self.shared.store.segments.flush()?;
        info!("mindcache closed");
        Ok(())
    }

    fn start_maintenance(&self) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let access_flush = Duration::from_secs(self.config.access_flush_interval_secs.max(1));
        let snapshot_interval = Duration::from_secs(self.config.index_snapshot_interval_secs.max(1));
        let decay_interval =
            Duration::from_secs(self.config.decay_interval_hours.saturating_mul(3600));

        let handle = std::thread::Builder::new()
            .name("mindcache-maintenance".to_string())
            .spawn(move || {
                let mut last_flush = Instant::now();
                let mut last_snapshot = Instant::now();
                let mut last_decay = Instant::now();
                loop {
                    match shutdown_rx.recv_timeout(MAINTENANCE_TICK) {
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                    }
                    if last_flush.elapsed() >= access_flush {
                        if let Err(err) = shared.store.flush_access() {
                            warn!(%err, "access flush failed");
                        }
                        last_flush = Instant::now();
                    }
                    if last_snapshot.elapsed() >= snapshot_interval {
                        if let Err(err) = shared.snapshot() {
                            warn!(%err, "index snapshot failed");
                        }
                        last_snapshot = Instant::now();
                    }
                    if last_decay.elapsed() >= decay_interval {
                        match shared.run_sweep(false) {
                            Ok(stats) => debug!(?stats, "scheduled decay sweep finished"),
                            Err(err) => warn!(%err, "scheduled decay sweep failed"),
                        }
                        last_decay = Instant::now();
                    }
                }
            });
        match handle {
            Ok(handle) => {
                *self.worker.lock() = Some(MaintenanceWorker {
                    shutdown_tx,
                    handle,
                });
            }
            Err(err) => warn!(%err, "failed to start maintenance thread"),
        }
    }

    // ── Internals ──────────────────────────────────────────────────────────

    fn session_owner(&self, session_id: &str) -> Option<String> {
        if let Some(owner) = self
            .shared
            .store
            .with_indexes(|indexes| indexes.session_owner(session_id).map(str::to_string))
        {
            return Some(owner);
        }
        self.session_meta
            .read()
            .get(session_id)
            .map(|meta| meta.user_id.clone())
    }

    fn session_sidecar_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{session_id}.meta"))
    }

    /// Write a sidecar atomically: temp file, fsync, rename.
    fn write_session_sidecar(&self, meta: &SessionMeta) -> Result<()> {
        let path = self.session_sidecar_path(&meta.session_id);
        let tmp_path = path.with_extension("meta.tmp");
        let rendered = serde_json::to_vec_pretty(meta)
            .map_err(|err| MemoryError::Internal(format!("sidecar encode failed: {err}")))?;
        {
            use std::io::Write as _;
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&rendered)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn check_request_dedup(
        &self,
        user_id: &str,
        request_id: &str,
        fingerprint: u64,
    ) -> Result<Option<DedupOutcome>> {
        let mut dedup = self.dedup.lock();
        dedup.retain(|_, entry| entry.at.elapsed() < REQUEST_DEDUP_WINDOW);
        match dedup.get(&(user_id.to_string(), request_id.to_string())) {
            Some(entry) if entry.fingerprint == fingerprint => Ok(Some(entry.outcome.clone())),
            Some(_) => Err(MemoryError::Conflict(format!(
                "request id {request_id} was reused with a different payload"
            ))),
            None => Ok(None),
        }
    }

    fn record_request_dedup(
        &self,
        user_id: &str,
        request_id: &str,
        fingerprint: u64,
        outcome: DedupOutcome,
    ) {
        self.dedup.lock().insert(
            (user_id.to_string(), request_id.to_string()),
            DedupEntry {
                fingerprint,
                outcome,
                at: Instant::now(),
            },
        );
    }
}

impl Drop for MindCache {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(%err, "close during drop failed");
        }
    }
}

/// Freeze the configuration at first init: the stored `config.json` wins on
/// every later open.
fn freeze_config(root: &Path, config: MindCacheConfig) -> Result<MindCacheConfig> {
    let path = root.join("config.json");
    if path.exists() {
        let stored = MindCacheConfig::load_from(&path)
            .map_err(|err| MemoryError::InvalidArgument(err.to_string()))?;
        if stored != config {
            warn!(path = %path.display(), "config.json differs from requested config, stored wins");
        }
        Ok(stored)
    } else {
        config
            .save_to(&path)
            .map_err(|err| MemoryError::Io(std::io::Error::other(err.to_string())))?;
        Ok(config)
    }
}

/// Replay manifest entries past the snapshot watermarks into the indexes.
///
/// Entries are ordered by their journaled index version, not by segment id:
/// compaction rewrites land in fresh high-numbered segments, so segment
/// order would replay them after tombstones they chronologically precede and
/// resurrect deleted records.
fn replay_manifests(
    segments_dir: &Path,
    segments: &SegmentStore,
    indexes: &mut Indexes,
) -> Result<()> {
    let mut pending = Vec::new();
    for (segment_id, path) in manifest::list(segments_dir)? {
        let watermark = indexes.watermark(segment_id);
        for entry in manifest::load(&path)? {
            if entry.end_offset() > watermark {
                pending.push(entry);
            }
        }
    }
    pending.sort_unstable_by_key(|entry| (entry.index_version_post, entry.segment_id, entry.offset));

    let mut replayed = 0usize;
    for entry in pending {
        let location = RecordLocation {
            segment_id: entry.segment_id,
            offset: entry.offset,
            len: entry.len,
        };
        match segments.read(location) {
            Ok(body) => {
                indexes.apply(&body, location);
                indexes.set_version(entry.index_version_post);
                replayed += 1;
            }
            Err(err) => {
                warn!(
                    segment = entry.segment_id,
                    offset = entry.offset,
                    %err,
                    "skipping unreadable journaled record during replay"
                );
            }
        }
    }
    if replayed > 0 {
        info!(replayed, "manifest replay complete");
    }
    Ok(())
}

fn load_session_sidecars(dir: &Path) -> Result<HashMap<String, SessionMeta>> {
    let mut sessions = HashMap::new();
    for dir_entry in fs::read_dir(dir)? {
        let path = dir_entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("meta") {
            continue;
        }
        let raw = fs::read_to_string(&path)?;
        match serde_json::from_str::<SessionMeta>(&raw) {
            Ok(meta) => {
                sessions.insert(meta.session_id.clone(), meta);
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "skipping unreadable session sidecar");
            }
        }
    }
    Ok(sessions)
}

/// Full payload hash for request-id conflict detection: a reused request id
/// with any field changed is a `Conflict`.
fn save_fingerprint(input: &MemoryInput) -> u64 {
    let metadata = metadata_to_json(&input.metadata).to_string();
    fingerprint_of(&(
        "save",
        &input.user_id,
        &input.session_id,
        &input.content,
        metadata,
        input.importance.map(f32::to_bits),
        input.ttl_hours,
    ))
}

/// Retry-folding key for saves without a request id: only the
/// `(user_id, session_id, content)` triple participates, so a retry that
/// happens to carry different advisory fields still folds onto the original.
fn content_fingerprint(input: &MemoryInput) -> u64 {
    fingerprint_of(&(&input.user_id, &input.session_id, &input.content))
}

fn fingerprint_of(value: &impl Hash) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}
