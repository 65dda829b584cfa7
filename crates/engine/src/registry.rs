//! In-memory session registry.
//!
//! Sessions are spread across [`SHARD_COUNT`] independently locked shards
//! keyed by a hash of the session id. Each session's mutable state sits
//! behind its own mutex, so chunk writes for different sessions never
//! contend and writes for the same session only contend briefly on the
//! received-set update.
//!
//! Lock order is always shard, then session state. Request paths release
//! the shard lock before touching session state; only the sweeper holds
//! both at once.

use std::collections::{BTreeSet, HashMap};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chunkyard_transfer::{ChunkStore, validate_session_id};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::EngineError;

/// Number of registry shards.
pub const SHARD_COUNT: usize = 16;

/// Result of [`SessionRegistry::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedSession {
    /// `true` if this call created the session.
    pub created: bool,
    /// Chunks already received, sorted.
    pub uploaded: Vec<u32>,
}

/// Point-in-time copy of a session's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub total_chunks: u32,
    pub file_name: String,
    pub file_type: String,
    pub uploaded: Vec<u32>,
    pub merging: bool,
    /// Time since the session was created.
    pub age: Duration,
    /// Time since the last chunk write or open.
    pub idle: Duration,
}

/// Record of a merged session.
#[derive(Debug, Clone)]
pub struct Tombstone {
    pub artifact_url: String,
    pub merged_at: Instant,
}

pub(crate) struct SessionState {
    pub(crate) total_chunks: u32,
    pub(crate) file_name: String,
    pub(crate) file_type: String,
    received: BTreeSet<u32>,
    created_at: Instant,
    last_activity: Instant,
    pub(crate) merging: bool,
}

impl SessionState {
    fn uploaded(&self) -> Vec<u32> {
        self.received.iter().copied().collect()
    }

    pub(crate) fn missing(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.received.contains(i))
            .collect()
    }

    fn is_complete(&self) -> bool {
        self.received.len() as u64 == u64::from(self.total_chunks)
    }
}

pub(crate) struct SessionEntry {
    pub(crate) state: Mutex<SessionState>,
    /// Serializes merges of this session.
    pub(crate) merge_lock: Mutex<()>,
}

#[derive(Default)]
struct Shard {
    sessions: HashMap<String, Arc<SessionEntry>>,
    tombstones: HashMap<String, Tombstone>,
}

/// Tracks every in-flight upload session.
pub struct SessionRegistry {
    shards: Vec<RwLock<Shard>>,
    store: Arc<dyn ChunkStore>,
    clock: Arc<dyn Clock>,
}

pub(crate) fn check_session_id(session_id: &str) -> Result<(), EngineError> {
    validate_session_id(session_id).map_err(|e| EngineError::InvalidRequest(e.to_string()))
}

impl SessionRegistry {
    /// Creates an empty registry backed by `store` for restart recovery
    /// and expiry cleanup.
    pub fn new(store: Arc<dyn ChunkStore>, clock: Arc<dyn Clock>) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| RwLock::default()).collect();
        Self {
            shards,
            store,
            clock,
        }
    }

    fn shard(&self, session_id: &str) -> &RwLock<Shard> {
        let mut hasher = DefaultHasher::new();
        session_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    pub(crate) fn entry(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        self.shard(session_id)
            .read()
            .unwrap()
            .sessions
            .get(session_id)
            .cloned()
    }

    /// Returns `true` if `entry` is still the live entry for the session.
    pub(crate) fn is_current(&self, session_id: &str, entry: &Arc<SessionEntry>) -> bool {
        self.entry(session_id)
            .is_some_and(|live| Arc::ptr_eq(&live, entry))
    }

    /// Opens a session, creating it if needed.
    ///
    /// Re-opening with the same `total_chunks` is a no-op that refreshes
    /// activity. A new session is seeded with the chunks already present
    /// in the chunk store.
    pub fn open(
        &self,
        session_id: &str,
        total_chunks: u32,
        file_name: &str,
        file_type: &str,
    ) -> Result<OpenedSession, EngineError> {
        check_session_id(session_id)?;
        self.ensure_not_merged(session_id)?;

        if let Some(entry) = self.entry(session_id) {
            return self.reopen(session_id, &entry, total_chunks, file_name, file_type);
        }

        // Chunks persisted before a restart count as received.
        let persisted = self
            .store
            .list(session_id)
            .map_err(|e| EngineError::storage(session_id, None, e))?;
        let now = self.clock.now();
        let state = SessionState {
            total_chunks,
            file_name: file_name.to_string(),
            file_type: file_type.to_string(),
            received: persisted.into_iter().filter(|&i| i < total_chunks).collect(),
            created_at: now,
            last_activity: now,
            merging: false,
        };
        let uploaded = state.uploaded();

        let existing = {
            let mut shard = self.shard(session_id).write().unwrap();
            if let Some(t) = shard.tombstones.get(session_id) {
                return Err(already_merged(session_id, t));
            }
            match shard.sessions.get(session_id) {
                Some(existing) => Arc::clone(existing),
                None => {
                    shard.sessions.insert(
                        session_id.to_string(),
                        Arc::new(SessionEntry {
                            state: Mutex::new(state),
                            merge_lock: Mutex::new(()),
                        }),
                    );
                    drop(shard);
                    info!(
                        session = %session_id,
                        total_chunks,
                        recovered = uploaded.len(),
                        "session opened"
                    );
                    return Ok(OpenedSession {
                        created: true,
                        uploaded,
                    });
                }
            }
        };

        // Lost the creation race; treat as a re-open.
        self.reopen(session_id, &existing, total_chunks, file_name, file_type)
    }

    fn reopen(
        &self,
        session_id: &str,
        entry: &SessionEntry,
        total_chunks: u32,
        file_name: &str,
        file_type: &str,
    ) -> Result<OpenedSession, EngineError> {
        let mut st = entry.state.lock().unwrap();
        if st.merging {
            return Err(EngineError::MergeInProgress(session_id.to_string()));
        }
        if st.total_chunks != total_chunks {
            return Err(EngineError::SessionConflict {
                session_id: session_id.to_string(),
                expected: st.total_chunks,
                got: total_chunks,
            });
        }
        if st.file_name.is_empty() {
            st.file_name = file_name.to_string();
        }
        if st.file_type.is_empty() {
            st.file_type = file_type.to_string();
        }
        st.last_activity = self.clock.now();
        Ok(OpenedSession {
            created: false,
            uploaded: st.uploaded(),
        })
    }

    fn ensure_not_merged(&self, session_id: &str) -> Result<(), EngineError> {
        match self.tombstone(session_id) {
            Some(t) => Err(already_merged(session_id, &t)),
            None => Ok(()),
        }
    }

    /// Records a durably persisted chunk and returns the sorted received set.
    pub fn mark_received(&self, session_id: &str, chunk_index: u32) -> Result<Vec<u32>, EngineError> {
        let entry = self
            .entry(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;

        let mut st = entry.state.lock().unwrap();
        if st.merging {
            return Err(EngineError::MergeInProgress(session_id.to_string()));
        }
        if chunk_index >= st.total_chunks {
            return Err(EngineError::InvalidRequest(format!(
                "chunk index {chunk_index} out of range for {} chunks",
                st.total_chunks
            )));
        }
        st.received.insert(chunk_index);
        st.last_activity = self.clock.now();
        Ok(st.uploaded())
    }

    /// Returns `true` if every declared chunk has been received.
    /// Unknown sessions are never complete.
    pub fn is_complete(&self, session_id: &str) -> bool {
        self.entry(session_id)
            .is_some_and(|e| e.state.lock().unwrap().is_complete())
    }

    /// Sorted indices not yet received.
    pub fn missing(&self, session_id: &str) -> Result<Vec<u32>, EngineError> {
        self.entry(session_id)
            .map(|e| e.state.lock().unwrap().missing())
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
    }

    /// Sorted received indices (empty for unknown sessions).
    pub fn uploaded(&self, session_id: &str) -> Vec<u32> {
        self.entry(session_id)
            .map(|e| e.state.lock().unwrap().uploaded())
            .unwrap_or_default()
    }

    pub fn snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        let entry = self.entry(session_id)?;
        let now = self.clock.now();
        let st = entry.state.lock().unwrap();
        Some(SessionSnapshot {
            session_id: session_id.to_string(),
            total_chunks: st.total_chunks,
            file_name: st.file_name.clone(),
            file_type: st.file_type.clone(),
            uploaded: st.uploaded(),
            merging: st.merging,
            age: now.saturating_duration_since(st.created_at),
            idle: now.saturating_duration_since(st.last_activity),
        })
    }

    pub fn tombstone(&self, session_id: &str) -> Option<Tombstone> {
        self.shard(session_id)
            .read()
            .unwrap()
            .tombstones
            .get(session_id)
            .cloned()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().unwrap().sessions.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops the session and leaves a tombstone pointing at its artifact.
    pub(crate) fn complete_merge(&self, session_id: &str, artifact_url: &str) {
        let mut shard = self.shard(session_id).write().unwrap();
        shard.sessions.remove(session_id);
        shard.tombstones.insert(
            session_id.to_string(),
            Tombstone {
                artifact_url: artifact_url.to_string(),
                merged_at: self.clock.now(),
            },
        );
    }

    /// Re-reads the received set from the chunk store after storage
    /// disagreed with it. Returns the indices now missing.
    pub(crate) fn resync(&self, session_id: &str, entry: &SessionEntry) -> Result<Vec<u32>, EngineError> {
        let persisted = self
            .store
            .list(session_id)
            .map_err(|e| EngineError::storage(session_id, None, e))?;
        let mut st = entry.state.lock().unwrap();
        let total = st.total_chunks;
        st.received = persisted.into_iter().filter(|&i| i < total).collect();
        Ok(st.missing())
    }

    /// Removes sessions idle for longer than `max_age` and their chunks.
    ///
    /// Sessions being merged are skipped. Tombstones older than `max_age`
    /// are pruned, and chunk-store namespaces with no session (left over
    /// from a previous process) are discarded once they are that old.
    /// Returns the ids whose chunks were reclaimed.
    pub fn sweep_expired(&self, max_age: Duration) -> Vec<String> {
        let now = self.clock.now();
        let mut expired = Vec::new();

        for shard in &self.shards {
            let mut shard = shard.write().unwrap();
            shard.sessions.retain(|id, entry| {
                let st = entry.state.lock().unwrap();
                let stale = !st.merging && now.saturating_duration_since(st.last_activity) > max_age;
                if stale {
                    expired.push(id.clone());
                }
                !stale
            });
            shard
                .tombstones
                .retain(|_, t| now.saturating_duration_since(t.merged_at) <= max_age);
        }

        for id in &expired {
            info!(session = %id, "session expired");
            self.discard_chunks(id);
        }

        match self.store.namespaces() {
            Ok(namespaces) => {
                let wall = self.clock.wall();
                for ns in namespaces {
                    if expired.contains(&ns.session_id) || self.entry(&ns.session_id).is_some() {
                        continue;
                    }
                    let age = wall.duration_since(ns.last_modified).unwrap_or_default();
                    if age > max_age {
                        debug!(session = %ns.session_id, age_secs = age.as_secs(), "discarding orphaned chunks");
                        self.discard_chunks(&ns.session_id);
                        expired.push(ns.session_id);
                    }
                }
            }
            Err(e) => warn!(error = %e, "failed to list chunk namespaces"),
        }

        expired
    }

    fn discard_chunks(&self, session_id: &str) {
        if let Err(e) = self.store.discard(session_id) {
            warn!(session = %session_id, error = %e, "failed to discard chunks");
        }
    }
}

pub(crate) fn already_merged(session_id: &str, tombstone: &Tombstone) -> EngineError {
    EngineError::AlreadyMerged {
        session_id: session_id.to_string(),
        artifact_url: Some(tombstone.artifact_url.clone()),
    }
}
