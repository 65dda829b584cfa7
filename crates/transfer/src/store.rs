use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::RwLock;
use std::time::SystemTime;

use crate::StoreError;
use crate::validation::validate_session_id;

/// A session namespace found in a store.
#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceInfo {
    pub session_id: String,
    /// Most recent chunk write in the namespace.
    pub last_modified: SystemTime,
}

/// Durable persistence of chunk payloads keyed by `(session_id, chunk_index)`.
///
/// Implementations must make `put` atomic: a chunk is either fully
/// visible to [`list`](Self::list) and readers, or not at all.
pub trait ChunkStore: Send + Sync {
    /// Persists a chunk. Writing an existing index overwrites it.
    fn put(&self, session_id: &str, chunk_index: u32, data: &[u8]) -> Result<(), StoreError>;

    /// Returns the sorted indices of committed chunks (empty if the
    /// session has no namespace).
    fn list(&self, session_id: &str) -> Result<Vec<u32>, StoreError>;

    /// Reads one chunk, or [`StoreError::MissingChunk`] if absent.
    fn read_chunk(&self, session_id: &str, chunk_index: u32) -> Result<Vec<u8>, StoreError>;

    /// Removes every chunk of the session. A missing namespace is not an error.
    fn discard(&self, session_id: &str) -> Result<(), StoreError>;

    /// Lists every session namespace currently held.
    fn namespaces(&self) -> Result<Vec<NamespaceInfo>, StoreError>;

    /// Streams chunks `0..total_chunks` into `out` in ascending index order.
    ///
    /// Fails with [`StoreError::MissingChunk`] at the first gap before any
    /// byte is written. Returns the number of bytes copied.
    fn read_in_order(
        &self,
        session_id: &str,
        total_chunks: u32,
        out: &mut dyn Write,
    ) -> Result<u64, StoreError> {
        ensure_contiguous(&self.list(session_id)?, total_chunks)?;

        let mut copied = 0u64;
        for index in 0..total_chunks {
            let data = self.read_chunk(session_id, index)?;
            out.write_all(&data)?;
            copied += data.len() as u64;
        }
        Ok(copied)
    }
}

/// Checks that the sorted `present` indices cover `0..total_chunks`.
pub(crate) fn ensure_contiguous(present: &[u32], total_chunks: u32) -> Result<(), StoreError> {
    let mut expected = 0u32;
    for &index in present {
        if index >= total_chunks {
            break;
        }
        if index != expected {
            return Err(StoreError::MissingChunk(expected));
        }
        expected += 1;
    }
    if expected < total_chunks {
        return Err(StoreError::MissingChunk(expected));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// MemoryChunkStore
// ---------------------------------------------------------------------------

struct MemoryNamespace {
    chunks: BTreeMap<u32, Vec<u8>>,
    last_modified: SystemTime,
}

/// In-memory chunk store (thread-safe).
///
/// Suitable for tests and for deployments where chunks need not
/// survive a restart.
#[derive(Default)]
pub struct MemoryChunkStore {
    inner: RwLock<HashMap<String, MemoryNamespace>>,
}

impl MemoryChunkStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the store holds a namespace for the session.
    pub fn contains_session(&self, session_id: &str) -> bool {
        self.inner.read().unwrap().contains_key(session_id)
    }
}

impl ChunkStore for MemoryChunkStore {
    fn put(&self, session_id: &str, chunk_index: u32, data: &[u8]) -> Result<(), StoreError> {
        validate_session_id(session_id)?;
        let mut inner = self.inner.write().unwrap();
        let ns = inner
            .entry(session_id.to_string())
            .or_insert_with(|| MemoryNamespace {
                chunks: BTreeMap::new(),
                last_modified: SystemTime::now(),
            });
        ns.chunks.insert(chunk_index, data.to_vec());
        ns.last_modified = SystemTime::now();
        Ok(())
    }

    fn list(&self, session_id: &str) -> Result<Vec<u32>, StoreError> {
        validate_session_id(session_id)?;
        let inner = self.inner.read().unwrap();
        Ok(inner
            .get(session_id)
            .map(|ns| ns.chunks.keys().copied().collect())
            .unwrap_or_default())
    }

    fn read_chunk(&self, session_id: &str, chunk_index: u32) -> Result<Vec<u8>, StoreError> {
        validate_session_id(session_id)?;
        let inner = self.inner.read().unwrap();
        inner
            .get(session_id)
            .and_then(|ns| ns.chunks.get(&chunk_index))
            .cloned()
            .ok_or(StoreError::MissingChunk(chunk_index))
    }

    fn discard(&self, session_id: &str) -> Result<(), StoreError> {
        validate_session_id(session_id)?;
        self.inner.write().unwrap().remove(session_id);
        Ok(())
    }

    fn namespaces(&self) -> Result<Vec<NamespaceInfo>, StoreError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .iter()
            .map(|(id, ns)| NamespaceInfo {
                session_id: id.clone(),
                last_modified: ns.last_modified,
            })
            .collect())
    }
}
