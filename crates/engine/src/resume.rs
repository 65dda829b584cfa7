use std::sync::Arc;

use chunkyard_transfer::ChunkStore;

use crate::error::EngineError;
use crate::registry::{SessionRegistry, check_session_id};

/// Answers "which chunks does the server already have?".
///
/// Read-only: a query never creates or touches a session.
pub struct ResumeQueryService {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn ChunkStore>,
}

impl ResumeQueryService {
    pub fn new(registry: Arc<SessionRegistry>, store: Arc<dyn ChunkStore>) -> Self {
        Self { registry, store }
    }

    /// Sorted indices of chunks already persisted for the session.
    ///
    /// Unknown sessions report whatever the chunk store still holds
    /// (normally nothing); merged sessions report nothing.
    pub fn query_uploaded(&self, session_id: &str) -> Result<Vec<u32>, EngineError> {
        check_session_id(session_id)?;

        if let Some(snapshot) = self.registry.snapshot(session_id) {
            return Ok(snapshot.uploaded);
        }
        if self.registry.tombstone(session_id).is_some() {
            return Ok(Vec::new());
        }
        self.store
            .list(session_id)
            .map_err(|e| EngineError::storage(session_id, None, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chunkyard_transfer::MemoryChunkStore;

    fn service() -> (Arc<MemoryChunkStore>, Arc<SessionRegistry>, ResumeQueryService) {
        let store = Arc::new(MemoryChunkStore::new());
        let registry = Arc::new(SessionRegistry::new(
            store.clone(),
            Arc::new(ManualClock::new()),
        ));
        let svc = ResumeQueryService::new(registry.clone(), store.clone());
        (store, registry, svc)
    }

    #[test]
    fn unknown_session_is_empty_and_not_created() {
        let (_, registry, svc) = service();
        assert!(svc.query_uploaded("fresh").unwrap().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn reports_received_chunks() {
        let (_, registry, svc) = service();
        registry.open("s1", 4, "a.bin", "").unwrap();
        registry.mark_received("s1", 3).unwrap();
        registry.mark_received("s1", 1).unwrap();
        assert_eq!(svc.query_uploaded("s1").unwrap(), vec![1, 3]);
    }

    #[test]
    fn reports_persisted_chunks_after_restart() {
        let (store, registry, svc) = service();
        store.put("s1", 0, b"a").unwrap();
        store.put("s1", 1, b"b").unwrap();
        assert_eq!(svc.query_uploaded("s1").unwrap(), vec![0, 1]);
        assert!(registry.is_empty());
    }

    #[test]
    fn malformed_id_is_invalid() {
        let (_, _, svc) = service();
        assert!(matches!(
            svc.query_uploaded("../../etc"),
            Err(EngineError::InvalidRequest(_))
        ));
    }
}
