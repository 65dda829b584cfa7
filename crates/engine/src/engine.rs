//! Upload engine facade: the ingest path plus the resume, merge and sweep
//! operations behind one handle.

use std::sync::Arc;
use std::time::Duration;

use chunkyard_transfer::{ArtifactSink, ChunkStore, verify_checksum};
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::EngineError;
use crate::merge::{MergeOrchestrator, MergeOutcome};
use crate::registry::{OpenedSession, SessionRegistry};
use crate::resume::ResumeQueryService;

/// Limits applied to incoming requests.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Largest accepted chunk payload.
    pub max_chunk_bytes: usize,
    /// Largest accepted `total_chunks` declaration.
    pub max_total_chunks: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: 16 * 1024 * 1024,
            max_total_chunks: 100_000,
        }
    }
}

/// One chunk write as received from a client.
#[derive(Debug, Clone, Copy)]
pub struct ChunkWrite<'a> {
    pub session_id: &'a str,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub file_name: &'a str,
    pub file_type: &'a str,
    /// SHA-256 hex of `data`; empty skips verification.
    pub checksum: &'a str,
    pub data: &'a [u8],
}

/// Server-side upload engine.
///
/// All methods block on storage I/O; async callers should run them on a
/// blocking pool.
pub struct UploadEngine {
    config: EngineConfig,
    store: Arc<dyn ChunkStore>,
    registry: Arc<SessionRegistry>,
    resume: ResumeQueryService,
    merger: MergeOrchestrator,
}

impl UploadEngine {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        sink: Arc<dyn ArtifactSink>,
        config: EngineConfig,
    ) -> Self {
        Self::with_clock(store, sink, config, Arc::new(SystemClock))
    }

    /// Like [`new`](Self::new) with an explicit time source.
    pub fn with_clock(
        store: Arc<dyn ChunkStore>,
        sink: Arc<dyn ArtifactSink>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(Arc::clone(&store), clock));
        let resume = ResumeQueryService::new(Arc::clone(&registry), Arc::clone(&store));
        let merger = MergeOrchestrator::new(Arc::clone(&registry), Arc::clone(&store), sink);
        Self {
            config,
            store,
            registry,
            resume,
            merger,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    fn check_total(&self, total_chunks: u32) -> Result<(), EngineError> {
        if total_chunks > self.config.max_total_chunks {
            return Err(EngineError::InvalidRequest(format!(
                "totalChunks {total_chunks} exceeds the limit of {}",
                self.config.max_total_chunks
            )));
        }
        Ok(())
    }

    /// Declares a session up front.
    pub fn open_session(
        &self,
        session_id: &str,
        total_chunks: u32,
        file_name: &str,
        file_type: &str,
    ) -> Result<OpenedSession, EngineError> {
        self.check_total(total_chunks)?;
        self.registry
            .open(session_id, total_chunks, file_name, file_type)
    }

    /// Persists one chunk and records it. Returns the sorted received set.
    ///
    /// The first write for an unknown session creates it. Retrying a
    /// write for the same index overwrites the stored bytes.
    pub fn write_chunk(&self, chunk: ChunkWrite<'_>) -> Result<Vec<u32>, EngineError> {
        let ChunkWrite {
            session_id,
            chunk_index,
            total_chunks,
            ..
        } = chunk;

        self.check_total(total_chunks)?;
        if chunk_index >= total_chunks {
            return Err(EngineError::InvalidRequest(format!(
                "chunkIndex {chunk_index} out of range for totalChunks {total_chunks}"
            )));
        }
        if chunk.data.len() > self.config.max_chunk_bytes {
            return Err(EngineError::InvalidRequest(format!(
                "chunk of {} bytes exceeds the limit of {}",
                chunk.data.len(),
                self.config.max_chunk_bytes
            )));
        }
        if !verify_checksum(chunk.data, chunk.checksum) {
            return Err(EngineError::ChecksumMismatch { chunk_index });
        }

        self.registry
            .open(session_id, total_chunks, chunk.file_name, chunk.file_type)?;
        self.store
            .put(session_id, chunk_index, chunk.data)
            .map_err(|e| EngineError::storage(session_id, Some(chunk_index), e))?;
        let uploaded = self.registry.mark_received(session_id, chunk_index)?;

        debug!(
            session = %session_id,
            chunk = chunk_index,
            bytes = chunk.data.len(),
            received = uploaded.len(),
            total = total_chunks,
            "chunk stored"
        );
        Ok(uploaded)
    }

    /// Sorted indices already uploaded for the session.
    pub fn query_resume(&self, session_id: &str) -> Result<Vec<u32>, EngineError> {
        self.resume.query_uploaded(session_id)
    }

    /// Merges a complete session into a single artifact.
    pub fn merge(
        &self,
        session_id: &str,
        file_name: &str,
        file_type: &str,
    ) -> Result<MergeOutcome, EngineError> {
        self.merger.merge(session_id, file_name, file_type)
    }

    /// Reclaims sessions idle for longer than `max_age`.
    pub fn sweep_expired(&self, max_age: Duration) -> Vec<String> {
        self.registry.sweep_expired(max_age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chunkyard_transfer::{
        ArtifactWriter, FsArtifactSink, FsChunkStore, MemoryArtifactSink, MemoryChunkStore,
        StoreError, checksum_bytes,
    };
    use std::io::Write;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Fixture {
        store: Arc<MemoryChunkStore>,
        sink: MemoryArtifactSink,
        clock: Arc<ManualClock>,
        engine: UploadEngine,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryChunkStore::new());
        let sink = MemoryArtifactSink::new();
        let clock = Arc::new(ManualClock::new());
        let engine = UploadEngine::with_clock(
            store.clone(),
            Arc::new(sink.clone()),
            EngineConfig::default(),
            clock.clone(),
        );
        Fixture {
            store,
            sink,
            clock,
            engine,
        }
    }

    fn chunk<'a>(session_id: &'a str, index: u32, total: u32, data: &'a [u8]) -> ChunkWrite<'a> {
        ChunkWrite {
            session_id,
            chunk_index: index,
            total_chunks: total,
            file_name: "data.bin",
            file_type: "",
            checksum: "",
            data,
        }
    }

    fn merged_bytes(fx: &Fixture, outcome: &MergeOutcome) -> Vec<u8> {
        fx.sink.get(&outcome.artifact_name).unwrap()
    }

    #[test]
    fn idempotent_chunk_write() {
        let fx = fixture();
        fx.engine.write_chunk(chunk("s1", 0, 2, b"AA")).unwrap();
        let uploaded = fx.engine.write_chunk(chunk("s1", 0, 2, b"AA")).unwrap();
        assert_eq!(uploaded, vec![0]);
        assert_eq!(fx.engine.query_resume("s1").unwrap(), vec![0]);
    }

    #[test]
    fn order_independent_merge() {
        let fx = fixture();
        for i in [2, 0, 1] {
            let data = [b'A' + i as u8; 3];
            fx.engine.write_chunk(chunk("s1", i, 3, &data)).unwrap();
        }

        let outcome = fx.engine.merge("s1", "data.bin", "").unwrap();
        assert_eq!(merged_bytes(&fx, &outcome), b"AAABBBCCC");
        assert_eq!(outcome.size, 9);
        assert!(outcome.artifact_url.starts_with("memory://"));
        assert!(outcome.artifact_name.ends_with("-data.bin"));
    }

    #[test]
    fn incomplete_merge_reports_exact_missing_set() {
        let fx = fixture();
        fx.engine.write_chunk(chunk("s1", 0, 5, b"a")).unwrap();
        fx.engine.write_chunk(chunk("s1", 3, 5, b"d")).unwrap();

        match fx.engine.merge("s1", "data.bin", "") {
            Err(EngineError::IncompleteUpload { missing, .. }) => {
                assert_eq!(missing, vec![1, 2, 4]);
            }
            other => panic!("expected IncompleteUpload, got {other:?}"),
        }
        assert!(fx.sink.is_empty());
        // Nothing was reclaimed.
        assert_eq!(fx.engine.query_resume("s1").unwrap(), vec![0, 3]);
    }

    #[test]
    fn merge_reclaims_session_and_chunks() {
        let fx = fixture();
        fx.engine.write_chunk(chunk("s1", 0, 1, b"x")).unwrap();
        fx.engine.merge("s1", "", "").unwrap();

        assert!(fx.engine.registry().is_empty());
        assert!(!fx.store.contains_session("s1"));
        assert!(fx.engine.query_resume("s1").unwrap().is_empty());
    }

    #[test]
    fn merge_unknown_session_not_found() {
        let fx = fixture();
        assert!(matches!(
            fx.engine.merge("ghost", "a", ""),
            Err(EngineError::SessionNotFound(_))
        ));
    }

    #[test]
    fn second_merge_is_already_merged_with_url() {
        let fx = fixture();
        fx.engine.write_chunk(chunk("s1", 0, 1, b"x")).unwrap();
        let first = fx.engine.merge("s1", "a.bin", "").unwrap();

        match fx.engine.merge("s1", "a.bin", "") {
            Err(EngineError::AlreadyMerged { artifact_url, .. }) => {
                assert_eq!(artifact_url, Some(first.artifact_url));
            }
            other => panic!("expected AlreadyMerged, got {other:?}"),
        }
        assert_eq!(fx.sink.len(), 1);
    }

    #[test]
    fn concurrent_merges_produce_one_artifact() {
        let fx = fixture();
        for i in 0..4 {
            fx.engine.write_chunk(chunk("s1", i, 4, b"zz")).unwrap();
        }

        let results: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| fx.engine.merge("s1", "a.bin", "")))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let successes: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(successes.len(), 1);
        let url = &successes[0].artifact_url;

        for r in &results {
            match r {
                Ok(_) => {}
                Err(EngineError::AlreadyMerged { artifact_url, .. }) => {
                    assert_eq!(artifact_url.as_ref(), Some(url));
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(fx.sink.len(), 1);
    }

    #[test]
    fn resume_reports_partial_progress() {
        let fx = fixture();
        for i in [0, 1, 2, 4] {
            fx.engine.write_chunk(chunk("s1", i, 6, b"c")).unwrap();
        }
        assert_eq!(fx.engine.query_resume("s1").unwrap(), vec![0, 1, 2, 4]);

        // Resuming: send only what is missing, then merge succeeds.
        for i in [3, 5] {
            fx.engine.write_chunk(chunk("s1", i, 6, b"c")).unwrap();
        }
        assert_eq!(fx.engine.merge("s1", "", "").unwrap().size, 6);
    }

    #[test]
    fn expiry_sweep_reclaims_abandoned_upload() {
        let fx = fixture();
        fx.engine.write_chunk(chunk("s1", 0, 3, b"a")).unwrap();

        fx.clock.advance(Duration::from_secs(7200));
        let expired = fx.engine.sweep_expired(Duration::from_secs(3600));

        assert_eq!(expired, vec!["s1".to_string()]);
        assert!(fx.engine.query_resume("s1").unwrap().is_empty());
        assert!(!fx.store.contains_session("s1"));
        assert!(matches!(
            fx.engine.merge("s1", "", ""),
            Err(EngineError::SessionNotFound(_))
        ));
    }

    #[test]
    fn total_chunks_conflict() {
        let fx = fixture();
        fx.engine.write_chunk(chunk("s1", 0, 3, b"a")).unwrap();
        assert!(matches!(
            fx.engine.write_chunk(chunk("s1", 1, 4, b"b")),
            Err(EngineError::SessionConflict {
                expected: 3,
                got: 4,
                ..
            })
        ));
        assert_eq!(fx.engine.query_resume("s1").unwrap(), vec![0]);
    }

    #[test]
    fn checksum_verified_before_persisting() {
        let fx = fixture();
        let good = checksum_bytes(b"payload");

        let mut write = chunk("s1", 1, 2, b"payload");
        write.checksum = &good;
        fx.engine.write_chunk(write).unwrap();

        let mut bad = chunk("s1", 0, 2, b"tampered");
        bad.checksum = &good;
        assert!(matches!(
            fx.engine.write_chunk(bad),
            Err(EngineError::ChecksumMismatch { chunk_index: 0 })
        ));
        assert_eq!(fx.store.list("s1").unwrap(), vec![1]);
    }

    #[test]
    fn request_limits() {
        let store = Arc::new(MemoryChunkStore::new());
        let engine = UploadEngine::new(
            store,
            Arc::new(MemoryArtifactSink::new()),
            EngineConfig {
                max_chunk_bytes: 4,
                max_total_chunks: 10,
            },
        );

        assert!(matches!(
            engine.write_chunk(chunk("s1", 0, 1, b"too long")),
            Err(EngineError::InvalidRequest(_))
        ));
        assert!(matches!(
            engine.write_chunk(chunk("s1", 0, 11, b"ok")),
            Err(EngineError::InvalidRequest(_))
        ));
        assert!(matches!(
            engine.write_chunk(chunk("s1", 3, 3, b"ok")),
            Err(EngineError::InvalidRequest(_))
        ));
        assert!(matches!(
            engine.open_session("s1", 11, "a", ""),
            Err(EngineError::InvalidRequest(_))
        ));
        assert!(engine.registry().is_empty());
    }

    #[test]
    fn empty_upload_merges_to_empty_artifact() {
        let fx = fixture();
        fx.engine.open_session("empty", 0, "nothing.txt", "").unwrap();
        let outcome = fx.engine.merge("empty", "", "").unwrap();
        assert_eq!(outcome.size, 0);
        assert!(outcome.artifact_name.ends_with("-nothing.txt"));
        assert!(merged_bytes(&fx, &outcome).is_empty());
    }

    #[test]
    fn merge_uses_declared_metadata_when_request_is_empty() {
        let fx = fixture();
        fx.engine.open_session("s1", 1, "photo", "image/jpeg").unwrap();
        fx.engine.write_chunk(chunk("s1", 0, 1, b"j")).unwrap();
        let outcome = fx.engine.merge("s1", "", "").unwrap();
        assert!(outcome.artifact_name.ends_with("-photo.jpeg"));
    }

    #[test]
    fn merge_recovers_when_store_lost_a_chunk() {
        let fx = fixture();
        fx.engine.write_chunk(chunk("s1", 0, 2, b"a")).unwrap();
        fx.engine.write_chunk(chunk("s1", 1, 2, b"b")).unwrap();
        fx.store.discard("s1").unwrap();
        fx.store.put("s1", 0, b"a").unwrap();

        match fx.engine.merge("s1", "", "") {
            Err(EngineError::IncompleteUpload { missing, .. }) => assert_eq!(missing, vec![1]),
            other => panic!("expected IncompleteUpload, got {other:?}"),
        }
        assert_eq!(fx.engine.query_resume("s1").unwrap(), vec![0]);
        assert!(fx.sink.is_empty());
    }

    #[test]
    fn restart_recovers_persisted_chunks() {
        let dir = tempfile::TempDir::new().unwrap();
        let chunks = dir.path().join("chunks");
        let sink = MemoryArtifactSink::new();

        {
            let engine = UploadEngine::new(
                Arc::new(FsChunkStore::new(&chunks).unwrap()),
                Arc::new(sink.clone()),
                EngineConfig::default(),
            );
            engine.write_chunk(chunk("s1", 0, 2, b"Hello ")).unwrap();
        }

        // A fresh process sees the chunk on disk.
        let engine = UploadEngine::new(
            Arc::new(FsChunkStore::new(&chunks).unwrap()),
            Arc::new(sink.clone()),
            EngineConfig::default(),
        );
        assert_eq!(engine.query_resume("s1").unwrap(), vec![0]);
        engine.write_chunk(chunk("s1", 1, 2, b"World")).unwrap();
        let outcome = engine.merge("s1", "", "").unwrap();
        assert_eq!(sink.get(&outcome.artifact_name).unwrap(), b"Hello World");
        assert!(!chunks.join("s1").exists());
    }

    #[test]
    fn fs_backends_end_to_end() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = UploadEngine::new(
            Arc::new(FsChunkStore::new(dir.path().join("chunks")).unwrap()),
            Arc::new(FsArtifactSink::new(dir.path().join("files"), "http://files.local/").unwrap()),
            EngineConfig::default(),
        );
        engine.write_chunk(chunk("s1", 1, 2, b"-two")).unwrap();
        engine.write_chunk(chunk("s1", 0, 2, b"one")).unwrap();

        let outcome = engine.merge("s1", "out.txt", "").unwrap();
        assert_eq!(
            outcome.artifact_url,
            format!("http://files.local/{}", outcome.artifact_name)
        );
        let bytes = std::fs::read(dir.path().join("files").join(&outcome.artifact_name)).unwrap();
        assert_eq!(bytes, b"one-two");
    }

    // -----------------------------------------------------------------------
    // Sink failures
    // -----------------------------------------------------------------------

    /// Fails the first `failures` commits, then behaves like the wrapped sink.
    struct FlakySink {
        inner: MemoryArtifactSink,
        failures: AtomicU32,
    }

    struct FlakyWriter {
        inner: Box<dyn ArtifactWriter>,
        fail: bool,
    }

    impl Write for FlakyWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.inner.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.inner.flush()
        }
    }

    impl ArtifactWriter for FlakyWriter {
        fn commit(self: Box<Self>) -> Result<String, StoreError> {
            if self.fail {
                return Err(StoreError::Io(std::io::Error::other("sink unavailable")));
            }
            self.inner.commit()
        }
    }

    impl ArtifactSink for FlakySink {
        fn begin(&self, name: &str) -> Result<Box<dyn ArtifactWriter>, StoreError> {
            let fail = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            Ok(Box::new(FlakyWriter {
                inner: self.inner.begin(name)?,
                fail,
            }))
        }
    }

    #[test]
    fn merge_can_be_retried_after_sink_failure() {
        let store = Arc::new(MemoryChunkStore::new());
        let memory = MemoryArtifactSink::new();
        let engine = UploadEngine::new(
            store.clone(),
            Arc::new(FlakySink {
                inner: memory.clone(),
                failures: AtomicU32::new(1),
            }),
            EngineConfig::default(),
        );
        engine.write_chunk(chunk("s1", 0, 1, b"data")).unwrap();

        let err = engine.merge("s1", "", "").unwrap_err();
        assert!(err.is_retryable(), "{err}");
        assert!(memory.is_empty());
        assert!(store.contains_session("s1"));
        assert!(!engine.registry().snapshot("s1").unwrap().merging);

        let outcome = engine.merge("s1", "", "").unwrap();
        assert_eq!(memory.get(&outcome.artifact_name).unwrap(), b"data");
    }
}
