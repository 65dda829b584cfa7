//! Background expiry sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::UploadEngine;

/// Spawns a task that calls [`UploadEngine::sweep_expired`] every
/// `interval` until `cancel` fires.
///
/// The sweep itself runs on the blocking pool.
pub fn spawn_sweeper(
    engine: Arc<UploadEngine>,
    interval: Duration,
    max_age: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // Skip immediate first tick.

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let engine = Arc::clone(&engine);
                    match tokio::task::spawn_blocking(move || engine.sweep_expired(max_age)).await {
                        Ok(expired) if !expired.is_empty() => {
                            info!(count = expired.len(), "expired sessions reclaimed");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "sweep task failed"),
                    }
                }
            }
        }

        debug!("sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::{ChunkWrite, EngineConfig};
    use chunkyard_transfer::{MemoryArtifactSink, MemoryChunkStore};

    #[tokio::test]
    async fn sweeper_reclaims_idle_sessions() {
        let clock = Arc::new(ManualClock::new());
        let engine = Arc::new(UploadEngine::with_clock(
            Arc::new(MemoryChunkStore::new()),
            Arc::new(MemoryArtifactSink::new()),
            EngineConfig::default(),
            clock.clone(),
        ));
        engine
            .write_chunk(ChunkWrite {
                session_id: "idle",
                chunk_index: 0,
                total_chunks: 2,
                file_name: "a.bin",
                file_type: "",
                checksum: "",
                data: b"x",
            })
            .unwrap();
        clock.advance(Duration::from_secs(600));

        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(
            engine.clone(),
            Duration::from_millis(10),
            Duration::from_secs(60),
            cancel.clone(),
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while !engine.registry().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session should be swept");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("should stop")
            .expect("no panic");
    }

    #[tokio::test]
    async fn sweeper_stops_on_cancel() {
        let engine = Arc::new(UploadEngine::new(
            Arc::new(MemoryChunkStore::new()),
            Arc::new(MemoryArtifactSink::new()),
            EngineConfig::default(),
        ));
        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(
            engine,
            Duration::from_secs(3600),
            Duration::from_secs(60),
            cancel.clone(),
        );

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("should stop")
            .expect("no panic");
    }
}
