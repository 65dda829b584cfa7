//! Wires storage, engine, sweeper and WebSocket server together.

use std::sync::Arc;

use chunkyard_engine::{UploadEngine, spawn_sweeper};
use chunkyard_server::{ServerConfig, UploadHandler, UploadServer};
use chunkyard_transfer::{FsArtifactSink, FsChunkStore};
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Builds the server and its engine from `config` without starting them.
pub fn build(config: &Config) -> anyhow::Result<Arc<UploadServer<UploadHandler>>> {
    let store = Arc::new(FsChunkStore::new(&config.chunk_dir)?);
    let sink = Arc::new(FsArtifactSink::new(
        &config.artifact_dir,
        config.public_base_url.clone(),
    )?);
    let engine = Arc::new(UploadEngine::new(store, sink, config.engine_config()));

    let server_config = ServerConfig {
        bind: config.bind,
        port: config.port,
    };
    Ok(UploadServer::new(server_config, UploadHandler::new(engine)))
}

/// Runs the server until Ctrl-C.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let server = build(&config)?;

    let sweeper = spawn_sweeper(
        Arc::clone(server.handler().engine()),
        config.sweep_interval(),
        config.session_max_age(),
        cancel.child_token(),
    );

    let server_run = Arc::clone(&server);
    let mut server_task = tokio::spawn(async move { server_run.run().await });

    tokio::select! {
        result = &mut server_task => {
            cancel.cancel();
            let _ = sweeper.await;
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(e.into()),
            };
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
    }

    server.shutdown();
    cancel.cancel();
    let _ = sweeper.await;
    if let Ok(Err(e)) = server_task.await {
        tracing::error!(error = %e, "server stopped with an error");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    #[tokio::test]
    async fn built_server_listens_and_stops() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            chunk_dir: tmp.path().join("chunks"),
            artifact_dir: tmp.path().join("artifacts"),
            ..Config::default()
        };

        let server = build(&config).unwrap();
        assert!(config.chunk_dir.is_dir());
        assert!(config.artifact_dir.is_dir());

        let runner = Arc::clone(&server);
        let task = tokio::spawn(async move { runner.run().await });

        for _ in 0..100 {
            if server.port().await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(server.port().await > 0);

        server.shutdown();
        task.await.unwrap().unwrap();
    }
}
