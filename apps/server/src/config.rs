//! Server configuration.
//!
//! Stored as TOML at `$CHUNKYARD_CONFIG`, or
//! `~/.config/chunkyard/server.toml` when unset.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chunkyard_engine::EngineConfig;
use serde::{Deserialize, Serialize};

const CONFIG_ENV: &str = "CHUNKYARD_CONFIG";

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address to listen on.
    #[serde(default = "default_bind")]
    pub bind: IpAddr,

    /// WebSocket port (0 = auto-assign).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Where in-flight chunks are kept.
    #[serde(default = "default_chunk_dir")]
    pub chunk_dir: PathBuf,

    /// Where merged artifacts are written.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,

    /// Prefix of the artifact URLs handed to clients.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// Idle time after which an unmerged session is discarded.
    #[serde(default = "default_session_max_age_secs")]
    pub session_max_age_secs: u64,

    /// How often expired sessions are swept.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: usize,

    #[serde(default = "default_max_total_chunks")]
    pub max_total_chunks: u32,
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    7878
}

fn data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".local").join("share").join("chunkyard")
}

fn default_chunk_dir() -> PathBuf {
    data_dir().join("chunks")
}

fn default_artifact_dir() -> PathBuf {
    data_dir().join("artifacts")
}

fn default_public_base_url() -> String {
    "http://localhost:7878/artifacts".into()
}

fn default_session_max_age_secs() -> u64 {
    24 * 60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_max_chunk_bytes() -> usize {
    EngineConfig::default().max_chunk_bytes
}

fn default_max_total_chunks() -> u32 {
    EngineConfig::default().max_total_chunks
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            chunk_dir: default_chunk_dir(),
            artifact_dir: default_artifact_dir(),
            public_base_url: default_public_base_url(),
            session_max_age_secs: default_session_max_age_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_chunk_bytes: default_max_chunk_bytes(),
            max_total_chunks: default_max_total_chunks(),
        }
    }
}

impl Config {
    /// Loads configuration from disk, or writes a default if not found.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            tracing::info!(path = %path.display(), "wrote default configuration");
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.sweep_interval_secs > 0, "sweep_interval_secs must be positive");
        anyhow::ensure!(self.session_max_age_secs > 0, "session_max_age_secs must be positive");
        anyhow::ensure!(self.max_chunk_bytes > 0, "max_chunk_bytes must be positive");
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_chunk_bytes: self.max_chunk_bytes,
            max_total_chunks: self.max_total_chunks,
        }
    }

    pub fn session_max_age(&self) -> Duration {
        Duration::from_secs(self.session_max_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
        .join(".config")
        .join("chunkyard")
        .join("server.toml")
}
