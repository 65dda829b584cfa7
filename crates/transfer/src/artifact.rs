use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::StoreError;
use crate::validation::{sanitize_file_name, validate_artifact_name};

/// Builds a collision-resistant artifact name for a declared file.
///
/// Format: `{timestamp_ms}-{8 hex}-{sanitized file name}`. When the
/// sanitized name has no extension and `file_type` is a MIME type, its
/// subtype is appended (`image/png` gives `.png`).
pub fn artifact_name(file_name: &str, file_type: &str) -> String {
    let mut base = sanitize_file_name(file_name);
    if !base.contains('.') {
        if let Some(ext) = extension_from_mime(file_type) {
            base.push('.');
            base.push_str(&ext);
        }
    }

    let token = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        chrono::Utc::now().timestamp_millis(),
        &token[..8],
        base
    )
}

fn extension_from_mime(file_type: &str) -> Option<String> {
    let (_, subtype) = file_type.split_once('/')?;
    // Drop parameters and structured-syntax suffixes ("svg+xml; charset=...").
    let subtype = subtype.split([';', '+']).next()?.trim();
    if subtype.is_empty() || !subtype.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return None;
    }
    Some(subtype.to_ascii_lowercase())
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// An open artifact being written.
///
/// Dropping a writer without calling [`commit`](Self::commit) discards
/// whatever was written; no partial artifact becomes visible.
pub trait ArtifactWriter: Write + Send {
    /// Makes the artifact visible and returns its retrievable URL.
    fn commit(self: Box<Self>) -> Result<String, StoreError>;
}

/// Final destination for merged files.
pub trait ArtifactSink: Send + Sync {
    /// Opens a writer for a new artifact called `name`.
    fn begin(&self, name: &str) -> Result<Box<dyn ArtifactWriter>, StoreError>;
}

// ---------------------------------------------------------------------------
// FsArtifactSink
// ---------------------------------------------------------------------------

/// Writes artifacts into a directory and publishes them under a base URL.
pub struct FsArtifactSink {
    dir: PathBuf,
    base_url: String,
}

impl FsArtifactSink {
    /// Creates a sink writing into `dir` (created if needed).
    ///
    /// Artifact URLs are `{base_url}/{name}`.
    pub fn new(dir: impl Into<PathBuf>, base_url: impl Into<String>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Returns the artifact directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ArtifactSink for FsArtifactSink {
    fn begin(&self, name: &str) -> Result<Box<dyn ArtifactWriter>, StoreError> {
        validate_artifact_name(name)?;

        let final_path = self.dir.join(name);
        let tmp_path = self
            .dir
            .join(format!(".{name}.tmp-{}", uuid::Uuid::new_v4().simple()));
        let file = File::create(&tmp_path)?;

        Ok(Box::new(FsArtifactWriter {
            file: Some(file),
            committed: false,
            tmp_path,
            final_path,
            url: format!("{}/{name}", self.base_url),
        }))
    }
}

struct FsArtifactWriter {
    file: Option<File>,
    committed: bool,
    tmp_path: PathBuf,
    final_path: PathBuf,
    url: String,
}

impl FsArtifactWriter {
    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("artifact writer already closed"))
    }
}

impl Write for FsArtifactWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file()?.flush()
    }
}

impl ArtifactWriter for FsArtifactWriter {
    fn commit(mut self: Box<Self>) -> Result<String, StoreError> {
        let file = self
            .file
            .take()
            .ok_or_else(|| io::Error::other("artifact writer already closed"))?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.tmp_path, &self.final_path)?;
        self.committed = true;
        info!(path = %self.final_path.display(), "artifact committed");
        Ok(std::mem::take(&mut self.url))
    }
}

impl Drop for FsArtifactWriter {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        drop(self.file.take());
        if let Err(e) = fs::remove_file(&self.tmp_path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %self.tmp_path.display(), error = %e, "failed to remove partial artifact");
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryArtifactSink
// ---------------------------------------------------------------------------

/// Keeps committed artifacts in memory. Cloning shares the storage.
#[derive(Clone, Default)]
pub struct MemoryArtifactSink {
    artifacts: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryArtifactSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of a committed artifact's bytes.
    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.artifacts.lock().unwrap().get(name).cloned()
    }

    /// Number of committed artifacts.
    pub fn len(&self) -> usize {
        self.artifacts.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of committed artifacts, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.artifacts.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

impl ArtifactSink for MemoryArtifactSink {
    fn begin(&self, name: &str) -> Result<Box<dyn ArtifactWriter>, StoreError> {
        validate_artifact_name(name)?;
        Ok(Box::new(MemoryArtifactWriter {
            name: name.to_string(),
            buf: Vec::new(),
            artifacts: Arc::clone(&self.artifacts),
        }))
    }
}

struct MemoryArtifactWriter {
    name: String,
    buf: Vec<u8>,
    artifacts: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl Write for MemoryArtifactWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ArtifactWriter for MemoryArtifactWriter {
    fn commit(self: Box<Self>) -> Result<String, StoreError> {
        let url = format!("memory://{}", self.name);
        let MemoryArtifactWriter {
            name,
            buf,
            artifacts,
        } = *self;
        artifacts.lock().unwrap().insert(name, buf);
        Ok(url)
    }
}
