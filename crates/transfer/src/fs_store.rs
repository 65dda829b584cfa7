use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::StoreError;
use crate::store::{ChunkStore, NamespaceInfo, ensure_contiguous};
use crate::validation::validate_session_id;

const CHUNK_SUFFIX: &str = ".part";
const TEMP_MARKER: &str = ".tmp-";

/// Filesystem chunk store.
///
/// Layout: `<root>/<session_id>/<chunk_index>.part`. Each chunk is
/// written to a uniquely named temp file in the same directory, fsynced,
/// then renamed over the final name, so a crash never leaves a truncated
/// `.part` file behind.
pub struct FsChunkStore {
    root: PathBuf,
}

impl FsChunkStore {
    /// Creates a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        validate_session_id(session_id)?;
        Ok(self.root.join(session_id))
    }
}

fn chunk_file_name(chunk_index: u32) -> String {
    format!("{chunk_index}{CHUNK_SUFFIX}")
}

/// Parses `<index>.part`; temp files and strays yield `None`.
fn parse_chunk_file_name(name: &str) -> Option<u32> {
    let digits = name.strip_suffix(CHUNK_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Maps `NotFound` to `None`: the entry was renamed or discarded while
/// being listed.
fn unless_vanished<T>(result: std::io::Result<T>) -> std::io::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Flushes directory metadata so a rename survives a crash.
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
    #[cfg(not(unix))]
    let _ = dir;
}

impl ChunkStore for FsChunkStore {
    fn put(&self, session_id: &str, chunk_index: u32, data: &[u8]) -> Result<(), StoreError> {
        let dir = self.session_dir(session_id)?;
        fs::create_dir_all(&dir)?;

        let final_path = dir.join(chunk_file_name(chunk_index));
        let tmp_path = dir.join(format!(
            "{}{TEMP_MARKER}{}",
            chunk_file_name(chunk_index),
            uuid::Uuid::new_v4().simple()
        ));

        let written = (|| -> std::io::Result<()> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
            fs::rename(&tmp_path, &final_path)
        })();

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        sync_dir(&dir);
        debug!(session = %session_id, chunk = chunk_index, bytes = data.len(), "chunk persisted");
        Ok(())
    }

    fn list(&self, session_id: &str) -> Result<Vec<u32>, StoreError> {
        let dir = self.session_dir(session_id)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut indices = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(index) = entry.file_name().to_str().and_then(parse_chunk_file_name) {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    fn read_chunk(&self, session_id: &str, chunk_index: u32) -> Result<Vec<u8>, StoreError> {
        let path = self.session_dir(session_id)?.join(chunk_file_name(chunk_index));
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::MissingChunk(chunk_index)),
            Err(e) => Err(e.into()),
        }
    }

    fn discard(&self, session_id: &str) -> Result<(), StoreError> {
        let dir = self.session_dir(session_id)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!(session = %session_id, "chunk namespace removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn namespaces(&self) -> Result<Vec<NamespaceInfo>, StoreError> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let Some(entry) = unless_vanished(entry)? else { continue };
            let Some(file_type) = unless_vanished(entry.file_type())? else { continue };
            if !file_type.is_dir() {
                continue;
            }
            let Some(session_id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_session_id(&session_id).is_err() {
                warn!(dir = %entry.path().display(), "ignoring foreign directory in chunk store");
                continue;
            }

            // The newest file decides; an empty namespace falls back to the directory.
            let Some(meta) = unless_vanished(entry.metadata())? else { continue };
            let mut last_modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let Some(files) = unless_vanished(fs::read_dir(entry.path()))? else { continue };
            for file in files {
                let Some(file) = unless_vanished(file)? else { continue };
                let Some(meta) = unless_vanished(file.metadata())? else { continue };
                if let Ok(modified) = meta.modified() {
                    last_modified = last_modified.max(modified);
                }
            }

            found.push(NamespaceInfo {
                session_id,
                last_modified,
            });
        }
        Ok(found)
    }

    fn read_in_order(
        &self,
        session_id: &str,
        total_chunks: u32,
        out: &mut dyn Write,
    ) -> Result<u64, StoreError> {
        ensure_contiguous(&self.list(session_id)?, total_chunks)?;

        let dir = self.session_dir(session_id)?;
        let mut copied = 0u64;
        for index in 0..total_chunks {
            let mut file = match File::open(dir.join(chunk_file_name(index))) {
                Ok(f) => f,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(StoreError::MissingChunk(index));
                }
                Err(e) => return Err(e.into()),
            };
            copied += std::io::copy(&mut file, out)?;
        }
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, FsChunkStore) {
        let dir = TempDir::new().unwrap();
        let store = FsChunkStore::new(dir.path().join("chunks")).unwrap();
        (dir, store)
    }

    #[test]
    fn new_creates_root() {
        let (_dir, store) = store();
        assert!(store.root().is_dir());
    }

    #[test]
    fn put_writes_part_file() {
        let (_dir, store) = store();
        store.put("s1", 3, b"hello").unwrap();

        let path = store.root().join("s1").join("3.part");
        assert_eq!(fs::read(path).unwrap(), b"hello");
    }

    #[test]
    fn put_leaves_no_temp_files() {
        let (_dir, store) = store();
        store.put("s1", 0, b"a").unwrap();
        store.put("s1", 0, b"b").unwrap();

        let names: Vec<String> = fs::read_dir(store.root().join("s1"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["0.part"]);
        assert_eq!(store.read_chunk("s1", 0).unwrap(), b"b");
    }

    #[test]
    fn list_ignores_temp_and_stray_files() {
        let (_dir, store) = store();
        store.put("s1", 1, b"b").unwrap();
        store.put("s1", 0, b"a").unwrap();

        let ns = store.root().join("s1");
        fs::write(ns.join("2.part.tmp-deadbeef"), b"partial").unwrap();
        fs::write(ns.join("notes.txt"), b"?").unwrap();

        assert_eq!(store.list("s1").unwrap(), vec![0, 1]);
    }

    #[test]
    fn list_unknown_session_is_empty() {
        let (_dir, store) = store();
        assert!(store.list("missing").unwrap().is_empty());
    }

    #[test]
    fn read_missing_chunk() {
        let (_dir, store) = store();
        store.put("s1", 0, b"a").unwrap();
        assert!(matches!(
            store.read_chunk("s1", 5),
            Err(StoreError::MissingChunk(5))
        ));
    }

    #[test]
    fn read_in_order_streams_chunks() {
        let (_dir, store) = store();
        store.put("s1", 1, b" World").unwrap();
        store.put("s1", 0, b"Hello").unwrap();

        let mut out = Vec::new();
        let n = store.read_in_order("s1", 2, &mut out).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&out, b"Hello World");
    }

    #[test]
    fn read_in_order_reports_gap() {
        let (_dir, store) = store();
        store.put("s1", 0, b"a").unwrap();
        store.put("s1", 2, b"c").unwrap();

        let mut out = Vec::new();
        assert!(matches!(
            store.read_in_order("s1", 3, &mut out),
            Err(StoreError::MissingChunk(1))
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn discard_is_idempotent() {
        let (_dir, store) = store();
        store.put("s1", 0, b"a").unwrap();
        store.discard("s1").unwrap();
        assert!(!store.root().join("s1").exists());
        store.discard("s1").unwrap();
    }

    #[test]
    fn namespaces_skip_foreign_entries() {
        let (_dir, store) = store();
        store.put("s1", 0, b"a").unwrap();
        store.put("s2", 0, b"b").unwrap();
        fs::write(store.root().join("README"), b"not a session").unwrap();
        fs::create_dir(store.root().join("bad name")).unwrap();

        let mut ids: Vec<String> = store
            .namespaces()
            .unwrap()
            .into_iter()
            .map(|ns| ns.session_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["s1", "s2"]);
    }

    #[test]
    fn traversal_session_id_rejected() {
        let (_dir, store) = store();
        assert!(matches!(
            store.put("../outside", 0, b"evil"),
            Err(StoreError::InvalidSessionId(_))
        ));
        assert!(matches!(
            store.discard(".."),
            Err(StoreError::InvalidSessionId(_))
        ));
    }

    #[test]
    fn chunk_file_names() {
        assert_eq!(chunk_file_name(12), "12.part");
        assert_eq!(parse_chunk_file_name("12.part"), Some(12));
        assert_eq!(parse_chunk_file_name("12.part.tmp-abc"), None);
        assert_eq!(parse_chunk_file_name("x.part"), None);
        assert_eq!(parse_chunk_file_name("+3.part"), None);
        assert_eq!(parse_chunk_file_name("-3.part"), None);
        assert_eq!(parse_chunk_file_name(".part"), None);
    }

    #[test]
    fn list_ignores_signed_names() {
        let (_dir, store) = store();
        store.put("s1", 3, b"x").unwrap();
        fs::write(store.root().join("s1").join("+4.part"), b"stray").unwrap();

        assert_eq!(store.list("s1").unwrap(), vec![3]);
    }

    #[test]
    fn namespaces_survive_concurrent_puts() {
        let (_dir, store) = store();
        store.put("idle", 0, b"old").unwrap();
        let stop = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                let mut i = 0u32;
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    store.put("live", i % 64, b"payload").unwrap();
                    if i % 64 == 63 {
                        store.discard("live").unwrap();
                    }
                    i += 1;
                }
            });

            let listings: Vec<_> = (0..500).map(|_| store.namespaces()).collect();
            stop.store(true, std::sync::atomic::Ordering::Relaxed);

            for found in listings {
                let found = found.unwrap();
                assert!(found.iter().any(|n| n.session_id == "idle"));
            }
        });
    }
}
