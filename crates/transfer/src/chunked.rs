use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::{DEFAULT_CHUNK_SIZE, StoreError};

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Returns `true` if `expected` is empty or matches the SHA-256 of `data`.
///
/// Hex comparison is case-insensitive.
pub fn verify_checksum(data: &[u8], expected: &str) -> bool {
    expected.is_empty() || checksum_bytes(data).eq_ignore_ascii_case(expected)
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
pub fn calculate_file_checksum(path: &Path) -> Result<String, StoreError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// One fixed-size slice of a source file.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Zero-based chunk index.
    pub index: u32,
    /// Byte offset within the source.
    pub offset: u64,
    /// Raw chunk data.
    pub data: Vec<u8>,
    /// SHA-256 hex checksum of `data`.
    pub checksum: String,
}

/// Splits a seekable source into fixed-size chunks addressed by index.
///
/// Every chunk has `chunk_size` bytes except possibly the last one.
pub struct ChunkReader<R> {
    source: R,
    chunk_size: usize,
    len: u64,
}

impl ChunkReader<File> {
    /// Opens `path` for chunked reading.
    ///
    /// If `chunk_size` is 0, [`DEFAULT_CHUNK_SIZE`] is used.
    pub fn open(path: &Path, chunk_size: usize) -> Result<Self, StoreError> {
        let file = File::open(path)?;
        Self::new(file, chunk_size)
    }
}

impl<R: Read + Seek> ChunkReader<R> {
    /// Wraps any seekable source. The length is taken from its end position.
    pub fn new(mut source: R, chunk_size: usize) -> Result<Self, StoreError> {
        let len = source.seek(SeekFrom::End(0))?;
        source.seek(SeekFrom::Start(0))?;
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Ok(Self {
            source,
            chunk_size,
            len,
        })
    }

    /// Total source size in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` for an empty source.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Configured chunk size in bytes.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of chunks: `ceil(len / chunk_size)`.
    pub fn chunk_count(&self) -> Result<u32, StoreError> {
        let count = self.len.div_ceil(self.chunk_size as u64);
        u32::try_from(count).map_err(|_| {
            StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{count} chunks exceed the addressable range"),
            ))
        })
    }

    /// Reads chunk `index`.
    pub fn read_chunk(&mut self, index: u32) -> Result<Chunk, StoreError> {
        let offset = index as u64 * self.chunk_size as u64;
        if offset >= self.len {
            return Err(StoreError::MissingChunk(index));
        }

        let size = (self.len - offset).min(self.chunk_size as u64) as usize;
        let mut data = vec![0u8; size];
        self.source.seek(SeekFrom::Start(offset))?;
        self.source.read_exact(&mut data)?;

        let checksum = checksum_bytes(&data);
        Ok(Chunk {
            index,
            offset,
            data,
            checksum,
        })
    }
}
