//! Resumable upload pipeline.
//!
//! Flow for one file:
//! 1. Split the source into fixed-size chunks.
//! 2. Ask the server which chunks it already holds and open the session.
//! 3. Send the missing chunks, retrying transient failures.
//! 4. Request the merge. If the server still reports gaps, resend them
//!    and merge again. If it has forgotten the session, re-open it first.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chunkyard_protocol::envelope::ErrorKind;
use chunkyard_protocol::{MergeRequest, OpenSessionRequest, OpenSessionResponse};
use chunkyard_transfer::{Chunk, ChunkReader, DEFAULT_CHUNK_SIZE};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::retry::{RetryError, RetryPolicy, Sleeper, TokioSleeper, retry};
use crate::transport::{ChunkUpload, UploadTransport};

/// Tunables for one upload.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub chunk_size: usize,
    /// Chunks in flight at once.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Merge attempts before giving up on a server that keeps reporting gaps.
    pub max_merge_rounds: u32,
    /// MIME type declared to the server.
    pub file_type: String,
    /// Attach a SHA-256 checksum to every chunk.
    pub checksums: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: 1,
            retry: RetryPolicy::default(),
            max_merge_rounds: 3,
            file_type: String::new(),
            checksums: true,
        }
    }
}

/// Progress events emitted during an upload.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Started {
        session_id: String,
        total_chunks: u32,
        already_uploaded: u32,
    },
    ChunkUploaded {
        chunk_index: u32,
        uploaded: u32,
        total_chunks: u32,
    },
    Retrying {
        chunk_index: Option<u32>,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Merging {
        round: u32,
    },
    Completed {
        artifact_url: Option<String>,
    },
}

/// Result of a finished upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub session_id: String,
    pub artifact_url: Option<String>,
    pub total_chunks: u32,
    /// Chunks this run actually sent.
    pub chunks_sent: u32,
    /// Chunks the server already had when the run started.
    pub chunks_skipped: u32,
    /// Artifact size as reported by the server (0 if already merged).
    pub size: u64,
    /// The session had been merged before this run.
    pub already_merged: bool,
}

type SharedReader<R> = Arc<Mutex<ChunkReader<R>>>;

/// Uploads files through an [`UploadTransport`].
pub struct UploadClient {
    transport: Arc<dyn UploadTransport>,
    options: UploadOptions,
    sleeper: Arc<dyn Sleeper>,
    events: Option<mpsc::Sender<UploadEvent>>,
    cancel: CancellationToken,
}

impl UploadClient {
    pub fn new(transport: Arc<dyn UploadTransport>, options: UploadOptions) -> Self {
        Self {
            transport,
            options,
            sleeper: Arc::new(TokioSleeper),
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Replaces the timer used between retries.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Sends progress events to `tx`. Events are dropped when it is full.
    pub fn with_events(mut self, tx: mpsc::Sender<UploadEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Stops the upload when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn options(&self) -> &UploadOptions {
        &self.options
    }

    /// Uploads the file at `path`.
    ///
    /// Passing the `session_id` of an interrupted upload resumes it; `None`
    /// starts a new session.
    pub async fn upload_file(
        &self,
        path: &Path,
        session_id: Option<String>,
    ) -> Result<UploadOutcome, ClientError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".into());
        let file = File::open(path)?;
        self.upload_reader(file, &file_name, session_id).await
    }

    /// Uploads any seekable source under `file_name`.
    pub async fn upload_reader<R>(
        &self,
        source: R,
        file_name: &str,
        session_id: Option<String>,
    ) -> Result<UploadOutcome, ClientError>
    where
        R: Read + Seek + Send + 'static,
    {
        let chunk_size = self.options.chunk_size;
        let reader = tokio::task::spawn_blocking(move || ChunkReader::new(source, chunk_size))
            .await
            .map_err(std::io::Error::other)??;
        let total_chunks = reader.chunk_count()?;
        let reader: SharedReader<R> = Arc::new(Mutex::new(reader));
        let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let job = Job {
            session_id,
            file_name: file_name.to_string(),
            total_chunks,
        };
        self.run(&job, &reader).await
    }

    async fn run<R>(&self, job: &Job, reader: &SharedReader<R>) -> Result<UploadOutcome, ClientError>
    where
        R: Read + Seek + Send + 'static,
    {
        self.check_cancelled()?;

        let resumed = self
            .with_retry(|| self.transport.query_resume(job.session_id.clone()))
            .await?;

        let opened = match self.open_session(job).await {
            Ok(o) => o,
            Err(ClientError::Server(e)) if e.kind == ErrorKind::AlreadyMerged => {
                info!(session_id = %job.session_id, "session already merged");
                return Ok(job.already_merged(e.artifact_url));
            }
            Err(e) => return Err(e),
        };

        let mut uploaded: BTreeSet<u32> = resumed
            .into_iter()
            .chain(opened.uploaded_chunks)
            .filter(|&i| i < job.total_chunks)
            .collect();
        let skipped = uploaded.len() as u32;

        info!(
            session_id = %job.session_id,
            total_chunks = job.total_chunks,
            skipped,
            "starting upload"
        );
        self.emit(UploadEvent::Started {
            session_id: job.session_id.clone(),
            total_chunks: job.total_chunks,
            already_uploaded: skipped,
        });

        let mut sent = 0;
        let mut last_missing = Vec::new();

        for round in 1..=self.options.max_merge_rounds.max(1) {
            let pending: Vec<u32> = (0..job.total_chunks)
                .filter(|i| !uploaded.contains(i))
                .collect();
            sent += self.send_chunks(job, reader, pending, &mut uploaded).await?;

            self.check_cancelled()?;
            self.emit(UploadEvent::Merging { round });

            let merged = self
                .with_retry(|| {
                    self.transport.merge(MergeRequest {
                        session_id: job.session_id.clone(),
                        file_name: job.file_name.clone(),
                        file_type: self.options.file_type.clone(),
                    })
                })
                .await;

            match merged {
                Ok(resp) => {
                    info!(
                        session_id = %job.session_id,
                        artifact_url = %resp.artifact_url,
                        size = resp.size,
                        "upload complete"
                    );
                    self.emit(UploadEvent::Completed {
                        artifact_url: Some(resp.artifact_url.clone()),
                    });
                    return Ok(UploadOutcome {
                        session_id: job.session_id.clone(),
                        artifact_url: Some(resp.artifact_url),
                        total_chunks: job.total_chunks,
                        chunks_sent: sent,
                        chunks_skipped: skipped,
                        size: resp.size,
                        already_merged: false,
                    });
                }
                Err(ClientError::Server(e)) if e.kind == ErrorKind::IncompleteUpload => {
                    warn!(
                        session_id = %job.session_id,
                        round,
                        missing = e.missing_chunks.len(),
                        "server reports missing chunks"
                    );
                    last_missing = e.missing_chunks.clone();
                    let held = self
                        .with_retry(|| self.transport.query_resume(job.session_id.clone()))
                        .await?;
                    uploaded = held.into_iter().collect();
                    for index in &e.missing_chunks {
                        uploaded.remove(index);
                    }
                }
                Err(ClientError::Server(e)) if e.kind == ErrorKind::SessionNotFound => {
                    // The server lost the session (restart or expiry); the
                    // store still holds the chunks, so re-open and go again.
                    warn!(session_id = %job.session_id, round, "session lost before merge, re-opening");
                    let reopened = match self.open_session(job).await {
                        Ok(o) => o,
                        Err(ClientError::Server(e)) if e.kind == ErrorKind::AlreadyMerged => {
                            return Ok(job.already_merged(e.artifact_url));
                        }
                        Err(e) => return Err(e),
                    };
                    uploaded = reopened
                        .uploaded_chunks
                        .into_iter()
                        .filter(|&i| i < job.total_chunks)
                        .collect();
                }
                Err(ClientError::Server(e)) if e.kind == ErrorKind::AlreadyMerged => {
                    return Ok(job.already_merged(e.artifact_url));
                }
                Err(e) => return Err(e),
            }
        }

        Err(ClientError::MergeFailed {
            session_id: job.session_id.clone(),
            rounds: self.options.max_merge_rounds.max(1),
            missing: last_missing,
        })
    }

    async fn open_session(&self, job: &Job) -> Result<OpenSessionResponse, ClientError> {
        self.with_retry(|| {
            self.transport.open_session(OpenSessionRequest {
                session_id: job.session_id.clone(),
                total_chunks: job.total_chunks,
                file_name: job.file_name.clone(),
                file_type: self.options.file_type.clone(),
            })
        })
        .await
    }

    /// Sends `pending` with up to `concurrency` chunks in flight.
    ///
    /// Stops at the first chunk that runs out of retries.
    async fn send_chunks<R>(
        &self,
        job: &Job,
        reader: &SharedReader<R>,
        pending: Vec<u32>,
        uploaded: &mut BTreeSet<u32>,
    ) -> Result<u32, ClientError>
    where
        R: Read + Seek + Send + 'static,
    {
        let mut sent = 0;
        let mut stream = futures_util::stream::iter(pending)
            .map(|index| self.send_chunk(job, reader, index))
            .buffer_unordered(self.options.concurrency.max(1));

        while let Some(result) = stream.next().await {
            let index = result?;
            uploaded.insert(index);
            sent += 1;
            self.emit(UploadEvent::ChunkUploaded {
                chunk_index: index,
                uploaded: uploaded.len() as u32,
                total_chunks: job.total_chunks,
            });
        }
        Ok(sent)
    }

    async fn send_chunk<R>(
        &self,
        job: &Job,
        reader: &SharedReader<R>,
        index: u32,
    ) -> Result<u32, ClientError>
    where
        R: Read + Seek + Send + 'static,
    {
        self.check_cancelled()?;
        let chunk = read_chunk(reader, index).await?;
        let upload = ChunkUpload {
            session_id: job.session_id.clone(),
            chunk_index: index,
            total_chunks: job.total_chunks,
            file_name: job.file_name.clone(),
            file_type: self.options.file_type.clone(),
            checksum: if self.options.checksums {
                chunk.checksum
            } else {
                String::new()
            },
            data: chunk.data,
        };

        let result = retry(
            &self.options.retry,
            self.sleeper.as_ref(),
            ClientError::is_retryable,
            |attempt, err, delay| {
                warn!(chunk_index = index, attempt, ?delay, error = %err, "chunk upload failed, retrying");
                self.emit(UploadEvent::Retrying {
                    chunk_index: Some(index),
                    attempt,
                    delay,
                    error: err.to_string(),
                });
            },
            |_| self.transport.write_chunk(upload.clone()),
        )
        .await;

        match result {
            Ok(_) => {
                debug!(chunk_index = index, "chunk acknowledged");
                Ok(index)
            }
            Err(RetryError { attempts, error }) => Err(ClientError::ChunkFailed {
                chunk_index: index,
                attempts,
                source: Box::new(error),
            }),
        }
    }

    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ClientError>>,
    {
        retry(
            &self.options.retry,
            self.sleeper.as_ref(),
            ClientError::is_retryable,
            |attempt, err, delay| {
                warn!(attempt, ?delay, error = %err, "request failed, retrying");
                self.emit(UploadEvent::Retrying {
                    chunk_index: None,
                    attempt,
                    delay,
                    error: err.to_string(),
                });
            },
            |_| op(),
        )
        .await
        .map_err(|e| e.error)
    }

    fn emit(&self, event: UploadEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.try_send(event);
        }
    }

    fn check_cancelled(&self) -> Result<(), ClientError> {
        if self.cancel.is_cancelled() {
            Err(ClientError::Cancelled)
        } else {
            Ok(())
        }
    }
}

struct Job {
    session_id: String,
    file_name: String,
    total_chunks: u32,
}

impl Job {
    fn already_merged(&self, artifact_url: Option<String>) -> UploadOutcome {
        UploadOutcome {
            session_id: self.session_id.clone(),
            artifact_url,
            total_chunks: self.total_chunks,
            chunks_sent: 0,
            chunks_skipped: self.total_chunks,
            size: 0,
            already_merged: true,
        }
    }
}

async fn read_chunk<R>(reader: &SharedReader<R>, index: u32) -> Result<Chunk, ClientError>
where
    R: Read + Seek + Send + 'static,
{
    let reader = Arc::clone(reader);
    let chunk = tokio::task::spawn_blocking(move || reader.lock().unwrap().read_chunk(index))
        .await
        .map_err(std::io::Error::other)??;
    Ok(chunk)
}
