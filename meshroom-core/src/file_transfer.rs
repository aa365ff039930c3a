//! Chunked file transfer over the relay
//!
//! A transfer is three message kinds: `file_start` with the declared
//! metadata and SHA-256 content hash, one `file_chunk` per fixed-size slice,
//! and `file_end`. Chunks carry an explicit index and may arrive in any
//! order. The receiver places them by index and only delivers the artifact
//! when every chunk is present and both the recomputed hash and the size
//! match the declaration.

use crate::config::{RoomConfig, DEFAULT_CHUNK_SIZE};
use crate::identity::PeerId;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default fixed delay between outgoing chunks
pub const DEFAULT_CHUNK_DELAY: Duration = Duration::from_millis(10);

/// File transfer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Relay channel went away mid-transfer
    #[error("Transfer channel closed")]
    ChannelClosed,

    /// Chunk index beyond the declared count
    #[error("Chunk index {index} out of bounds (total {total})")]
    ChunkOutOfBounds {
        /// Offending index
        index: u32,
        /// Declared chunk count
        total: u32,
    },

    /// End arrived with chunks missing
    #[error("Transfer incomplete: {} chunks missing", missing.len())]
    Incomplete {
        /// Indices never received
        missing: Vec<u32>,
    },

    /// Declaration or chunk stream is unusable
    #[error("Malformed transfer: {0}")]
    Malformed(String),

    /// Reassembled content does not match the declaration
    #[error(
        "Integrity mismatch: expected {expected_hash} ({expected_size} bytes), \
         got {actual_hash} ({actual_size} bytes)"
    )]
    IntegrityMismatch {
        /// Declared hash
        expected_hash: String,
        /// Recomputed hash
        actual_hash: String,
        /// Declared size
        expected_size: u64,
        /// Reassembled size
        actual_size: u64,
    },

    /// Chunk or end without a preceding start
    #[error("No transfer in progress from {0}")]
    UnknownTransfer(String),
}

/// Declared metadata carried by `file_start`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    /// File name
    pub filename: String,
    /// Total size in bytes
    pub size: u64,
    /// MIME type
    pub mime_type: String,
    /// Number of chunks that follow
    pub total_chunks: u32,
    /// Lower-case hex SHA-256 of the whole content
    pub hash: String,
}

/// SHA-256 of `data` as lower-case hex
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Number of chunks for `size` bytes
pub fn chunk_count(size: u64, chunk_size: usize) -> u32 {
    let chunk_size = chunk_size.max(1) as u64;
    let count = size.div_ceil(chunk_size);
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// Split into chunks of `chunk_size`; the last one may be shorter
pub fn split_chunks(data: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    let chunk_size = chunk_size.max(1);
    (0..data.len())
        .step_by(chunk_size)
        .map(|start| data.slice(start..(start + chunk_size).min(data.len())))
        .collect()
}

/// A file about to be sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFile {
    /// File name
    pub filename: String,
    /// MIME type
    pub mime_type: String,
    /// Content
    pub data: Bytes,
}

impl OutgoingFile {
    /// Wrap content
    pub fn new(
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            filename: filename.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }
}

/// Where the sender puts its three message kinds
#[async_trait]
pub trait TransferSink: Send + Sync {
    /// Emit `file_start`
    async fn send_start(&self, meta: &FileMeta) -> Result<(), TransferError>;

    /// Emit one `file_chunk`
    async fn send_chunk(&self, index: u32, data: Bytes) -> Result<(), TransferError>;

    /// Emit `file_end`
    async fn send_end(&self) -> Result<(), TransferError>;
}

/// Outcome of a completed send
#[derive(Debug, Clone, PartialEq)]
pub struct TransferReport {
    /// What was declared
    pub meta: FileMeta,
    /// Wall time from start to end
    pub elapsed: Duration,
    /// Average throughput in MB/s
    pub throughput_mbps: f64,
}

/// Sending side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSender {
    chunk_size: usize,
    chunk_delay: Duration,
}

impl Default for FileSender {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_DELAY)
    }
}

impl FileSender {
    /// Sender with explicit chunking
    pub fn new(chunk_size: usize, chunk_delay: Duration) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_delay,
        }
    }

    /// Sender from room config
    pub fn from_config(config: &RoomConfig) -> Self {
        Self::new(config.chunk_size, config.chunk_delay())
    }

    /// Metadata that `send` would declare for `file`
    pub fn describe(&self, file: &OutgoingFile) -> FileMeta {
        FileMeta {
            filename: file.filename.clone(),
            size: file.data.len() as u64,
            mime_type: file.mime_type.clone(),
            total_chunks: chunk_count(file.data.len() as u64, self.chunk_size),
            hash: content_hash(&file.data),
        }
    }

    /// Hash, announce, stream chunks with a fixed delay, then end
    ///
    /// `progress` receives the sent percentage after each chunk.
    ///
    /// # Errors
    ///
    /// Returns `ChannelClosed` if the sink goes away; the transfer is abandoned
    #[tracing::instrument(
        skip(self, file, sink, progress),
        fields(filename = %file.filename, size = file.data.len())
    )]
    pub async fn send<S, F>(
        &self,
        file: &OutgoingFile,
        sink: &S,
        mut progress: F,
    ) -> Result<TransferReport, TransferError>
    where
        S: TransferSink + ?Sized,
        F: FnMut(f64) + Send,
    {
        let started = Instant::now();
        let meta = self.describe(file);
        sink.send_start(&meta).await.map_err(abandon)?;

        let chunks = split_chunks(&file.data, self.chunk_size);
        let total = chunks.len();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let index = u32::try_from(index)
                .map_err(|_| TransferError::Malformed("too many chunks".to_string()))?;
            sink.send_chunk(index, chunk).await.map_err(abandon)?;
            progress(percent(index as usize + 1, total));
            if (index as usize) + 1 < total && !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
        }

        sink.send_end().await.map_err(abandon)?;
        if total == 0 {
            progress(100.0);
        }

        let elapsed = started.elapsed();
        let secs = elapsed.as_secs_f64();
        let throughput_mbps = if secs > 0.0 {
            meta.size as f64 / (1024.0 * 1024.0) / secs
        } else {
            0.0
        };
        tracing::info!(
            chunks = meta.total_chunks,
            elapsed_ms = elapsed.as_millis(),
            throughput_mbps,
            "File sent"
        );
        Ok(TransferReport {
            meta,
            elapsed,
            throughput_mbps,
        })
    }
}

fn abandon(err: TransferError) -> TransferError {
    tracing::warn!(error = %err, "Abandoning file transfer");
    err
}

fn percent(done: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        done as f64 * 100.0 / total as f64
    }
}

/// Independent integrity check of a reassembled artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    /// Hash from `file_start`
    pub declared_hash: String,
    /// Hash recomputed over the artifact
    pub computed_hash: String,
    /// Size from `file_start`
    pub declared_size: u64,
    /// Size of the artifact
    pub actual_size: u64,
}

impl Verification {
    /// Verify `data` against a declaration
    pub fn check(meta: &FileMeta, data: &[u8]) -> Self {
        Self {
            declared_hash: meta.hash.clone(),
            computed_hash: content_hash(data),
            declared_size: meta.size,
            actual_size: data.len() as u64,
        }
    }

    /// Hash and size both agree
    pub fn is_valid(&self) -> bool {
        self.declared_hash.eq_ignore_ascii_case(&self.computed_hash)
            && self.declared_size == self.actual_size
    }
}

/// A delivered file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Sender
    pub from: PeerId,
    /// Declaration from `file_start`
    pub meta: FileMeta,
    /// Reassembled content
    pub data: Bytes,
    /// Integrity check result
    pub verification: Verification,
}

impl ReceivedFile {
    /// Whether the artifact matched its declaration
    pub fn is_valid(&self) -> bool {
        self.verification.is_valid()
    }
}

/// Compare a received artifact against the original content
pub fn verify_against(original: &[u8], received: &ReceivedFile) -> Verification {
    Verification {
        declared_hash: content_hash(original),
        computed_hash: content_hash(&received.data),
        declared_size: original.len() as u64,
        actual_size: received.data.len() as u64,
    }
}

/// Receive-side descriptor for one transfer
#[derive(Debug, Clone)]
pub struct IncomingTransfer {
    from: PeerId,
    meta: FileMeta,
    chunks: BTreeMap<u32, Bytes>,
    received_bytes: u64,
    malformed: Option<String>,
}

impl IncomingTransfer {
    /// Open a descriptor from a `file_start`
    ///
    /// # Errors
    ///
    /// Returns `Malformed` if the declared counts cannot describe the size
    pub fn new(from: PeerId, meta: FileMeta) -> Result<Self, TransferError> {
        if meta.filename.trim().is_empty() {
            return Err(TransferError::Malformed("empty filename".to_string()));
        }
        if (meta.size == 0) != (meta.total_chunks == 0)
            || u64::from(meta.total_chunks) > meta.size
        {
            return Err(TransferError::Malformed(format!(
                "{} chunks cannot carry {} bytes",
                meta.total_chunks, meta.size
            )));
        }
        Ok(Self {
            from,
            meta,
            chunks: BTreeMap::new(),
            received_bytes: 0,
            malformed: None,
        })
    }

    /// Declaration
    pub fn meta(&self) -> &FileMeta {
        &self.meta
    }

    /// Place a chunk by index; returns the received percentage
    ///
    /// A repeated index replaces the earlier chunk.
    ///
    /// # Errors
    ///
    /// Returns `ChunkOutOfBounds` and marks the transfer malformed if
    /// `index` is not below the declared count, or `Malformed` once the
    /// received bytes would exceed the declared size
    pub fn accept_chunk(&mut self, index: u32, data: Bytes) -> Result<f64, TransferError> {
        if index >= self.meta.total_chunks {
            self.malformed = Some(format!(
                "chunk {index} beyond declared {}",
                self.meta.total_chunks
            ));
            return Err(TransferError::ChunkOutOfBounds {
                index,
                total: self.meta.total_chunks,
            });
        }
        let replaced = self.chunks.get(&index).map_or(0, |c| c.len() as u64);
        let received = self.received_bytes - replaced + data.len() as u64;
        if received > self.meta.size {
            let reason = format!("{received} bytes exceed declared {}", self.meta.size);
            self.malformed = Some(reason.clone());
            return Err(TransferError::Malformed(reason));
        }
        self.received_bytes = received;
        self.chunks.insert(index, data);
        Ok(self.progress())
    }

    /// Received percentage
    pub fn progress(&self) -> f64 {
        percent(self.chunks.len(), self.meta.total_chunks as usize)
    }

    /// Indices not yet received
    pub fn missing(&self) -> Vec<u32> {
        (0..self.meta.total_chunks)
            .filter(|i| !self.chunks.contains_key(i))
            .collect()
    }

    /// Concatenate chunks in index order and verify
    ///
    /// # Errors
    ///
    /// Returns `Malformed`, `Incomplete` or `IntegrityMismatch`; nothing is
    /// delivered in those cases
    pub fn finish(self) -> Result<ReceivedFile, TransferError> {
        if let Some(reason) = self.malformed {
            return Err(TransferError::Malformed(reason));
        }
        let missing = self.missing();
        if !missing.is_empty() {
            return Err(TransferError::Incomplete { missing });
        }

        // sized from what arrived, not from the declaration
        let capacity = usize::try_from(self.received_bytes).map_err(|_| {
            TransferError::Malformed(format!("{} bytes received", self.received_bytes))
        })?;
        let mut data = BytesMut::with_capacity(capacity);
        for chunk in self.chunks.values() {
            data.extend_from_slice(chunk);
        }
        let data = data.freeze();

        let verification = Verification::check(&self.meta, &data);
        if !verification.is_valid() {
            return Err(TransferError::IntegrityMismatch {
                expected_hash: verification.declared_hash,
                actual_hash: verification.computed_hash,
                expected_size: verification.declared_size,
                actual_size: verification.actual_size,
            });
        }

        Ok(ReceivedFile {
            from: self.from,
            meta: self.meta,
            data,
            verification,
        })
    }
}

/// In-flight incoming transfers, one per sending identity
#[derive(Debug, Default)]
pub struct TransferManager {
    incoming: HashMap<PeerId, IncomingTransfer>,
}

impl TransferManager {
    /// Empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a descriptor; a newer start from the same sender replaces the old one
    ///
    /// # Errors
    ///
    /// Returns `Malformed` if the declaration is unusable
    pub fn on_start(&mut self, from: PeerId, meta: FileMeta) -> Result<(), TransferError> {
        let transfer = IncomingTransfer::new(from.clone(), meta)?;
        tracing::debug!(
            from = %from,
            filename = %transfer.meta().filename,
            size = transfer.meta().size,
            chunks = transfer.meta().total_chunks,
            "Incoming file transfer"
        );
        if let Some(previous) = self.incoming.insert(from.clone(), transfer) {
            tracing::warn!(
                from = %from,
                filename = %previous.meta().filename,
                "Replacing unfinished transfer"
            );
        }
        Ok(())
    }

    /// Place a chunk; returns the received percentage
    ///
    /// # Errors
    ///
    /// Returns `UnknownTransfer` without a start, or the `accept_chunk`
    /// error, after which the descriptor is gone
    pub fn on_chunk(
        &mut self,
        from: &PeerId,
        index: u32,
        data: Bytes,
    ) -> Result<f64, TransferError> {
        let transfer = self
            .incoming
            .get_mut(from)
            .ok_or_else(|| TransferError::UnknownTransfer(from.to_string()))?;
        let accepted = transfer.accept_chunk(index, data);
        if accepted.is_err() {
            // a rejected transfer is reported once; later chunks and the end are unknown
            self.incoming.remove(from);
        }
        accepted
    }

    /// Finalize and discard the descriptor
    ///
    /// # Errors
    ///
    /// Returns `UnknownTransfer` without a start, or the `finish` error
    pub fn on_end(&mut self, from: &PeerId) -> Result<ReceivedFile, TransferError> {
        let transfer = self
            .incoming
            .remove(from)
            .ok_or_else(|| TransferError::UnknownTransfer(from.to_string()))?;
        transfer.finish()
    }

    /// File name of the transfer in flight from `from`
    pub fn filename(&self, from: &PeerId) -> Option<String> {
        self.incoming.get(from).map(|t| t.meta().filename.clone())
    }

    /// Drop the transfer from a removed peer
    pub fn discard(&mut self, from: &PeerId) -> bool {
        let removed = self.incoming.remove(from).is_some();
        if removed {
            tracing::debug!(from = %from, "Discarded unfinished transfer");
        }
        removed
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.incoming.clear();
    }

    /// Number of open descriptors
    pub fn in_flight(&self) -> usize {
        self.incoming.len()
    }
}
