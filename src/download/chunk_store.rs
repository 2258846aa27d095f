//! Chunk table persistence and positioned writes into the final file.
//!
//! The progress file is a fixed-size big-endian table:
//!
//! ```text
//! header (32 bytes)
//!   magic        [u8; 4]  "RFPG"
//!   version      u16      1
//!   reserved     u16
//!   chunk_count  u32
//!   reserved     u32
//!   length       u64      content length the table was planned for
//!   reserved     u64
//! record (24 bytes) x chunk_count
//!   start        u64      first byte of the chunk
//!   end          u64      last byte of the chunk (inclusive)
//!   current      u64      next byte to write; end + 1 once complete
//! ```
//!
//! A chunk's `current` field is rewritten in place after every write to the
//! final file, and only after the data write has been handed to the OS, so a
//! crash can lose progress but never claim bytes that were not written.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument, warn};

use super::DownloadError;
use super::layout::TaskPaths;

const MAGIC: [u8; 4] = *b"RFPG";
const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = 32;
const RECORD_LEN: usize = 24;
const CURRENT_FIELD_OFFSET: usize = 16;

/// One contiguous byte range of the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkRange {
    /// Position in the chunk table.
    pub index: usize,
    /// First byte (inclusive).
    pub start: u64,
    /// Last byte (inclusive).
    pub end: u64,
    /// Next byte to write.
    pub current: u64,
}

impl ChunkRange {
    /// Bytes covered by the chunk.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Bytes already persisted.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.current - self.start
    }

    /// True while bytes remain to be fetched.
    #[must_use]
    pub fn is_legal(&self) -> bool {
        self.current <= self.end
    }

    /// True once every byte is written.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.current == self.end + 1
    }

    /// `Range` header value for the remaining bytes.
    #[must_use]
    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.current, self.end)
    }
}

/// Splits `content_length` bytes into `thread_count` contiguous chunks.
///
/// Chunks are equal-sized with the remainder going to the last one. When the
/// resource has fewer bytes than `thread_count`, one chunk per byte is used.
/// Returns an empty plan for a zero length.
#[must_use]
pub fn plan_chunks(content_length: u64, thread_count: usize) -> Vec<ChunkRange> {
    if content_length == 0 {
        return Vec::new();
    }
    let count = u64::try_from(thread_count.max(1))
        .unwrap_or(u64::MAX)
        .min(content_length);
    let size = content_length / count;

    (0..count)
        .map(|i| {
            let start = i * size;
            let end = if i == count - 1 {
                content_length - 1
            } else {
                start + size - 1
            };
            ChunkRange {
                index: usize::try_from(i).unwrap_or(usize::MAX),
                start,
                end,
                current: start,
            }
        })
        .collect()
}

/// Decoded progress file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ProgressTable {
    content_length: u64,
    chunks: Vec<ChunkRange>,
}

impl ProgressTable {
    fn encode(&self) -> Vec<u8> {
        let count = u32::try_from(self.chunks.len()).unwrap_or(u32::MAX);
        let mut buf = Vec::with_capacity(HEADER_LEN + self.chunks.len() * RECORD_LEN);
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&count.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&self.content_length.to_be_bytes());
        buf.extend_from_slice(&0u64.to_be_bytes());
        for chunk in &self.chunks {
            buf.extend_from_slice(&chunk.start.to_be_bytes());
            buf.extend_from_slice(&chunk.end.to_be_bytes());
            buf.extend_from_slice(&chunk.current.to_be_bytes());
        }
        buf
    }

    fn decode(bytes: &[u8], path: &Path) -> Result<Self, DownloadError> {
        let corrupt = |reason: &str| DownloadError::corrupted(path, reason);

        if bytes.len() < HEADER_LEN {
            return Err(corrupt("truncated header"));
        }
        if bytes[0..4] != MAGIC {
            return Err(corrupt("bad magic"));
        }
        if read_u16(bytes, 4) != FORMAT_VERSION {
            return Err(corrupt("unsupported format version"));
        }
        let count = read_u32(bytes, 8) as usize;
        let content_length = read_u64(bytes, 16);
        if count == 0 {
            return Err(corrupt("empty chunk table"));
        }
        let expected_len = count
            .checked_mul(RECORD_LEN)
            .and_then(|records| records.checked_add(HEADER_LEN));
        if expected_len != Some(bytes.len()) {
            return Err(corrupt("record count does not match file size"));
        }

        let mut chunks = Vec::with_capacity(count);
        let mut expected_start = 0u64;
        for index in 0..count {
            let base = HEADER_LEN + index * RECORD_LEN;
            let chunk = ChunkRange {
                index,
                start: read_u64(bytes, base),
                end: read_u64(bytes, base + 8),
                current: read_u64(bytes, base + CURRENT_FIELD_OFFSET),
            };
            if chunk.start != expected_start || chunk.end < chunk.start {
                return Err(corrupt("chunk boundaries are not contiguous"));
            }
            if chunk.end >= content_length {
                return Err(corrupt("chunk ends past the content length"));
            }
            let next_start = chunk
                .end
                .checked_add(1)
                .ok_or_else(|| corrupt("chunk end overflows"))?;
            if chunk.current < chunk.start || chunk.current > next_start {
                return Err(corrupt("chunk offset outside its range"));
            }
            expected_start = next_start;
            chunks.push(chunk);
        }
        if expected_start != content_length {
            return Err(corrupt("chunks do not cover the content length"));
        }

        Ok(Self {
            content_length,
            chunks,
        })
    }
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_be_bytes(buf)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_be_bytes(buf)
}

fn current_field_position(index: usize) -> u64 {
    u64::try_from(HEADER_LEN + index * RECORD_LEN + CURRENT_FIELD_OFFSET).unwrap_or(u64::MAX)
}

/// Owner of one task's final, progress and marker files.
///
/// Writes to a chunk are serialized through a per-chunk lock held by the
/// [`ChunkWriter`]; different chunks never contend.
#[derive(Debug)]
pub struct ChunkStore {
    paths: TaskPaths,
    locks: DashMap<usize, Arc<Mutex<()>>>,
}

impl ChunkStore {
    /// Creates a store over `paths`. Touches nothing on disk.
    #[must_use]
    pub fn new(paths: TaskPaths) -> Self {
        Self {
            paths,
            locks: DashMap::new(),
        }
    }

    /// Returns the task's file paths.
    #[must_use]
    pub fn paths(&self) -> &TaskPaths {
        &self.paths
    }

    /// Lays out a fresh ranged download, or returns the stored table when resuming.
    ///
    /// A fresh layout truncates the final file and re-extends it to
    /// `content_length`, so no byte of an earlier attempt survives; writes a
    /// new chunk table with every offset at its chunk start; and records
    /// `freshness_token` (empty when absent) in the marker file.
    ///
    /// # Errors
    ///
    /// `DownloadError::Io` on file system failure, or
    /// `DownloadError::CorruptedState` when resuming from an unreadable table.
    #[instrument(skip(self), fields(path = %self.paths.final_path.display()))]
    pub async fn prepare_layout(
        &self,
        content_length: u64,
        freshness_token: Option<&str>,
        thread_count: usize,
        resume: bool,
    ) -> Result<Vec<ChunkRange>, DownloadError> {
        if resume {
            return self.read_chunks().await;
        }

        self.paths.ensure_dirs().await?;

        let final_path = &self.paths.final_path;
        let file = File::create(final_path)
            .await
            .map_err(|e| DownloadError::io(final_path, e))?;
        file.set_len(content_length)
            .await
            .map_err(|e| DownloadError::io(final_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| DownloadError::io(final_path, e))?;

        let chunks = plan_chunks(content_length, thread_count);
        let table = ProgressTable {
            content_length,
            chunks: chunks.clone(),
        };
        write_synced(&self.paths.progress_path, &table.encode()).await?;
        self.write_marker(freshness_token).await?;

        debug!(chunks = chunks.len(), content_length, "laid out fresh download");
        Ok(chunks)
    }

    /// Lays out a single-stream download of unknown length.
    ///
    /// Truncates the final file, removes any chunk table and records the
    /// freshness token.
    ///
    /// # Errors
    ///
    /// `DownloadError::Io` on file system failure.
    #[instrument(skip(self), fields(path = %self.paths.final_path.display()))]
    pub async fn prepare_unbounded(
        &self,
        freshness_token: Option<&str>,
    ) -> Result<(), DownloadError> {
        self.paths.ensure_dirs().await?;
        let final_path = &self.paths.final_path;
        File::create(final_path)
            .await
            .map_err(|e| DownloadError::io(final_path, e))?;
        remove_if_exists(&self.paths.progress_path).await?;
        self.write_marker(freshness_token).await
    }

    /// Reads and validates the whole chunk table.
    ///
    /// # Errors
    ///
    /// `DownloadError::CorruptedState` when the table is missing, truncated
    /// or inconsistent.
    pub async fn read_chunks(&self) -> Result<Vec<ChunkRange>, DownloadError> {
        Ok(self.read_table().await?.chunks)
    }

    /// Reads one chunk from the table.
    ///
    /// # Errors
    ///
    /// `DownloadError::CorruptedState` when the table is unreadable or has no
    /// chunk `index`.
    pub async fn read_chunk(&self, index: usize) -> Result<ChunkRange, DownloadError> {
        self.read_chunks()
            .await?
            .get(index)
            .copied()
            .ok_or_else(|| {
                DownloadError::corrupted(&self.paths.progress_path, format!("no chunk {index}"))
            })
    }

    /// Number of chunks in the stored table.
    ///
    /// # Errors
    ///
    /// `DownloadError::CorruptedState` when the table is unreadable.
    pub async fn chunk_count(&self) -> Result<usize, DownloadError> {
        Ok(self.read_chunks().await?.len())
    }

    /// True unless the final file and the chunk table both match `content_length`.
    pub async fn is_damaged(&self, content_length: u64) -> bool {
        let final_len = match tokio::fs::metadata(&self.paths.final_path).await {
            Ok(meta) => meta.len(),
            Err(_) => return true,
        };
        if final_len != content_length {
            debug!(final_len, content_length, "final file length mismatch");
            return true;
        }
        match self.read_table().await {
            Ok(table) => table.content_length != content_length,
            Err(e) => {
                debug!(error = %e, "chunk table unusable");
                true
            }
        }
    }

    /// True while any chunk has bytes left to fetch.
    ///
    /// # Errors
    ///
    /// `DownloadError::CorruptedState` when the table is unreadable.
    pub async fn is_incomplete(&self) -> Result<bool, DownloadError> {
        Ok(self.read_chunks().await?.iter().any(ChunkRange::is_legal))
    }

    /// Sum of persisted bytes across chunks; zero without a readable table.
    pub async fn downloaded_bytes(&self) -> u64 {
        self.read_chunks()
            .await
            .map(|chunks| chunks.iter().map(ChunkRange::written).sum())
            .unwrap_or(0)
    }

    /// Reads the token recorded by the attempt that produced the current files.
    ///
    /// `None` means no attempt has laid out files yet; `Some("")` means the
    /// server offered no token.
    ///
    /// # Errors
    ///
    /// `DownloadError::Io` when the marker exists but cannot be read.
    pub async fn read_stored_freshness_token(&self) -> Result<Option<String>, DownloadError> {
        match tokio::fs::read_to_string(&self.paths.marker_path).await {
            Ok(token) => Ok(Some(token)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DownloadError::io(&self.paths.marker_path, e)),
        }
    }

    /// Opens a writer for chunk `index`, waiting for any other writer of it.
    ///
    /// # Errors
    ///
    /// `DownloadError::CorruptedState` if the chunk is not in the table,
    /// `DownloadError::Io` if the files cannot be opened.
    pub async fn open_writer(&self, index: usize) -> Result<ChunkWriter, DownloadError> {
        let guard = self.lock(index).await;
        let chunk = self.read_chunk(index).await?;
        let file = open_for_write(&self.paths.final_path).await?;
        let progress = open_for_write(&self.paths.progress_path).await?;

        Ok(ChunkWriter {
            index,
            start: chunk.start,
            end: Some(chunk.end),
            offset: chunk.current,
            file,
            final_path: self.paths.final_path.clone(),
            progress: Some(ProgressSlot {
                file: progress,
                path: self.paths.progress_path.clone(),
                position: current_field_position(index),
            }),
            _guard: guard,
        })
    }

    /// Opens an appending writer for a download of unknown length.
    ///
    /// Must follow [`ChunkStore::prepare_unbounded`]; progress is not persisted.
    ///
    /// # Errors
    ///
    /// `DownloadError::Io` if the final file cannot be opened.
    pub async fn open_unbounded_writer(&self) -> Result<ChunkWriter, DownloadError> {
        let guard = self.lock(0).await;
        let file = open_for_write(&self.paths.final_path).await?;
        Ok(ChunkWriter {
            index: 0,
            start: 0,
            end: None,
            offset: 0,
            file,
            final_path: self.paths.final_path.clone(),
            progress: None,
            _guard: guard,
        })
    }

    /// Writes `bytes` at chunk `index`'s offset and returns the new offset.
    ///
    /// Convenience over [`ChunkStore::open_writer`] for one-off writes.
    ///
    /// # Errors
    ///
    /// Same as [`ChunkStore::open_writer`] and [`ChunkWriter::write`].
    pub async fn write_at(&self, index: usize, bytes: &[u8]) -> Result<u64, DownloadError> {
        let mut writer = self.open_writer(index).await?;
        writer.write(bytes).await
    }

    /// Deletes the final, progress and marker files. Missing files are ignored.
    ///
    /// # Errors
    ///
    /// `DownloadError::Io` when an existing file cannot be removed.
    #[instrument(skip(self), fields(path = %self.paths.final_path.display()))]
    pub async fn remove_files(&self) -> Result<(), DownloadError> {
        for path in self.paths.all() {
            remove_if_exists(path).await?;
        }
        Ok(())
    }

    async fn lock(&self, index: usize) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(index)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    async fn read_table(&self) -> Result<ProgressTable, DownloadError> {
        let path = &self.paths.progress_path;
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DownloadError::corrupted(path, "progress file missing"));
            }
            Err(e) => return Err(DownloadError::corrupted(path, e.to_string())),
        };
        ProgressTable::decode(&bytes, path)
    }

    async fn write_marker(&self, token: Option<&str>) -> Result<(), DownloadError> {
        write_synced(&self.paths.marker_path, token.unwrap_or_default().as_bytes()).await
    }
}

#[derive(Debug)]
struct ProgressSlot {
    file: File,
    path: PathBuf,
    position: u64,
}

/// Exclusive writer for one chunk.
///
/// Holds the chunk's lock until dropped. Bytes past the chunk end are
/// discarded.
#[derive(Debug)]
pub struct ChunkWriter {
    index: usize,
    start: u64,
    end: Option<u64>,
    offset: u64,
    file: File,
    final_path: PathBuf,
    progress: Option<ProgressSlot>,
    _guard: OwnedMutexGuard<()>,
}

impl ChunkWriter {
    /// Chunk index.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Next byte this writer will write.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Last byte of the chunk, `None` for unbounded writers.
    #[must_use]
    pub fn end(&self) -> Option<u64> {
        self.end
    }

    /// Bytes written into this chunk so far.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.offset - self.start
    }

    /// True once a bounded chunk is full.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.end.is_some_and(|end| self.offset > end)
    }

    /// `Range` header for the remaining bytes of a bounded chunk.
    #[must_use]
    pub fn range_header(&self) -> Option<String> {
        self.end.map(|end| format!("bytes={}-{end}", self.offset))
    }

    /// Writes `bytes` at the current offset, then persists the new offset.
    ///
    /// Returns the new offset. Bytes beyond the chunk end are dropped.
    ///
    /// # Errors
    ///
    /// `DownloadError::Io` when either file write fails.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<u64, DownloadError> {
        let accepted = match self.end {
            Some(end) => {
                let room = (end + 1).saturating_sub(self.offset);
                usize::try_from(room).map_or(bytes.len(), |room| room.min(bytes.len()))
            }
            None => bytes.len(),
        };
        if accepted < bytes.len() {
            warn!(
                chunk = self.index,
                discarded = bytes.len() - accepted,
                "server sent bytes past chunk end"
            );
        }
        if accepted == 0 {
            return Ok(self.offset);
        }

        let data = &bytes[..accepted];
        self.file
            .seek(SeekFrom::Start(self.offset))
            .await
            .map_err(|e| DownloadError::io(&self.final_path, e))?;
        self.file
            .write_all(data)
            .await
            .map_err(|e| DownloadError::io(&self.final_path, e))?;
        // Wait for the data write to finish before recording the offset.
        self.file
            .flush()
            .await
            .map_err(|e| DownloadError::io(&self.final_path, e))?;

        self.offset += accepted as u64;
        self.persist_offset().await?;
        Ok(self.offset)
    }

    /// Moves the offset back to the chunk start and persists it.
    ///
    /// Used when a non-ranged response restarts the body from byte zero.
    ///
    /// # Errors
    ///
    /// `DownloadError::Io` when the progress file write fails.
    pub async fn rewind(&mut self) -> Result<(), DownloadError> {
        self.offset = self.start;
        if self.end.is_none() {
            self.file
                .set_len(0)
                .await
                .map_err(|e| DownloadError::io(&self.final_path, e))?;
        }
        self.persist_offset().await
    }

    async fn persist_offset(&mut self) -> Result<(), DownloadError> {
        let Some(slot) = self.progress.as_mut() else {
            return Ok(());
        };
        slot.file
            .seek(SeekFrom::Start(slot.position))
            .await
            .map_err(|e| DownloadError::io(&slot.path, e))?;
        slot.file
            .write_all(&self.offset.to_be_bytes())
            .await
            .map_err(|e| DownloadError::io(&slot.path, e))?;
        slot.file
            .flush()
            .await
            .map_err(|e| DownloadError::io(&slot.path, e))
    }
}

async fn open_for_write(path: &Path) -> Result<File, DownloadError> {
    OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|e| DownloadError::io(path, e))
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), DownloadError> {
    let mut file = File::create(path)
        .await
        .map_err(|e| DownloadError::io(path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| DownloadError::io(path, e))?;
    file.sync_all().await.map_err(|e| DownloadError::io(path, e))
}

async fn remove_if_exists(path: &Path) -> Result<(), DownloadError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DownloadError::io(path, e)),
    }
}
