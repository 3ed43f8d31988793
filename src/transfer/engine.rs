//! Transfer Engine
//!
//! Streams bytes from a `ByteSource` into the destination file in fixed-size
//! chunks and checkpoints the running offset into the metadata store after
//! every chunk, so the last durable chunk boundary is always recoverable.
//! Also assembles partial uploads into one file.

use std::collections::BTreeSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use serde_json::json;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use super::source::{ByteSource, SourceError};
use crate::error::{Result, TusError};
use crate::events::{EventBus, UploadEvent};
use crate::store::{fields, SharedStore};

/// Default chunk size: 8 KiB
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// One partial upload taking part in a merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartDescriptor {
    pub file_path: PathBuf,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Sum of the parts' recorded offsets
    pub offset: u64,
    /// Bytes actually assembled on disk
    pub size: u64,
}

#[derive(Clone)]
pub struct TransferEngine {
    store: SharedStore,
    chunk_size: usize,
    events: Option<EventBus>,
}

impl TransferEngine {
    pub fn new(store: SharedStore, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
            events: None,
        }
    }

    /// Publish a progress event after every checkpoint
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Create an empty destination for a new upload, truncating any leftover
    pub async fn allocate(&self, destination: &Path) -> Result<()> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TusError::File(format!("cannot create upload directory: {e}")))?;
        }

        tokio::fs::File::create(destination)
            .await
            .map_err(|e| TusError::File(format!("cannot create destination: {e}")))?;

        Ok(())
    }

    // ========================================================================
    // Upload
    // ========================================================================

    /// Append `source` to `destination`, resuming at `offset`.
    ///
    /// Returns the total number of bytes now durable in the file. The
    /// destination is first cut back to `offset`, discarding anything a
    /// crashed writer appended after its last checkpoint.
    pub async fn upload<S>(
        &self,
        key: &str,
        destination: &Path,
        total_bytes: u64,
        offset: u64,
        source: &mut S,
    ) -> Result<u64>
    where
        S: ByteSource + ?Sized,
    {
        if offset == total_bytes {
            return Ok(offset);
        }
        if offset > total_bytes {
            return Err(TusError::OutOfRange {
                written: offset,
                size: total_bytes,
            });
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TusError::File(format!("cannot create upload directory: {e}")))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(destination)
            .await
            .map_err(|e| TusError::File(format!("cannot open destination: {e}")))?;

        let on_disk = file.metadata().await?.len();
        if on_disk < offset {
            return Err(TusError::File(format!(
                "destination holds {on_disk} bytes but {offset} were checkpointed"
            )));
        }
        if on_disk > offset {
            file.set_len(offset).await?;
        }
        file.seek(SeekFrom::Start(offset)).await?;

        let mut written = offset;
        let mut buffer = vec![0u8; self.chunk_size];

        loop {
            if !source.is_connected() {
                return Err(TusError::Connection("client disconnected".to_string()));
            }

            let read = match source.read_chunk(&mut buffer).await {
                Ok(0) => break,
                Ok(read) => read,
                Err(SourceError::Disconnected(reason)) => return Err(TusError::Connection(reason)),
                Err(SourceError::Io(e)) => return Err(TusError::File(format!("cannot read input: {e}"))),
            };

            if written + read as u64 > total_bytes {
                return Err(TusError::OutOfRange {
                    written: written + read as u64,
                    size: total_bytes,
                });
            }

            file.write_all(&buffer[..read]).await?;
            file.flush().await?;
            written += read as u64;

            self.store.set(key, fields(json!({ "offset": written }))).await?;

            tracing::debug!(key = %key, offset = written, size = total_bytes, "Checkpointed chunk");

            if let Some(events) = &self.events {
                events.publish(UploadEvent::Progress {
                    key: key.to_string(),
                    offset: written,
                    size: total_bytes,
                });
            }
        }

        Ok(written)
    }

    // ========================================================================
    // Merge
    // ========================================================================

    /// Concatenate `parts`, in order, into `destination`
    pub async fn merge(&self, destination: &Path, parts: &[PartDescriptor]) -> Result<MergeOutcome> {
        let Some((first, rest)) = parts.split_first() else {
            return Err(TusError::File("no partial uploads to merge".to_string()));
        };

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // First part is copied as-is; the rest are appended
        let mut size = tokio::fs::copy(&first.file_path, destination)
            .await
            .map_err(|_| TusError::File("file to be merged not found".to_string()))?;
        let mut offset = first.offset;

        let mut output = OpenOptions::new().append(true).open(destination).await?;

        for part in rest {
            let mut input = tokio::fs::File::open(&part.file_path)
                .await
                .map_err(|_| TusError::File("file to be merged not found".to_string()))?;

            size += tokio::io::copy(&mut input, &mut output).await?;
            offset += part.offset;
        }

        output.flush().await?;
        output.sync_all().await?;

        tracing::debug!(parts = parts.len(), size = size, "Merged partial uploads");

        Ok(MergeOutcome { offset, size })
    }

    // ========================================================================
    // Delete
    // ========================================================================

    /// Best-effort removal of `paths`.
    ///
    /// Returns true when at least one file was removed and none failed. In
    /// that case, and when asked, the parent directories are removed too if
    /// they are now empty.
    pub async fn delete(&self, paths: &[PathBuf], remove_parent: bool) -> bool {
        let mut removed = false;
        let mut failed = false;

        for path in paths {
            match tokio::fs::remove_file(path).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to remove upload file");
                    failed = true;
                }
            }
        }

        let deleted = removed && !failed;

        if deleted && remove_parent {
            let parents: BTreeSet<&Path> = paths.iter().filter_map(|path| path.parent()).collect();
            for parent in parents {
                // Only succeeds when empty
                let _ = tokio::fs::remove_dir(parent).await;
            }
        }

        deleted
    }
}
