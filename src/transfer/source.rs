//! Byte sources feeding the transfer engine, and a chunked file stream
//! used for downloads and client-side PATCH bodies.

use std::fmt::Display;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use axum::body::Bytes;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, ReadBuf};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The sending side went away; nothing already written is lost
    #[error("connection interrupted: {0}")]
    Disconnected(String),

    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

/// Input side of an upload
#[async_trait]
pub trait ByteSource: Send {
    /// Checked before every read
    fn is_connected(&self) -> bool;

    /// Fill `buf` as far as possible; `Ok(0)` means the input is exhausted.
    /// Anything short of a full buffer is only returned at end of input.
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, SourceError>;
}

// ============================================================================
// Stream source (request bodies)
// ============================================================================

/// Adapts a stream of byte blocks, such as an HTTP request body.
///
/// Any error from the stream is treated as the peer disconnecting.
pub struct StreamSource<S> {
    stream: S,
    pending: Bytes,
    connected: bool,
    finished: bool,
}

impl<S, E> StreamSource<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin + Send,
    E: Display + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            pending: Bytes::new(),
            connected: true,
            finished: false,
        }
    }
}

#[async_trait]
impl<S, E> ByteSource for StreamSource<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin + Send,
    E: Display + Send,
{
    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, SourceError> {
        let mut filled = 0;

        while filled < buf.len() {
            if self.pending.is_empty() {
                if self.finished {
                    break;
                }
                match self.stream.next().await {
                    Some(Ok(block)) => self.pending = block,
                    Some(Err(e)) => {
                        self.connected = false;
                        return Err(SourceError::Disconnected(e.to_string()));
                    }
                    None => {
                        self.finished = true;
                        break;
                    }
                }
                continue;
            }

            let take = self.pending.len().min(buf.len() - filled);
            buf[filled..filled + take].copy_from_slice(&self.pending.split_to(take));
            filled += take;
        }

        Ok(filled)
    }
}

// ============================================================================
// Reader source (local files, tests)
// ============================================================================

pub struct ReaderSource<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin + Send> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ByteSource for ReaderSource<R> {
    fn is_connected(&self) -> bool {
        true
    }

    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, SourceError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]).await {
                Ok(0) => break,
                Ok(read) => filled += read,
                Err(e) if is_disconnect(&e) => return Err(SourceError::Disconnected(e.to_string())),
                Err(e) => return Err(SourceError::Io(e)),
            }
        }
        Ok(filled)
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

// ============================================================================
// File chunk stream
// ============================================================================

/// Streams a byte range of a file in fixed-size blocks
pub struct FileChunkStream {
    reader: tokio::io::Take<tokio::fs::File>,
    buffer: Vec<u8>,
}

impl FileChunkStream {
    /// Stream `length` bytes starting at `start` (to EOF when `None`)
    pub async fn open(path: &Path, start: u64, length: Option<u64>, chunk_size: usize) -> io::Result<Self> {
        let mut file = tokio::fs::File::open(path).await?;
        file.seek(io::SeekFrom::Start(start)).await?;

        Ok(Self {
            reader: file.take(length.unwrap_or(u64::MAX)),
            buffer: vec![0u8; chunk_size.max(1)],
        })
    }
}

impl Stream for FileChunkStream {
    type Item = io::Result<Vec<u8>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let mut read_buf = ReadBuf::new(&mut this.buffer);

        match Pin::new(&mut this.reader).poll_read(cx, &mut read_buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Some(Err(e))),
            Poll::Ready(Ok(())) if read_buf.filled().is_empty() => Poll::Ready(None),
            Poll::Ready(Ok(())) => Poll::Ready(Some(Ok(read_buf.filled().to_vec()))),
        }
    }
}
