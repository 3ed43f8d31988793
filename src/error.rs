//! Error types shared by the transfer engine, server and client

use thiserror::Error;

use crate::store::StoreError;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, TusError>;

#[derive(Error, Debug)]
pub enum TusError {
    /// Missing, unreadable or unwritable source/destination, or bad merge input
    #[error("File error: {0}")]
    File(String),

    /// Transport unreachable, or the peer went away mid-transfer.
    /// Already checkpointed state stays valid; retry later.
    #[error("Connection error: {0}")]
    Connection(String),

    /// More bytes arrived than the upload declared
    #[error("Upload exceeds declared length: {written} bytes written, {size} declared")]
    OutOfRange { written: u64, size: u64 },

    /// Malformed headers/metadata or an unsupported checksum algorithm
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Upload expired: {0}")]
    Expired(String),

    #[error("Upload not found: {0}")]
    NotFound(String),

    /// Unexpected response from a tus server
    #[error("Server responded with {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl From<std::io::Error> for TusError {
    fn from(err: std::io::Error) -> Self {
        TusError::File(err.to_string())
    }
}

impl TusError {
    /// Connection trouble is the expected way resumption gets exercised
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}
