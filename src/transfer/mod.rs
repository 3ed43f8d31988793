//! Byte movement: chunked resumable writes, merging partial uploads, and
//! content checksums.

pub mod checksum;
pub mod engine;
pub mod source;

pub use checksum::{checksum_file, checksum_range, Checksum, ChecksumAlgorithm};
pub use engine::{MergeOutcome, PartDescriptor, TransferEngine, DEFAULT_CHUNK_SIZE};
pub use source::{ByteSource, FileChunkStream, ReaderSource, SourceError, StreamSource};
