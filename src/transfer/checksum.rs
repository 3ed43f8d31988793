//! Content checksums
//!
//! Wire form is `"<algorithm> <base64(raw digest)>"`; records keep the
//! lowercase hex digest.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{Result, TusError};

const READ_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha224,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl ChecksumAlgorithm {
    pub const ALL: [ChecksumAlgorithm; 4] = [Self::Sha224, Self::Sha256, Self::Sha384, Self::Sha512];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha224 => "sha224",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    /// Value for the `Tus-Checksum-Algorithm` header
    pub fn advertised() -> String {
        Self::ALL
            .iter()
            .map(ChecksumAlgorithm::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }

    fn hasher(&self) -> Hasher {
        match self {
            Self::Sha224 => Hasher::Sha224(Sha224::new()),
            Self::Sha256 => Hasher::Sha256(Sha256::new()),
            Self::Sha384 => Hasher::Sha384(Sha384::new()),
            Self::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = TusError;

    fn from_str(value: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|algorithm| algorithm.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| TusError::Protocol(format!("unsupported checksum algorithm: {value}")))
    }
}

enum Hasher {
    Sha224(Sha224),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Hasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha224(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
            Self::Sha384(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            Self::Sha224(h) => h.finalize().to_vec(),
            Self::Sha256(h) => h.finalize().to_vec(),
            Self::Sha384(h) => h.finalize().to_vec(),
            Self::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

// ============================================================================
// Checksum
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub digest: Vec<u8>,
}

impl Checksum {
    pub fn of(algorithm: ChecksumAlgorithm, data: &[u8]) -> Self {
        let mut hasher = algorithm.hasher();
        hasher.update(data);
        Self {
            algorithm,
            digest: hasher.finalize(),
        }
    }

    pub fn hex(&self) -> String {
        hex::encode(&self.digest)
    }

    /// `Upload-Checksum` header value
    pub fn header_value(&self) -> String {
        format!(
            "{} {}",
            self.algorithm,
            base64::engine::general_purpose::STANDARD.encode(&self.digest)
        )
    }

    /// Parse an `Upload-Checksum` header value
    pub fn parse_header(value: &str) -> Result<Self> {
        let (algorithm, encoded) = value
            .trim()
            .split_once(' ')
            .ok_or_else(|| TusError::Protocol("malformed Upload-Checksum header".to_string()))?;

        let algorithm: ChecksumAlgorithm = algorithm.parse()?;
        let digest = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| TusError::Protocol("Upload-Checksum digest is not valid base64".to_string()))?;

        Ok(Self { algorithm, digest })
    }
}

/// Hash a whole file
pub async fn checksum_file(path: &Path, algorithm: ChecksumAlgorithm) -> Result<Checksum> {
    checksum_range(path, algorithm, 0, None).await
}

/// Hash `length` bytes of a file starting at `start` (to EOF when `None`)
pub async fn checksum_range(
    path: &Path,
    algorithm: ChecksumAlgorithm,
    start: u64,
    length: Option<u64>,
) -> Result<Checksum> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| TusError::File(format!("cannot open file for hashing: {e}")))?;
    file.seek(std::io::SeekFrom::Start(start)).await?;

    let mut hasher = algorithm.hasher();
    let mut remaining = length.unwrap_or(u64::MAX);
    let mut buffer = vec![0u8; READ_BUFFER];

    while remaining > 0 {
        let want = remaining.min(buffer.len() as u64) as usize;
        let read = file.read(&mut buffer[..want]).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        remaining -= read as u64;
    }

    Ok(Checksum {
        algorithm,
        digest: hasher.finalize(),
    })
}
