//! Wire contract shared by the server and the client: header names,
//! advertised capabilities, and the codecs for `Upload-Metadata` and
//! `Upload-Concat`.

use std::collections::BTreeMap;

use base64::Engine;

use crate::error::{Result, TusError};

/// Protocol version spoken and advertised
pub const TUS_VERSION: &str = "1.0.0";

pub const TUS_EXTENSIONS: &str = "creation,termination,checksum,expiration,concatenation";

/// Required `Content-Type` of PATCH bodies
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

pub const ALLOWED_METHODS: &str = "OPTIONS,HEAD,POST,PATCH,GET,DELETE";

/// Non-standard: the assembled content does not match the declared checksum
pub const STATUS_CHECKSUM_MISMATCH: u16 = 460;

/// Reused as "client went away mid-PATCH; retry from the last offset"
pub const STATUS_CONNECTION_INTERRUPTED: u16 = 100;

// ============================================================================
// Header names
// ============================================================================

pub const TUS_RESUMABLE: &str = "tus-resumable";
pub const TUS_VERSION_HEADER: &str = "tus-version";
pub const TUS_EXTENSION: &str = "tus-extension";
pub const TUS_CHECKSUM_ALGORITHM: &str = "tus-checksum-algorithm";
pub const TUS_MAX_SIZE: &str = "tus-max-size";
pub const UPLOAD_LENGTH: &str = "upload-length";
pub const UPLOAD_OFFSET: &str = "upload-offset";
pub const UPLOAD_CHECKSUM: &str = "upload-checksum";
pub const UPLOAD_METADATA: &str = "upload-metadata";
pub const UPLOAD_CONCAT: &str = "upload-concat";
pub const UPLOAD_KEY: &str = "upload-key";
pub const UPLOAD_EXPIRES: &str = "upload-expires";

/// Every tus header a browser client needs to read back
pub const EXPOSED_HEADERS: [&str; 10] = [
    TUS_RESUMABLE,
    TUS_VERSION_HEADER,
    TUS_EXTENSION,
    TUS_CHECKSUM_ALGORITHM,
    TUS_MAX_SIZE,
    UPLOAD_LENGTH,
    UPLOAD_OFFSET,
    UPLOAD_METADATA,
    UPLOAD_CONCAT,
    UPLOAD_EXPIRES,
];

// ============================================================================
// Upload-Metadata
// ============================================================================

/// Decode `key base64(value)` pairs. A key without a value maps to "".
pub fn parse_metadata(header: &str) -> Result<BTreeMap<String, String>> {
    let mut metadata = BTreeMap::new();

    for pair in header.split(',').map(str::trim).filter(|pair| !pair.is_empty()) {
        let (key, encoded) = match pair.split_once(' ') {
            Some((key, encoded)) => (key, encoded.trim()),
            None => (pair, ""),
        };

        let value = if encoded.is_empty() {
            String::new()
        } else {
            let raw = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|_| TusError::Protocol(format!("metadata value for '{key}' is not valid base64")))?;
            String::from_utf8(raw)
                .map_err(|_| TusError::Protocol(format!("metadata value for '{key}' is not valid UTF-8")))?
        };

        metadata.insert(key.to_string(), value);
    }

    Ok(metadata)
}

pub fn encode_metadata<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .map(|(key, value)| {
            if value.is_empty() {
                key.to_string()
            } else {
                format!("{key} {}", base64::engine::general_purpose::STANDARD.encode(value))
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

// ============================================================================
// Upload-Concat
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadConcat {
    Partial,
    /// Upload keys of the partial uploads, in assembly order
    Final(Vec<String>),
}

impl UploadConcat {
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value == "partial" {
            return Ok(Self::Partial);
        }

        let references = value
            .strip_prefix("final;")
            .ok_or_else(|| TusError::Protocol(format!("invalid Upload-Concat header: {value}")))?;

        let keys: Vec<String> = references
            .split_whitespace()
            .map(|reference| key_from_reference(reference).to_string())
            .collect();

        if keys.is_empty() || keys.iter().any(|key| !is_valid_key(key)) {
            return Err(TusError::Protocol("Upload-Concat final lists no valid partial uploads".to_string()));
        }

        Ok(Self::Final(keys))
    }

    pub fn header_value(&self) -> String {
        match self {
            Self::Partial => "partial".to_string(),
            Self::Final(keys) => format!("final;{}", keys.join(" ")),
        }
    }
}

/// Partial uploads may be referenced by key or by their full URL
pub fn key_from_reference(reference: &str) -> &str {
    reference
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(reference)
}

// ============================================================================
// Sanitizing
// ============================================================================

/// Upload keys become directory names; reject anything that could escape
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && !key.contains("..")
        && !key.chars().any(|c| c == '/' || c == '\\' || c.is_control())
        && key != "."
}

/// Declared file name, or `None` when it is unusable as a file name
pub fn sanitize_name(name: &str) -> Option<String> {
    let name = name.trim();
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.chars().any(|c| matches!(c, '/' | '\\' | '"') || c.is_control());

    (!invalid).then(|| name.to_string())
}
