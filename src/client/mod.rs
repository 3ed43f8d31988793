//! tus Client
//!
//! Drives the upload lifecycle from the sending side:
//! 1. HEAD the upload to learn how far the server got
//! 2. POST to create it when the server has never heard of it
//! 3. PATCH the remaining bytes from that offset
//!
//! Created uploads are remembered in a local cache (`{location,
//! expires_at}` per key) so a later process can resume them. Splitting a
//! file into partial uploads is done with `seek`, and the pieces are
//! assembled server-side with `concat`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::Response;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{Result, TusError};
use crate::protocol::{
    encode_metadata, UploadConcat, OFFSET_OCTET_STREAM, STATUS_CHECKSUM_MISMATCH, STATUS_CONNECTION_INTERRUPTED,
    TUS_RESUMABLE, TUS_VERSION, UPLOAD_CHECKSUM, UPLOAD_CONCAT, UPLOAD_EXPIRES, UPLOAD_KEY, UPLOAD_LENGTH,
    UPLOAD_METADATA, UPLOAD_OFFSET,
};
use crate::store::{parse_http_date, ttl_duration, ClientEntry, SharedStore};
use crate::transfer::{checksum_range, ChecksumAlgorithm, FileChunkStream};

/// Local file being uploaded
#[derive(Debug, Clone)]
struct SourceFile {
    path: PathBuf,
    name: String,
    size: u64,
}

/// Result of asking the server for an upload's offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OffsetQuery {
    Found(u64),
    Missing,
}

pub struct TusClient {
    http: reqwest::Client,
    endpoint: String,
    api_path: String,
    cache: SharedStore,
    algorithm: ChecksumAlgorithm,
    chunk_size: usize,
    source: Option<SourceFile>,
    key: Option<String>,
    /// Set by `seek`; start of this partial segment in the source file
    partial_offset: Option<u64>,
    metadata: BTreeMap<String, String>,
}

impl TusClient {
    /// `cache` should be namespaced with `store::CLIENT_PREFIX` when it
    /// shares a backend with a server
    pub fn new(config: ClientConfig, cache: SharedStore) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_path: config.api_path.trim_end_matches('/').to_string(),
            cache,
            algorithm: config.checksum_algorithm,
            chunk_size: config.chunk_size.max(1),
            source: None,
            key: None,
            partial_offset: None,
            metadata: BTreeMap::new(),
        }
    }

    // ========================================================================
    // Builder-style setup
    // ========================================================================

    /// Select the file to upload; its name becomes the `filename` metadata
    pub async fn file(&mut self, path: impl AsRef<Path>) -> Result<&mut Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| TusError::File(format!("cannot read {}: {e}", path.display())))?;

        if !metadata.is_file() {
            return Err(TusError::File(format!("{} is not a file", path.display())));
        }

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| TusError::File(format!("{} has no file name", path.display())))?;

        self.source = Some(SourceFile {
            path: path.to_path_buf(),
            name,
            size: metadata.len(),
        });
        Ok(self)
    }

    /// Override the `filename` sent to the server
    pub fn set_file_name(&mut self, name: impl Into<String>) -> &mut Self {
        if let Some(source) = &mut self.source {
            source.name = name.into();
        }
        self
    }

    pub fn set_key(&mut self, key: impl Into<String>) -> &mut Self {
        self.key = Some(key.into());
        self
    }

    pub fn key(&self) -> Result<&str> {
        self.key
            .as_deref()
            .ok_or_else(|| TusError::Protocol("upload key is not set".to_string()))
    }

    /// Upload a partial segment starting at `offset` of the file.
    ///
    /// Derives a fresh key `<base>_<uuid>` from the current key so every
    /// segment gets its own server-side identity; collect these keys, in
    /// order, for `concat`.
    pub fn seek(&mut self, offset: u64) -> &mut Self {
        self.partial_offset = Some(offset);
        if let Some(key) = &self.key {
            self.key = Some(partial_key(key));
        }
        self
    }

    pub fn is_partial(&self) -> bool {
        self.partial_offset.is_some()
    }

    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    fn source(&self) -> Result<&SourceFile> {
        self.source
            .as_ref()
            .ok_or_else(|| TusError::File("no file selected for upload".to_string()))
    }

    /// URL of the upload resource for the current key
    pub async fn upload_url(&self) -> Result<String> {
        self.upload_url_for(self.key()?).await
    }

    fn collection_url(&self) -> String {
        format!("{}{}", self.endpoint, self.api_path)
    }

    /// Bytes this upload covers: the whole file, or one segment of it
    fn declared_length(&self, bytes: Option<u64>) -> Result<u64> {
        let source = self.source()?;
        let start = self.partial_offset.unwrap_or(0).min(source.size);
        let available = source.size - start;

        Ok(match (self.partial_offset, bytes) {
            (Some(_), Some(bytes)) => bytes.min(available),
            _ => available,
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Upload from wherever the server left off.
    ///
    /// `bytes` limits how much is sent in this call; for a partial upload
    /// it is the segment length. Returns the server's new offset.
    pub async fn upload(&mut self, bytes: Option<u64>) -> Result<u64> {
        let key = self.key()?.to_string();
        let length = self.declared_length(bytes)?;

        let offset = match self.query_offset(&key).await? {
            OffsetQuery::Found(offset) => offset,
            OffsetQuery::Missing => {
                self.create_with_length(&key, length).await?;
                0
            }
        };

        if self.is_expired(&key).await? {
            return Err(TusError::Expired(key));
        }

        let remaining = length.saturating_sub(offset);
        let count = match (self.partial_offset, bytes) {
            (None, Some(bytes)) => bytes.min(remaining),
            _ => remaining,
        };

        if count == 0 {
            return Ok(offset);
        }

        self.send_patch(&key, offset, count, length).await
    }

    /// Current server-side offset, `None` when the upload does not exist
    pub async fn get_offset(&self) -> Result<Option<u64>> {
        let key = self.key()?;
        Ok(match self.query_offset(key).await? {
            OffsetQuery::Found(offset) => Some(offset),
            OffsetQuery::Missing => None,
        })
    }

    async fn query_offset(&self, key: &str) -> Result<OffsetQuery> {
        let response = self
            .http
            .head(self.upload_url_for(key).await?)
            .header(TUS_RESUMABLE, TUS_VERSION)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status().as_u16() {
            200 => header_u64(&response, UPLOAD_OFFSET)
                .map(OffsetQuery::Found)
                .ok_or_else(|| TusError::Protocol("HEAD response without Upload-Offset".to_string())),
            404 | 410 => Ok(OffsetQuery::Missing),
            _ => Err(upstream_error(response).await),
        }
    }

    /// Cached location when known, else the conventional `{api_path}/{key}`
    async fn upload_url_for(&self, key: &str) -> Result<String> {
        if let Some(fields) = self.cache.get(key, true).await? {
            if let Ok(entry) = ClientEntry::from_fields(fields) {
                return Ok(entry.location);
            }
        }
        Ok(format!("{}/{key}", self.collection_url()))
    }

    /// A missing cache entry counts as expired
    async fn is_expired(&self, key: &str) -> Result<bool> {
        let Some(fields) = self.cache.get(key, true).await? else {
            return Ok(true);
        };

        Ok(ClientEntry::from_fields(fields).map_or(true, |entry| entry.expires_at < Utc::now()))
    }

    /// Create the upload resource for `key`, returning its location
    pub async fn create(&mut self, key: &str) -> Result<String> {
        let length = self.declared_length(None)?;
        self.create_with_length(key, length).await
    }

    async fn create_with_length(&self, key: &str, length: u64) -> Result<String> {
        let source = self.source()?;
        let start = self.partial_offset.unwrap_or(0);
        let checksum = checksum_range(&source.path, self.algorithm, start, Some(length)).await?;

        let mut request = self
            .http
            .post(self.collection_url())
            .header(TUS_RESUMABLE, TUS_VERSION)
            .header(UPLOAD_KEY, key)
            .header(UPLOAD_LENGTH, length)
            .header(UPLOAD_CHECKSUM, checksum.header_value())
            .header(UPLOAD_METADATA, self.encoded_metadata(&source.name));

        if self.is_partial() {
            request = request.header(UPLOAD_CONCAT, UploadConcat::Partial.header_value());
        }

        let response = request.send().await.map_err(transport_error)?;

        if response.status().as_u16() != 201 {
            return Err(TusError::File(format!(
                "unable to create upload resource (status {})",
                response.status().as_u16()
            )));
        }

        let location = self.remember(key, &response).await?;
        tracing::debug!(key = %key, length = length, location = %location, "Created upload resource");
        Ok(location)
    }

    /// Cache where a freshly created upload lives and when it expires
    async fn remember(&self, key: &str, response: &Response) -> Result<String> {
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| TusError::Protocol("creation response without Location".to_string()))?;

        let expires_at = response
            .headers()
            .get(UPLOAD_EXPIRES)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_http_date)
            .unwrap_or_else(|| Utc::now() + ttl_duration(self.cache.ttl_secs()));

        let entry = ClientEntry {
            location: location.clone(),
            expires_at,
        };
        self.cache.set(key, entry.into_fields()?).await?;

        Ok(location)
    }

    async fn send_patch(&self, key: &str, offset: u64, count: u64, length: u64) -> Result<u64> {
        let source = self.source()?;
        let start = self.partial_offset.unwrap_or(0) + offset;

        let body = FileChunkStream::open(&source.path, start, Some(count), self.chunk_size)
            .await
            .map_err(|e| TusError::File(format!("cannot read {}: {e}", source.path.display())))?;

        let mut request = self
            .http
            .patch(self.upload_url_for(key).await?)
            .header(TUS_RESUMABLE, TUS_VERSION)
            .header(UPLOAD_OFFSET, offset)
            .header(CONTENT_TYPE, OFFSET_OCTET_STREAM)
            .header(CONTENT_LENGTH, count);

        if self.is_partial() {
            request = request.header(UPLOAD_CONCAT, UploadConcat::Partial.header_value());
        }

        let response = request
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .map_err(transport_error)?;

        match response.status().as_u16() {
            204 => {
                let offset = header_u64(&response, UPLOAD_OFFSET)
                    .ok_or_else(|| TusError::Protocol("PATCH response without Upload-Offset".to_string()))?;
                tracing::debug!(key = %key, offset = offset, "Uploaded bytes");
                Ok(offset)
            }
            416 => Err(TusError::OutOfRange {
                written: offset + count,
                size: length,
            }),
            STATUS_CONNECTION_INTERRUPTED => Err(TusError::Connection(
                "upload interrupted, resume from the last offset".to_string(),
            )),
            STATUS_CHECKSUM_MISMATCH => Err(TusError::Protocol(
                "server rejected the upload checksum".to_string(),
            )),
            404 | 410 => Err(TusError::NotFound(key.to_string())),
            _ => Err(upstream_error(response).await),
        }
    }

    /// Ask the server to assemble `partials`, in order, into `key`.
    ///
    /// Returns the hex checksum the server computed for the assembled file.
    pub async fn concat(&mut self, key: &str, partials: &[String]) -> Result<String> {
        let source = self.source()?;
        let checksum = checksum_range(&source.path, self.algorithm, 0, None).await?;

        let response = self
            .http
            .post(self.collection_url())
            .header(TUS_RESUMABLE, TUS_VERSION)
            .header(UPLOAD_KEY, key)
            .header(UPLOAD_CHECKSUM, checksum.header_value())
            .header(UPLOAD_METADATA, self.encoded_metadata(&source.name))
            .header(UPLOAD_CONCAT, UploadConcat::Final(partials.to_vec()).header_value())
            .send()
            .await
            .map_err(transport_error)?;

        match response.status().as_u16() {
            201 => {}
            STATUS_CHECKSUM_MISMATCH => {
                return Err(TusError::ChecksumMismatch {
                    expected: checksum.hex(),
                    actual: "assembled content differs".to_string(),
                })
            }
            _ => return Err(upstream_error(response).await),
        }

        self.remember(key, &response).await?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| TusError::Protocol(format!("invalid concatenation response: {e}")))?;

        let checksum = body["data"]["checksum"]
            .as_str()
            .filter(|checksum| !checksum.is_empty())
            .map(str::to_string)
            .ok_or_else(|| TusError::Protocol("concatenation response without checksum".to_string()))?;

        tracing::debug!(key = %key, partials = partials.len(), "Concatenated partial uploads");
        Ok(checksum)
    }

    /// Terminate the upload on the server and forget it locally
    pub async fn delete(&mut self) -> Result<()> {
        let key = self.key()?.to_string();

        let response = self
            .http
            .delete(self.upload_url_for(&key).await?)
            .header(TUS_RESUMABLE, TUS_VERSION)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status().as_u16() {
            204 => {
                self.cache.delete(&key).await?;
                Ok(())
            }
            404 | 410 => Err(TusError::NotFound(key)),
            _ => Err(upstream_error(response).await),
        }
    }

    fn encoded_metadata(&self, name: &str) -> String {
        let pairs = std::iter::once(("filename", name)).chain(
            self.metadata
                .iter()
                .filter(|(key, _)| key.as_str() != "filename")
                .map(|(key, value)| (key.as_str(), value.as_str())),
        );
        encode_metadata(pairs)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// `<base>_<uuid>`, where any earlier partial suffix is dropped from `key`
pub fn partial_key(key: &str) -> String {
    let base = match key.rsplit_once('_') {
        Some((base, suffix)) if is_partial_suffix(suffix) => base,
        _ => key,
    };
    format!("{base}_{}", Uuid::new_v4().simple())
}

fn is_partial_suffix(suffix: &str) -> bool {
    suffix.len() == 32 && suffix.chars().all(|c| c.is_ascii_hexdigit())
}

fn header_u64(response: &Response, name: &str) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

fn transport_error(err: reqwest::Error) -> TusError {
    TusError::Connection(err.to_string())
}

async fn upstream_error(response: Response) -> TusError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = if body.trim().is_empty() {
        "unexpected response".to_string()
    } else {
        body
    };
    TusError::Upstream { status, message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_metadata;
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn client() -> TusClient {
        TusClient::new(ClientConfig::default(), Arc::new(MemoryStore::default()))
    }

    #[test]
    fn test_partial_key_replaces_previous_suffix() {
        let first = partial_key("report");
        let (base, suffix) = first.rsplit_once('_').unwrap();
        assert_eq!(base, "report");
        assert!(is_partial_suffix(suffix));

        let second = partial_key(&first);
        assert!(second.starts_with("report_"));
        assert_ne!(first, second);
        assert_eq!(second.matches('_').count(), 1);

        // Underscores that are not partial suffixes belong to the key
        assert!(partial_key("my_file").starts_with("my_file_"));
    }

    #[test]
    fn test_seek_derives_segment_key() {
        let mut client = client();
        client.set_key("movie").seek(100);

        assert!(client.is_partial());
        assert!(client.key().unwrap().starts_with("movie_"));
    }

    #[tokio::test]
    async fn test_metadata_always_carries_filename() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clip.mp4");
        tokio::fs::write(&path, b"0123456789").await.unwrap();

        let mut client = client();
        client.file(&path).await.unwrap();
        client.add_metadata("filename", "ignored").add_metadata("type", "video/mp4");

        let parsed = parse_metadata(&client.encoded_metadata("clip.mp4")).unwrap();
        assert_eq!(parsed["filename"], "clip.mp4");
        assert_eq!(parsed["type"], "video/mp4");
    }

    #[tokio::test]
    async fn test_segment_length_is_clamped_to_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, b"0123456789").await.unwrap();

        let mut client = client();
        client.file(&path).await.unwrap();
        assert_eq!(client.declared_length(Some(3)).unwrap(), 10);

        client.set_key("data").seek(6);
        assert_eq!(client.declared_length(Some(3)).unwrap(), 3);
        assert_eq!(client.declared_length(Some(30)).unwrap(), 4);
        assert_eq!(client.declared_length(None).unwrap(), 4);
    }

    #[tokio::test]
    async fn test_upload_without_file_or_key_fails_fast() {
        let mut client = client();
        assert!(matches!(client.upload(None).await, Err(TusError::Protocol(_))));

        client.set_key("k");
        assert!(matches!(client.upload(None).await, Err(TusError::File(_))));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connection_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, b"0123456789").await.unwrap();

        let config = ClientConfig {
            endpoint: "http://127.0.0.1:9".to_string(),
            ..Default::default()
        };
        let mut client = TusClient::new(config, Arc::new(MemoryStore::default()));
        client.file(&path).await.unwrap();
        client.set_key("data");

        let err = client.upload(None).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
