//! Upload endpoint handlers

use std::collections::BTreeMap;
use std::path::PathBuf;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{
        header::{self, IntoHeaderName},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use super::{ApiError, TusServer};
use crate::error::TusError;
use crate::events::UploadEvent;
use crate::protocol::{
    encode_metadata, is_valid_key, parse_metadata, sanitize_name, UploadConcat, ALLOWED_METHODS,
    OFFSET_OCTET_STREAM, TUS_CHECKSUM_ALGORITHM, TUS_EXTENSION, TUS_EXTENSIONS, TUS_MAX_SIZE,
    TUS_VERSION, TUS_VERSION_HEADER, UPLOAD_CHECKSUM, UPLOAD_CONCAT, UPLOAD_EXPIRES, UPLOAD_KEY,
    UPLOAD_LENGTH, UPLOAD_METADATA, UPLOAD_OFFSET,
};
use crate::store::{format_http_date, get_upload, ttl_duration, StoreError, UploadRecord, UploadType};
use crate::transfer::{checksum_file, Checksum, ChecksumAlgorithm, FileChunkStream, PartDescriptor, StreamSource};

type HandlerResult = Result<Response, ApiError>;

// ============================================================================
// Helpers
// ============================================================================

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
}

/// Values we emit are ASCII by construction; anything else is dropped
fn set_header<K: IntoHeaderName>(headers: &mut HeaderMap, name: K, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Live record for `key`; an unreadable record is treated as gone
async fn load_record(server: &TusServer, key: &str) -> Result<Option<UploadRecord>, ApiError> {
    match get_upload(server.store().as_ref(), key, false).await {
        Ok(record) => Ok(record),
        Err(StoreError::InvalidRecord(detail)) => {
            tracing::warn!(key = %key, error = %detail, "Unreadable upload record");
            Err(ApiError::gone())
        }
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// OPTIONS
// ============================================================================

pub async fn options(State(server): State<TusServer>) -> Response {
    let mut headers = HeaderMap::new();
    set_header(&mut headers, header::ALLOW, ALLOWED_METHODS);
    set_header(&mut headers, TUS_VERSION_HEADER, TUS_VERSION);
    set_header(&mut headers, TUS_EXTENSION, TUS_EXTENSIONS);
    set_header(&mut headers, TUS_CHECKSUM_ALGORITHM, &ChecksumAlgorithm::advertised());

    let max = server.config().max_upload_size;
    if max > 0 {
        set_header(&mut headers, TUS_MAX_SIZE, &max.to_string());
    }

    (StatusCode::OK, headers).into_response()
}

// ============================================================================
// POST
// ============================================================================

/// POST {api_path}
///
/// Create an upload, or assemble partial uploads when `Upload-Concat:
/// final;...` is present.
pub async fn create(State(server): State<TusServer>, headers: HeaderMap) -> HandlerResult {
    let mut metadata = match header_str(&headers, UPLOAD_METADATA) {
        Some(raw) => parse_metadata(raw)?,
        None => BTreeMap::new(),
    };

    let declared_name = metadata
        .remove("filename")
        .or_else(|| metadata.remove("name"))
        .ok_or_else(|| ApiError::bad_request("Upload-Metadata must include a filename"))?;
    let name = sanitize_name(&declared_name).ok_or_else(|| ApiError::bad_request("Invalid filename"))?;

    let concat = header_str(&headers, UPLOAD_CONCAT)
        .map(UploadConcat::parse)
        .transpose()?;

    let key = match header_str(&headers, UPLOAD_KEY) {
        Some(key) if is_valid_key(key) => key.to_string(),
        Some(_) => return Err(ApiError::bad_request("Invalid Upload-Key")),
        None => Uuid::new_v4().to_string(),
    };

    let checksum = header_str(&headers, UPLOAD_CHECKSUM)
        .map(Checksum::parse_header)
        .transpose()?;

    let target = NewUpload {
        location: server.location(&headers, &key),
        file_path: server.file_path(&key, &name),
        key,
        name,
        metadata,
    };

    let upload_type = match concat {
        Some(UploadConcat::Final(partials)) => return concatenate(&server, target, partials, checksum).await,
        Some(UploadConcat::Partial) => UploadType::Partial,
        None => UploadType::Normal,
    };

    let size: u64 = header_str(&headers, UPLOAD_LENGTH)
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| ApiError::bad_request("Upload-Length must be a non-negative integer"))?;

    let max = server.config().max_upload_size;
    if max > 0 && size > max {
        return Err(ApiError::too_large(max));
    }

    if load_record(&server, &target.key).await?.is_some() {
        return Err(ApiError::conflict("An upload with this key already exists"));
    }

    let key = target.key.clone();
    let record = target.into_record(&server, size, 0, checksum.as_ref(), upload_type);
    let response_headers = created_headers(&record);

    // Zero-length uploads are complete here, so the file must exist already
    server.engine().allocate(&record.file_path).await?;
    server.store().set(&key, record.into_fields()?).await?;

    tracing::info!(
        key = %key,
        size = size,
        upload_type = upload_type.as_str(),
        "Created upload"
    );
    server.publish(UploadEvent::Created { key, size });

    Ok((StatusCode::CREATED, response_headers).into_response())
}

/// Fields shared by plain creation and concatenation
struct NewUpload {
    key: String,
    name: String,
    location: String,
    file_path: PathBuf,
    metadata: BTreeMap<String, String>,
}

impl NewUpload {
    fn into_record(
        self,
        server: &TusServer,
        size: u64,
        offset: u64,
        checksum: Option<&Checksum>,
        upload_type: UploadType,
    ) -> UploadRecord {
        let now = Utc::now();
        let ttl = ttl_duration(server.store().ttl_secs());

        UploadRecord {
            name: self.name,
            size,
            offset,
            checksum: checksum.map(Checksum::hex).unwrap_or_default(),
            checksum_algorithm: checksum
                .map(|checksum| checksum.algorithm.as_str().to_string())
                .unwrap_or_default(),
            file_path: self.file_path,
            location: self.location,
            created_at: now,
            expires_at: now + ttl,
            upload_type,
            metadata: self.metadata,
        }
    }
}

fn created_headers(record: &UploadRecord) -> HeaderMap {
    let mut headers = HeaderMap::new();
    set_header(&mut headers, header::LOCATION, &record.location);
    set_header(&mut headers, UPLOAD_EXPIRES, &format_http_date(&record.expires_at));
    headers
}

// ============================================================================
// Concatenation
// ============================================================================

async fn concatenate(
    server: &TusServer,
    target: NewUpload,
    partials: Vec<String>,
    declared: Option<Checksum>,
) -> HandlerResult {
    let key = target.key.clone();

    if partials.contains(&key) {
        return Err(ApiError::bad_request("A final upload cannot list itself as a partial"));
    }
    if load_record(server, &key).await?.is_some() {
        return Err(ApiError::conflict("An upload with this key already exists"));
    }

    let mut parts = Vec::with_capacity(partials.len());
    let mut partial_files = Vec::with_capacity(partials.len());
    let mut size = 0u64;

    for partial in &partials {
        let record = load_record(server, partial)
            .await?
            .filter(|record| record.upload_type == UploadType::Partial)
            .ok_or_else(|| ApiError::bad_request(format!("Unknown partial upload: {partial}")))?;

        size += record.size;
        parts.push(PartDescriptor {
            file_path: record.file_path.clone(),
            offset: record.offset,
        });
        partial_files.push(record.file_path);
    }

    let merged = server.engine().merge(&target.file_path, &parts).await?;

    let algorithm = declared
        .as_ref()
        .map(|checksum| checksum.algorithm)
        .unwrap_or_default();
    let actual = checksum_file(&target.file_path, algorithm).await?;

    // Assembled file and record persist whether or not the checksum matches
    let record = target.into_record(server, size, merged.offset, Some(&actual), UploadType::Final);
    let response_headers = created_headers(&record);
    server.store().set(&key, record.into_fields()?).await?;

    if let Some(declared) = declared {
        if declared.digest != actual.digest {
            tracing::warn!(
                key = %key,
                expected = %hex::encode(&declared.digest),
                actual = %actual.hex(),
                "Concatenated upload failed checksum verification"
            );
            return Err(ApiError::checksum_mismatch());
        }
    }

    server.engine().delete(&partial_files, true).await;
    server.store().delete_all(&partials).await?;

    tracing::info!(
        key = %key,
        partials = partials.len(),
        size = merged.size,
        "Concatenated partial uploads"
    );
    server.publish(UploadEvent::Merged {
        key,
        partials,
        size: merged.size,
    });

    Ok((
        StatusCode::CREATED,
        response_headers,
        Json(json!({ "data": { "checksum": actual.hex() } })),
    )
        .into_response())
}

// ============================================================================
// HEAD
// ============================================================================

/// HEAD {api_path}/:key
pub async fn status(State(server): State<TusServer>, Path(key): Path<String>) -> HandlerResult {
    let Some(fields) = server.store().get(&key, false).await? else {
        return Err(ApiError::not_found());
    };

    // Present but without a usable offset
    let record = UploadRecord::from_fields(fields).map_err(|_| ApiError::gone())?;

    let mut headers = HeaderMap::new();
    set_header(&mut headers, UPLOAD_LENGTH, &record.size.to_string());
    set_header(&mut headers, UPLOAD_OFFSET, &record.offset.to_string());
    set_header(&mut headers, UPLOAD_EXPIRES, &format_http_date(&record.expires_at));
    set_header(&mut headers, header::CACHE_CONTROL, "no-store");

    let metadata = std::iter::once(("filename", record.name.as_str()))
        .chain(record.metadata.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    set_header(&mut headers, UPLOAD_METADATA, &encode_metadata(metadata));

    if record.upload_type != UploadType::Normal {
        set_header(&mut headers, UPLOAD_CONCAT, record.upload_type.as_str());
    }

    Ok((StatusCode::OK, headers).into_response())
}

// ============================================================================
// PATCH
// ============================================================================

/// PATCH {api_path}/:key
pub async fn append(
    State(server): State<TusServer>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> HandlerResult {
    let record = load_record(&server, &key).await?.ok_or_else(ApiError::gone)?;

    if record.upload_type == UploadType::Final {
        return Err(ApiError::forbidden("Final uploads cannot be modified"));
    }

    if let Some(claimed) = header_str(&headers, UPLOAD_OFFSET) {
        let claimed: u64 = claimed
            .parse()
            .map_err(|_| ApiError::bad_request("Upload-Offset must be a non-negative integer"))?;
        if claimed != record.offset {
            return Err(ApiError::conflict(format!(
                "Upload-Offset {claimed} does not match current offset {}",
                record.offset
            )));
        }
    }

    let content_type = header_str(&headers, header::CONTENT_TYPE.as_str())
        .and_then(|value| value.split(';').next())
        .map(str::trim);
    if !content_type.is_some_and(|value| value.eq_ignore_ascii_case(OFFSET_OCTET_STREAM)) {
        return Err(ApiError::unsupported_media_type());
    }

    let mut source = StreamSource::new(body.into_data_stream());
    let offset = server
        .engine()
        .upload(&key, &record.file_path, record.size, record.offset, &mut source)
        .await
        .map_err(|e| {
            match &e {
                TusError::Connection(reason) => {
                    tracing::info!(key = %key, reason = %reason, "Client disconnected, upload can resume")
                }
                TusError::OutOfRange { written, size } => tracing::warn!(
                    key = %key,
                    written = written,
                    size = size,
                    "Rejected bytes beyond declared length"
                ),
                _ => {}
            }
            ApiError::from(e)
        })?;

    if offset == record.size {
        verify_completed(&record, &key).await?;
        tracing::info!(key = %key, size = record.size, "Upload complete");
        server.publish(UploadEvent::Complete {
            key: key.clone(),
            size: record.size,
        });
    }

    let mut response_headers = HeaderMap::new();
    set_header(&mut response_headers, UPLOAD_OFFSET, &offset.to_string());
    set_header(&mut response_headers, UPLOAD_EXPIRES, &format_http_date(&record.expires_at));

    Ok((StatusCode::NO_CONTENT, response_headers).into_response())
}

/// Check a finished upload against the checksum declared at creation
async fn verify_completed(record: &UploadRecord, key: &str) -> Result<(), ApiError> {
    if record.checksum.is_empty() {
        return Ok(());
    }

    let algorithm: ChecksumAlgorithm = record.checksum_algorithm.parse().unwrap_or_default();
    let actual = checksum_file(&record.file_path, algorithm).await?;

    if !actual.hex().eq_ignore_ascii_case(&record.checksum) {
        tracing::warn!(
            key = %key,
            expected = %record.checksum,
            actual = %actual.hex(),
            "Upload failed checksum verification"
        );
        return Err(ApiError::checksum_mismatch());
    }

    Ok(())
}

// ============================================================================
// GET
// ============================================================================

/// GET {api_path} without a key
pub async fn missing_key() -> ApiError {
    ApiError::bad_request("Upload key is required")
}

/// GET {api_path}/:key
pub async fn download(State(server): State<TusServer>, Path(key): Path<String>) -> HandlerResult {
    if !is_valid_key(&key) {
        return Err(ApiError::bad_request("Upload key is required"));
    }

    let record = load_record(&server, &key).await?.ok_or_else(ApiError::not_found)?;

    let metadata = tokio::fs::metadata(&record.file_path)
        .await
        .map_err(|_| ApiError::not_found())?;
    let stream = FileChunkStream::open(&record.file_path, 0, None, server.config().chunk_size)
        .await
        .map_err(|_| ApiError::not_found())?;

    let content_type = mime_guess::from_path(&record.name).first_or_octet_stream();
    let disposition = format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii_fallback(&record.name),
        urlencoding::encode(&record.name)
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type.as_ref())
        .header(header::CONTENT_LENGTH, metadata.len())
        .header(header::CONTENT_DISPOSITION, disposition)
        .body(Body::from_stream(stream))
        .map_err(ApiError::internal)
}

fn ascii_fallback(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { '_' })
        .collect()
}

// ============================================================================
// DELETE
// ============================================================================

/// DELETE {api_path}/:key
pub async fn terminate(State(server): State<TusServer>, Path(key): Path<String>) -> HandlerResult {
    let record = load_record(&server, &key).await?.ok_or_else(ApiError::not_found)?;

    let file_present = tokio::fs::metadata(&record.file_path).await.is_ok();
    let removed = server.store().delete(&key).await?;

    if !file_present {
        if removed {
            tracing::warn!(key = %key, "Dropped upload record whose file is missing");
        }
        return Err(ApiError::gone());
    }
    if !removed {
        return Err(ApiError::gone());
    }

    server.engine().delete(&[record.file_path], true).await;

    tracing::info!(key = %key, "Terminated upload");

    let mut headers = HeaderMap::new();
    set_header(&mut headers, TUS_EXTENSION, "termination");
    Ok((StatusCode::NO_CONTENT, headers).into_response())
}
