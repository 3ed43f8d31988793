//! Record types kept in a metadata store

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::StoreError;

// ============================================================================
// Constants
// ============================================================================

/// Default record lifetime: 1 day
pub const DEFAULT_TTL_SECS: u64 = 86_400;

/// Longest record lifetime a store accepts: 100 years
pub const MAX_TTL_SECS: u64 = 100 * 365 * 86_400;

/// RFC 7231 HTTP-date, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`
pub const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Raw, mergeable view of a stored record.
///
/// Stores only ever see flat JSON objects; typed records are layered on top
/// so that writers touching different attributes never clobber each other.
pub type RecordFields = Map<String, Value>;

/// Build a field set from a `json!({...})` object literal.
///
/// Non-object values produce an empty field set.
pub fn fields(value: Value) -> RecordFields {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

// ============================================================================
// HTTP dates
// ============================================================================

pub fn format_http_date(at: &DateTime<Utc>) -> String {
    at.format(HTTP_DATE_FORMAT).to_string()
}

pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), HTTP_DATE_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
        .or_else(|| {
            DateTime::parse_from_rfc2822(value.trim())
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
}

/// Serde adapter storing timestamps as HTTP-dates
pub mod http_date {
    use chrono::{DateTime, Utc};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_http_date(at))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_http_date(&raw).ok_or_else(|| D::Error::custom(format!("invalid HTTP date: {raw}")))
    }
}

/// Whether a raw record is past its `expires_at`.
///
/// A missing or unparseable expiry counts as expired.
pub fn fields_expired(record: &RecordFields, now: DateTime<Utc>) -> bool {
    record
        .get("expires_at")
        .and_then(Value::as_str)
        .and_then(parse_http_date)
        .map_or(true, |expires_at| expires_at < now)
}

/// Record lifetime as a chrono duration, clamped to `MAX_TTL_SECS`
pub fn ttl_duration(ttl_secs: u64) -> Duration {
    Duration::seconds(ttl_secs.min(MAX_TTL_SECS) as i64)
}

/// Fill `created_at` / `expires_at` on a record about to be created
pub fn stamp_new_record(record: &mut RecordFields, ttl_secs: u64) {
    let now = Utc::now();
    record
        .entry("created_at")
        .or_insert_with(|| Value::String(format_http_date(&now)));
    record
        .entry("expires_at")
        .or_insert_with(|| Value::String(format_http_date(&(now + ttl_duration(ttl_secs)))));
}

/// Shallow merge: fields in `update` win, everything else persists
pub fn merge_fields(existing: &mut RecordFields, update: RecordFields) {
    for (name, value) in update {
        existing.insert(name, value);
    }
}

// ============================================================================
// Upload records (server side)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UploadType {
    #[default]
    Normal,
    Partial,
    Final,
}

impl UploadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Partial => "partial",
            Self::Final => "final",
        }
    }
}

/// One in-flight or completed upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    /// Declared file name (already sanitized)
    pub name: String,

    /// Declared total length in bytes
    pub size: u64,

    /// Bytes durably written so far
    pub offset: u64,

    /// Hex digest of the complete content; empty when none was declared
    #[serde(default)]
    pub checksum: String,

    /// Algorithm the checksum was computed with
    #[serde(default)]
    pub checksum_algorithm: String,

    pub file_path: PathBuf,

    /// Public URL of the upload resource
    pub location: String,

    #[serde(with = "http_date")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "http_date")]
    pub expires_at: DateTime<Utc>,

    #[serde(default)]
    pub upload_type: UploadType,

    /// Remaining `Upload-Metadata` pairs
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl UploadRecord {
    pub fn from_fields(fields: RecordFields) -> Result<Self, StoreError> {
        serde_json::from_value(Value::Object(fields))
            .map_err(|e| StoreError::InvalidRecord(e.to_string()))
    }

    pub fn into_fields(self) -> Result<RecordFields, StoreError> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(StoreError::InvalidRecord(format!("expected object, got {other}"))),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }

    pub fn is_complete(&self) -> bool {
        self.offset == self.size
    }

    /// Past expiry and still missing bytes; only these are reaped
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now && self.offset < self.size
    }
}

// ============================================================================
// Client cache entries
// ============================================================================

/// Where a client left an upload, keyed by upload key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEntry {
    pub location: String,

    #[serde(with = "http_date")]
    pub expires_at: DateTime<Utc>,
}

impl ClientEntry {
    pub fn from_fields(fields: RecordFields) -> Result<Self, StoreError> {
        serde_json::from_value(Value::Object(fields))
            .map_err(|e| StoreError::InvalidRecord(e.to_string()))
    }

    pub fn into_fields(self) -> Result<RecordFields, StoreError> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(StoreError::InvalidRecord(format!("expected object, got {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_record() -> UploadRecord {
        let now = Utc::now();
        UploadRecord {
            name: "report.pdf".to_string(),
            size: 100,
            offset: 40,
            checksum: String::new(),
            checksum_algorithm: String::new(),
            file_path: PathBuf::from("/tmp/uploads/abc/report.pdf"),
            location: "http://localhost/files/abc".to_string(),
            created_at: now,
            expires_at: now + Duration::hours(1),
            upload_type: UploadType::Normal,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_http_date_roundtrip_drops_subseconds() {
        let at = Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap();
        let text = format_http_date(&at);
        assert_eq!(text, "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(parse_http_date(&text), Some(at));
    }

    #[test]
    fn test_merge_keeps_untouched_fields() {
        let mut existing = fields(json!({"a": 1}));
        merge_fields(&mut existing, fields(json!({"b": 2})));
        assert_eq!(Value::Object(existing), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_missing_expiry_counts_as_expired() {
        assert!(fields_expired(&fields(json!({"offset": 0})), Utc::now()));
    }

    #[test]
    fn test_stamp_does_not_override_existing_expiry() {
        let mut record = fields(json!({"expires_at": "Sun, 06 Nov 1994 08:49:37 GMT"}));
        stamp_new_record(&mut record, 60);
        assert_eq!(record["expires_at"], "Sun, 06 Nov 1994 08:49:37 GMT");
        assert!(record.contains_key("created_at"));
    }

    #[test]
    fn test_huge_ttl_is_clamped() {
        let mut record = RecordFields::new();
        stamp_new_record(&mut record, u64::MAX);

        assert_eq!(ttl_duration(u64::MAX), ttl_duration(MAX_TTL_SECS));
        assert!(!fields_expired(&record, Utc::now()));
    }

    #[test]
    fn test_record_fields_roundtrip() {
        let record = sample_record();
        let restored = UploadRecord::from_fields(record.clone().into_fields().unwrap()).unwrap();
        assert_eq!(restored.offset, 40);
        assert_eq!(restored.upload_type, UploadType::Normal);
        assert_eq!(restored.expires_at.timestamp(), record.expires_at.timestamp());
    }

    #[test]
    fn test_stale_requires_incomplete() {
        let mut record = sample_record();
        record.expires_at = Utc::now() - Duration::hours(1);
        assert!(record.is_stale(Utc::now()));

        record.offset = record.size;
        assert!(!record.is_stale(Utc::now()));
    }
}
