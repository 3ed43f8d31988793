//! File-backed metadata store
//!
//! All records of a store live in one JSON document. Several worker
//! processes may checkpoint different uploads into the same document, so
//! every read takes a shared lock and every read-merge-write cycle holds an
//! exclusive lock from the read until the rewritten document is synced.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;
use serde_json::{Map, Value};

use super::types::{fields_expired, merge_fields, stamp_new_record, RecordFields};
use super::{MetadataStore, StoreError, StoreSettings};

type Document = Map<String, Value>;

pub struct FileStore {
    path: PathBuf,
    settings: StoreSettings,
}

impl FileStore {
    pub fn new(path: PathBuf, settings: StoreSettings) -> Self {
        Self { path, settings }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(path: &Path) -> Result<File, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?)
    }

    fn read_document(file: &mut File) -> Result<Document, StoreError> {
        let mut raw = String::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_string(&mut raw)?;

        if raw.trim().is_empty() {
            return Ok(Document::new());
        }

        match serde_json::from_str::<Value>(&raw)? {
            Value::Object(document) => Ok(document),
            _ => Err(StoreError::InvalidRecord("store document is not a JSON object".to_string())),
        }
    }

    fn write_document(file: &mut File, document: &Document) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec(document)?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&encoded)?;
        file.sync_data()?;
        Ok(())
    }

    /// Run `read` against the document under a shared lock
    fn with_shared<T>(path: &Path, read: impl FnOnce(&Document) -> T) -> Result<T, StoreError> {
        let mut file = Self::open(path)?;
        FileExt::lock_shared(&file)?;

        let result = Self::read_document(&mut file).map(|document| read(&document));

        FileExt::unlock(&file)?;
        result
    }

    /// Run `modify` under an exclusive lock, persisting the document when it
    /// reports a change
    fn with_exclusive<T>(
        path: &Path,
        modify: impl FnOnce(&mut Document) -> (T, bool),
    ) -> Result<T, StoreError> {
        let mut file = Self::open(path)?;
        FileExt::lock_exclusive(&file)?;

        let result = Self::read_document(&mut file).and_then(|mut document| {
            let (value, changed) = modify(&mut document);
            if changed {
                Self::write_document(&mut file, &document)?;
            }
            Ok(value)
        });

        FileExt::unlock(&file)?;
        result
    }

    async fn blocking<T, F>(work: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    {
        tokio::task::spawn_blocking(work)
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl MetadataStore for FileStore {
    fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    fn set_prefix(&mut self, prefix: &str) {
        self.settings.prefix = prefix.to_string();
    }

    async fn get(&self, key: &str, include_expired: bool) -> Result<Option<RecordFields>, StoreError> {
        let path = self.path.clone();
        let stored = self.settings.namespaced(key);

        let record = Self::blocking(move || {
            Self::with_shared(&path, |document| {
                document.get(&stored).and_then(Value::as_object).cloned()
            })
        })
        .await?;

        Ok(record.filter(|record| include_expired || !fields_expired(record, Utc::now())))
    }

    async fn set(&self, key: &str, fields: RecordFields) -> Result<(), StoreError> {
        let path = self.path.clone();
        let stored = self.settings.namespaced(key);
        let ttl_secs = self.settings.ttl_secs;

        Self::blocking(move || {
            Self::with_exclusive(&path, |document| {
                match document.get_mut(&stored).and_then(Value::as_object_mut) {
                    Some(existing) => merge_fields(existing, fields),
                    None => {
                        let mut record = fields;
                        stamp_new_record(&mut record, ttl_secs);
                        document.insert(stored, Value::Object(record));
                    }
                }
                ((), true)
            })
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.delete_all(&[key.to_string()]).await
    }

    async fn delete_all(&self, keys: &[String]) -> Result<bool, StoreError> {
        let path = self.path.clone();
        let stored: Vec<String> = keys.iter().map(|key| self.settings.namespaced(key)).collect();

        Self::blocking(move || {
            Self::with_exclusive(&path, |document| {
                let removed = stored
                    .iter()
                    .fold(false, |removed, key| document.remove(key).is_some() || removed);
                (removed, removed)
            })
        })
        .await
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let path = self.path.clone();
        let settings = self.settings.clone();

        Self::blocking(move || {
            Self::with_shared(&path, |document| {
                document
                    .keys()
                    .filter_map(|stored| settings.strip(stored))
                    .map(str::to_string)
                    .collect()
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fields;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> FileStore {
        FileStore::new(dir.path().join("cache").join("tus.json"), StoreSettings::default())
    }

    #[tokio::test]
    async fn test_set_merges_and_persists() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.set("upload", fields(json!({"offset": 0, "size": 10}))).await.unwrap();
        store.set("upload", fields(json!({"checksum": "abc"}))).await.unwrap();

        let reopened = store_in(&dir);
        let record = reopened.get("upload", false).await.unwrap().unwrap();
        assert_eq!(record["offset"], 0);
        assert_eq!(record["size"], 10);
        assert_eq!(record["checksum"], "abc");
    }

    #[tokio::test]
    async fn test_concurrent_writers_to_different_keys() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store_in(&dir));

        let mut handles = Vec::new();
        for worker in 0..8u64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let key = format!("upload-{worker}");
                for offset in 0..10u64 {
                    store.set(&key, fields(json!({"offset": offset}))).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut keys = store.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys.len(), 8);
        for key in keys {
            let record = store.get(&key, false).await.unwrap().unwrap();
            assert_eq!(record["offset"], 9);
        }
    }

    #[tokio::test]
    async fn test_delete_reports_removal() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.set("a", fields(json!({"offset": 1}))).await.unwrap();

        assert!(store.delete_all(&["a".to_string(), "b".to_string()]).await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert!(store.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_document_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(store.get("nothing", true).await.unwrap().is_none());
    }
}
