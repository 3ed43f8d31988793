//! In-process metadata store

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use super::types::{fields_expired, merge_fields, stamp_new_record, RecordFields};
use super::{MetadataStore, StoreError, StoreSettings};

/// Map-backed store; records vanish with the process
pub struct MemoryStore {
    settings: StoreSettings,
    records: RwLock<HashMap<String, RecordFields>>,
}

impl MemoryStore {
    pub fn new(settings: StoreSettings) -> Self {
        Self {
            settings,
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(StoreSettings::default())
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    fn set_prefix(&mut self, prefix: &str) {
        self.settings.prefix = prefix.to_string();
    }

    async fn get(&self, key: &str, include_expired: bool) -> Result<Option<RecordFields>, StoreError> {
        let records = self.records.read();
        let Some(record) = records.get(&self.settings.namespaced(key)) else {
            return Ok(None);
        };

        if !include_expired && fields_expired(record, Utc::now()) {
            return Ok(None);
        }

        Ok(Some(record.clone()))
    }

    async fn set(&self, key: &str, fields: RecordFields) -> Result<(), StoreError> {
        let mut records = self.records.write();
        match records.entry(self.settings.namespaced(key)) {
            Entry::Occupied(mut entry) => merge_fields(entry.get_mut(), fields),
            Entry::Vacant(entry) => {
                let mut record = fields;
                stamp_new_record(&mut record, self.settings.ttl_secs);
                entry.insert(record);
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.records.write().remove(&self.settings.namespaced(key)).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let records = self.records.read();
        Ok(records
            .keys()
            .filter_map(|stored| self.settings.strip(stored))
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fields;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_set_merges_into_existing_record() {
        let store = MemoryStore::default();

        store.set("k", fields(json!({"a": 1}))).await.unwrap();
        store.set("k", fields(json!({"b": 2}))).await.unwrap();

        let record = store.get("k", false).await.unwrap().unwrap();
        assert_eq!(record["a"], 1);
        assert_eq!(record["b"], 2);
        assert!(record.contains_key("expires_at"));
    }

    #[tokio::test]
    async fn test_expired_record_hidden_unless_requested() {
        let store = MemoryStore::default();
        store
            .set("old", fields(json!({"expires_at": "Sun, 06 Nov 1994 08:49:37 GMT"})))
            .await
            .unwrap();

        assert!(store.get("old", false).await.unwrap().is_none());
        let record = store.get("old", true).await.unwrap().unwrap();
        assert_eq!(record["expires_at"], Value::from("Sun, 06 Nov 1994 08:49:37 GMT"));
    }

    #[tokio::test]
    async fn test_prefixes_isolate_namespaces() {
        let mut server = MemoryStore::default();
        server.set_prefix("tus:server:");
        server.set("shared", fields(json!({"offset": 3}))).await.unwrap();

        assert_eq!(server.keys().await.unwrap(), vec!["shared".to_string()]);
        assert!(server.get("tus:server:shared", true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryStore::default();
        store.set("k", fields(json!({"a": 1}))).await.unwrap();

        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert!(!store.delete_all(&["k".to_string(), "missing".to_string()]).await.unwrap());
        assert!(store.is_empty());
    }
}
