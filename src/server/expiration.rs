//! Expiration sweep
//!
//! Reclaims uploads that are past their expiry and still incomplete.
//! Completed uploads are never reaped, however old.

use std::time::Duration;

use chrono::Utc;

use super::TusServer;
use crate::store::{get_upload, StoreError, UploadRecord};

impl TusServer {
    /// Delete every stale upload's record and file, returning what was removed
    pub async fn handle_expiration(&self) -> Result<Vec<UploadRecord>, StoreError> {
        let store = self.store();
        let now = Utc::now();
        let mut deleted = Vec::new();

        for key in store.keys().await? {
            let record = match get_upload(store.as_ref(), &key, true).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(StoreError::InvalidRecord(detail)) => {
                    tracing::warn!(key = %key, error = %detail, "Skipping unreadable record during sweep");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if !record.is_stale(now) {
                continue;
            }

            // The file only goes once its record is gone
            match store.delete(&key).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Failed to delete expired record, keeping its file");
                    continue;
                }
            }

            self.engine().delete(&[record.file_path.clone()], true).await;

            tracing::debug!(key = %key, offset = record.offset, size = record.size, "Reclaimed expired upload");
            deleted.push(record);
        }

        if !deleted.is_empty() {
            tracing::info!(count = deleted.len(), "Expiration sweep removed incomplete uploads");
        }

        Ok(deleted)
    }

    /// Run `handle_expiration` every `every` in the background
    pub fn start_expiration_task(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let server = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);

            loop {
                interval.tick().await;
                if let Err(e) = server.handle_expiration().await {
                    tracing::warn!(error = %e, "Expiration sweep failed");
                }
            }
        })
    }
}
