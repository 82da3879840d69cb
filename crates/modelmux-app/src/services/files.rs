//! File record registry: in-memory index over uploaded files with sidecar
//! metadata persistence and a retention reaper.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths::{AppPaths, PathError};
use crate::services::blob_store::FsBlobStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractionStatus {
    Pending,
    InProgress,
    Ready,
    Failed,
    Unsupported,
}

impl ExtractionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtractionStatus::Pending => "pending",
            ExtractionStatus::InProgress => "in-progress",
            ExtractionStatus::Ready => "ready",
            ExtractionStatus::Failed => "failed",
            ExtractionStatus::Unsupported => "unsupported",
        }
    }
}

/// Immutable upload metadata; only `extraction_status` changes after create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub original_filename: String,
    pub filename: String,
    pub extension: String,
    pub declared_mime: String,
    pub detected_mime: String,
    pub size: u64,
    pub sha256: String,
    pub uploaded_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Identity key of the uploader; listings and chat references are scoped
    /// to it.
    pub owner: String,
    pub extraction_status: ExtractionStatus,
    #[serde(default)]
    pub mime_mismatch: bool,
}

#[derive(Debug, Error)]
pub enum FileStoreError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("failed to persist metadata for {id}: {source}")]
    Persist {
        id: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Encode(#[from] serde_json::Error),
}

/// Registry of live file records. Mutation goes through `update_status` so
/// each key effectively has a single writer.
pub struct FileRegistry {
    paths: AppPaths,
    records: DashMap<String, FileRecord>,
}

impl FileRegistry {
    pub fn new(paths: AppPaths) -> Self {
        Self {
            paths,
            records: DashMap::new(),
        }
    }

    /// Load persisted records from disk. In-progress extractions from a
    /// previous process become pending again.
    pub async fn load(paths: AppPaths) -> Result<Self, FileStoreError> {
        let registry = Self::new(paths.clone());
        let base = paths.blobs_base_dir()?;

        let mut shards = match tokio::fs::read_dir(&base).await {
            Ok(entries) => entries,
            Err(_) => return Ok(registry),
        };
        while let Ok(Some(shard)) = shards.next_entry().await {
            let Ok(mut entries) = tokio::fs::read_dir(shard.path()).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if !name.ends_with(".meta.json") {
                    continue;
                }
                match tokio::fs::read(entry.path()).await {
                    Ok(raw) => match serde_json::from_slice::<FileRecord>(&raw) {
                        Ok(mut record) => {
                            if record.extraction_status == ExtractionStatus::InProgress {
                                record.extraction_status = ExtractionStatus::Pending;
                            }
                            registry.records.insert(record.id.clone(), record);
                        }
                        Err(error) => {
                            tracing::warn!(%error, file = %name, "skipping unreadable file metadata");
                        }
                    },
                    Err(error) => {
                        tracing::warn!(%error, file = %name, "skipping unreadable file metadata");
                    }
                }
            }
        }

        tracing::info!(count = registry.records.len(), "file registry loaded");
        Ok(registry)
    }

    pub async fn insert(&self, record: FileRecord) -> Result<(), FileStoreError> {
        self.persist(&record).await?;
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<FileRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    pub fn list_for_owner(&self, owner: &str) -> Vec<FileRecord> {
        let mut records: Vec<FileRecord> = self
            .records
            .iter()
            .filter(|r| r.owner == owner)
            .map(|r| r.clone())
            .collect();
        records.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        records
    }

    pub async fn update_status(
        &self,
        id: &str,
        status: ExtractionStatus,
    ) -> Result<Option<FileRecord>, FileStoreError> {
        let updated = {
            let Some(mut entry) = self.records.get_mut(id) else {
                return Ok(None);
            };
            entry.extraction_status = status;
            entry.clone()
        };
        self.persist(&updated).await?;
        Ok(Some(updated))
    }

    pub async fn remove(&self, id: &str) -> Option<FileRecord> {
        let removed = self.records.remove(id).map(|(_, r)| r)?;
        if let Ok(path) = self.paths.meta_path(id) {
            let _ = tokio::fs::remove_file(path).await;
        }
        Some(removed)
    }

    /// Delete every record past its retention expiry, blobs included.
    pub async fn sweep_expired(&self, blobs: &FsBlobStore) -> usize {
        let now = Utc::now();
        let expired: Vec<FileRecord> = self
            .records
            .iter()
            .filter(|r| r.expires_at <= now)
            .map(|r| r.clone())
            .collect();

        let mut removed = 0;
        for record in expired {
            if let Err(error) = blobs.delete(&record.id, &record.extension).await {
                tracing::warn!(%error, id = %record.id, "failed to delete expired blob");
            }
            self.remove(&record.id).await;
            removed += 1;
        }
        removed
    }

    async fn persist(&self, record: &FileRecord) -> Result<(), FileStoreError> {
        let path = self.paths.meta_path(&record.id)?;
        let encoded = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&path, encoded)
            .await
            .map_err(|source| FileStoreError::Persist {
                id: record.id.clone(),
                source,
            })
    }
}

/// Periodic retention sweep; mirrors the cache janitor.
pub fn spawn_reaper(registry: Arc<FileRegistry>, blobs: FsBlobStore, interval: Duration) {
    if interval.is_zero() {
        tracing::warn!("retention reaper disabled; expired uploads will linger");
        return;
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let removed = registry.sweep_expired(&blobs).await;
            if removed > 0 {
                tracing::debug!(removed, "reaped expired uploads");
            }
        }
    });
}
