//! Blob storage: streaming-first writes with a byte cap, SHA-256 content
//! hashing, and append-then-move placement so readers never observe partial
//! files.

use std::path::PathBuf;
use std::pin::Pin;

use bytes::Bytes;
use futures::stream::Stream;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::paths::{AppPaths, PathError};

/// Boxed asynchronous byte stream accepted by the blob store.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, BlobError>> + Send>>;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("not found")]
    NotFound,
    #[error("upload exceeds the {limit} byte cap")]
    TooLarge { limit: u64 },
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("io error: {0}")]
    Io(String),
    #[error("stream error: {0}")]
    Stream(String),
}

impl From<std::io::Error> for BlobError {
    fn from(e: std::io::Error) -> Self {
        BlobError::Io(e.to_string())
    }
}

/// Result of a completed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub path: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
}

/// Filesystem blob store rooted at the application data directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    paths: AppPaths,
    max_bytes: u64,
}

impl FsBlobStore {
    pub fn new(paths: AppPaths, max_bytes: u64) -> Self {
        Self { paths, max_bytes }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Final on-disk location for a blob.
    pub fn blob_path(&self, file_id: &str, extension: &str) -> Result<PathBuf, PathError> {
        self.paths.blob_path(file_id, extension)
    }

    /// Consume the stream into a staging file, hashing and counting as bytes
    /// arrive. Exceeding the cap aborts the write and removes the staging
    /// file; nothing is visible at the final path until the atomic rename.
    pub async fn put(
        &self,
        file_id: &str,
        extension: &str,
        mut data: ByteStream,
    ) -> Result<StoredBlob, BlobError> {
        let staging_dir = self.paths.staging_dir()?;
        let staging_path = staging_dir.join(format!("{file_id}.partial"));

        let mut file = tokio::fs::File::create(&staging_path).await?;
        let mut hasher = Sha256::new();
        let mut total: u64 = 0;

        while let Some(chunk) = data.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&staging_path).await;
                    return Err(BlobError::Stream(err.to_string()));
                }
            };
            total += chunk.len() as u64;
            if total > self.max_bytes {
                drop(file);
                let _ = tokio::fs::remove_file(&staging_path).await;
                return Err(BlobError::TooLarge {
                    limit: self.max_bytes,
                });
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let sha256 = format!("{:x}", hasher.finalize());
        let final_path = self.paths.blob_path(file_id, extension)?;
        tokio::fs::rename(&staging_path, &final_path).await?;

        Ok(StoredBlob {
            path: final_path,
            sha256,
            size_bytes: total,
        })
    }

    pub async fn read(&self, file_id: &str, extension: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.paths.blob_path(file_id, extension)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(BlobError::NotFound),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn delete(&self, file_id: &str, extension: &str) -> Result<bool, BlobError> {
        let path = self.paths.blob_path(file_id, extension)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

/// Turn in-memory chunks into a [`ByteStream`]; shared by handlers and tests.
pub fn chunks_to_stream(chunks: Vec<Vec<u8>>) -> ByteStream {
    Box::pin(futures::stream::iter(
        chunks.into_iter().map(|c| Ok(Bytes::from(c))),
    ))
}
