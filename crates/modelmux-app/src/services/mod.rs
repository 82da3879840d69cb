//! IO-bound services: blob storage, file records, and the tiered cache.
//!
//! Pure transforms live in `crate::text`, `crate::sniff`, and
//! `crate::router`; modules here coordinate external state.

pub mod blob_store;
pub mod cache;
pub mod files;

pub use blob_store::{BlobError, ByteStream, FsBlobStore, StoredBlob, chunks_to_stream};
pub use cache::{CacheStats, TieredCache};
pub use files::{ExtractionStatus, FileRecord, FileRegistry, FileStoreError, spawn_reaper};
