//! Shared numeric and string constants.

use std::time::Duration;

/// Hard cap on a single uploaded file.
pub const DEFAULT_MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Cap on a single extraction's text field (1 MiB of UTF-8).
pub const DEFAULT_EXTRACTION_TEXT_CAP: usize = 1024 * 1024;

/// How long uploaded bytes are retained before the reaper deletes them.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Total size of accumulated message content a chat request may carry.
pub const DEFAULT_MESSAGE_BYTES_CAP: usize = 512 * 1024;

/// Local cache tier byte budget.
pub const DEFAULT_CACHE_LOCAL_BYTES: u64 = 128 * 1024 * 1024;

/// Default cache entry TTL.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Heuristic token estimator: roughly four characters per token.
pub const CHARS_PER_TOKEN: u64 = 4;

/// Marker appended when extraction text is truncated at the cap.
pub const TRUNCATION_MARKER: &str = "\n[truncated]";

/// Sentinel model id selected when no catalog entry is usable.
pub const LOCAL_FALLBACK_MODEL: &str = "llama3.2-local";
