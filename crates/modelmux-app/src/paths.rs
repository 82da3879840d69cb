//! Filesystem path helpers (XDG-aware) for blob storage and extractions.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("unable to determine project directories")]
    MissingProjectDirs,
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid file id `{id}`; expected at least two leading hex characters")]
    InvalidFileId { id: String },
}

/// Container providing filesystem paths for the gateway. In production this
/// is rooted at `$XDG_DATA_HOME/modelmux`; tests construct custom instances.
#[derive(Debug, Clone)]
pub struct AppPaths {
    base_dir: PathBuf,
}

impl AppPaths {
    pub fn from_project_dirs() -> Result<Self, PathError> {
        let dirs =
            ProjectDirs::from("dev", "modelmux", "modelmux").ok_or(PathError::MissingProjectDirs)?;
        Self::new(dirs.data_dir())
    }

    /// Construct paths rooted under the provided directory, ensuring it exists.
    pub fn new<P: AsRef<Path>>(base: P) -> Result<Self, PathError> {
        let base = base.as_ref().to_path_buf();
        ensure_dir(&base)?;
        Ok(Self { base_dir: base })
    }

    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.clone()
    }

    /// Base directory for uploaded blobs (`.../blobs`).
    pub fn blobs_base_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["blobs"])
    }

    /// Blob path sharded on the first two characters of the file id:
    /// `.../blobs/<2-char shard>/<file-id><ext>`.
    pub fn blob_path(&self, file_id: &str, extension: &str) -> Result<PathBuf, PathError> {
        if file_id.len() < 2 || !file_id.chars().take(2).all(|c| c.is_ascii_hexdigit()) {
            return Err(PathError::InvalidFileId {
                id: file_id.to_owned(),
            });
        }

        let mut path = self.blobs_base_dir()?;
        path.push(&file_id[..2]);
        ensure_dir(&path)?;
        path.push(format!("{file_id}{extension}"));
        Ok(path)
    }

    /// Sidecar metadata path for a file record.
    pub fn meta_path(&self, file_id: &str) -> Result<PathBuf, PathError> {
        if file_id.len() < 2 {
            return Err(PathError::InvalidFileId {
                id: file_id.to_owned(),
            });
        }
        let mut path = self.blobs_base_dir()?;
        path.push(&file_id[..2]);
        ensure_dir(&path)?;
        path.push(format!("{file_id}.meta.json"));
        Ok(path)
    }

    /// Staging directory for in-flight uploads before the atomic rename.
    pub fn staging_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["staging"])
    }

    /// Persisted extraction: `.../extractions/<content-hash>/<extractor-id>.json`.
    pub fn extraction_path(&self, content_hash: &str, extractor_id: &str) -> Result<PathBuf, PathError> {
        let mut path = self.ensure_child(&["extractions"])?;
        path.push(content_hash);
        ensure_dir(&path)?;
        path.push(format!("{extractor_id}.json"));
        Ok(path)
    }

    fn ensure_child(&self, segments: &[&str]) -> Result<PathBuf, PathError> {
        let mut path = self.base_dir.clone();
        for segment in segments {
            path.push(segment);
        }
        ensure_dir(&path)
    }
}

fn ensure_dir(path: &Path) -> Result<PathBuf, PathError> {
    if let Err(err) = fs::create_dir_all(path) {
        if err.kind() != io::ErrorKind::AlreadyExists {
            return Err(PathError::CreateDir {
                path: path.to_path_buf(),
                source: err,
            });
        }
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn blob_paths_are_sharded() {
        let dir = TempDir::new().unwrap();
        let paths = AppPaths::new(dir.path()).unwrap();
        let blob = paths.blob_path("ab12cd", ".pdf").unwrap();
        assert!(blob.ends_with("blobs/ab/ab12cd.pdf"));
        let meta = paths.meta_path("ab12cd").unwrap();
        assert!(meta.ends_with("blobs/ab/ab12cd.meta.json"));
    }

    #[test]
    fn short_ids_are_rejected() {
        let dir = TempDir::new().unwrap();
        let paths = AppPaths::new(dir.path()).unwrap();
        assert!(matches!(
            paths.blob_path("a", ".bin"),
            Err(PathError::InvalidFileId { .. })
        ));
    }

    #[test]
    fn extraction_path_nests_by_content_hash() {
        let dir = TempDir::new().unwrap();
        let paths = AppPaths::new(dir.path()).unwrap();
        let path = paths.extraction_path("deadbeef", "text-plain").unwrap();
        assert!(path.ends_with("extractions/deadbeef/text-plain.json"));
    }
}
