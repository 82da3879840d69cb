//! Application-level error type shared by the binary and the service layer.

use thiserror::Error;

use crate::config::AppConfigError;
use crate::paths::PathError;
use crate::pipeline::ExtractError;
use crate::services::blob_store::BlobError;
use crate::services::files::FileStoreError;
use crate::upstream::DispatchError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] AppConfigError),
    #[error(transparent)]
    Paths(#[from] PathError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Files(#[from] FileStoreError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Server(#[from] modelmux_server::ServerError),
    #[error(transparent)]
    Metrics(#[from] prometheus::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("failed to read input file {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}
