//! Services: the storage-facing building blocks and the pipelines that
//! orchestrate them.

pub mod blob_store;
pub mod export;
pub mod ingest;
pub mod inspector;
pub mod key_resolver;
pub mod manifest;
pub mod registry;
pub mod retrieve;

use blob_store::BlobError;
use inspector::InspectError;
use key_resolver::UriError;
use registry::RegistryError;
use std::io;
use thiserror::Error;

/// Failure of an ingestion or retrieval batch, or of one of its items.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no candidate files found in `{0}`")]
    EmptySource(String),
    #[error("source `{0}` does not exist")]
    SourceNotFound(String),
    #[error("all {attempted} item(s) failed; see the log for the individual errors")]
    BatchFailed { attempted: usize },
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Inspect(#[from] InspectError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("failed to encode {format} export: {message}")]
    Export {
        format: &'static str,
        message: String,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<UriError> for PipelineError {
    fn from(err: UriError) -> Self {
        PipelineError::Blob(BlobError::InvalidUri(err))
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// One item dropped from a batch, with the reason.
#[derive(Clone, Debug, PartialEq)]
pub struct ItemFailure {
    pub source: String,
    pub error: String,
}
