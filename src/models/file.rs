//! Represents a file registered under a dataset.

use super::{dataset::Dataset, stage::Stage};
use crate::services::key_resolver::{self, KeyParts};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A physically stored object and its registry metadata.
///
/// `uri` is always derived from the other fields (see [`PendingFile`]); it is
/// never set independently. `(dataset_id, bucket, prefix, stage, content_hash)`
/// is unique, and so is `uri`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FileRecord {
    pub id: i64,

    /// Owning dataset.
    pub dataset_id: i64,

    /// Storage bucket the object lives in.
    pub bucket: String,

    /// Storage prefix inside the bucket.
    pub prefix: String,

    pub stage: Stage,

    /// Original filename, including its extension.
    pub filename: String,

    /// Hex-encoded SHA-256 of the file content.
    pub content_hash: String,

    pub mime_type: String,

    pub size_bytes: i64,

    /// Canonical storage location, `scheme://bucket/key`.
    pub uri: String,

    pub created_at: DateTime<Utc>,
}

impl FileRecord {
    /// Base name of the stored object (last segment of `uri`).
    pub fn object_name(&self) -> &str {
        self.uri.rsplit('/').next().unwrap_or(&self.uri)
    }
}

/// Caller-supplied attributes of a file about to be registered.
#[derive(Clone, Debug, PartialEq)]
pub struct NewFile {
    pub bucket: String,
    pub prefix: String,
    pub filename: String,
    pub content_hash: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub stage: Stage,
}

impl NewFile {
    /// Extension of the original filename with its leading dot, or `""`.
    pub fn extension(&self) -> String {
        file_extension(&self.filename)
    }
}

/// A [`NewFile`] bound to its dataset, with the storage URI already resolved.
///
/// Construction is the only place the URI is computed, so an insert can never
/// carry a URI that disagrees with the rest of the record.
#[derive(Clone, Debug)]
pub struct PendingFile {
    dataset_id: i64,
    file: NewFile,
    uri: String,
}

impl PendingFile {
    pub fn new(scheme: &str, dataset: &Dataset, file: NewFile) -> Self {
        let extension = file.extension();
        let uri = key_resolver::resolve(
            scheme,
            &KeyParts {
                bucket: &file.bucket,
                prefix: &file.prefix,
                domain: &dataset.domain,
                dataset: &dataset.name,
                stage: file.stage,
                mime_type: &file.mime_type,
                content_hash: &file.content_hash,
                extension: &extension,
            },
        );
        Self {
            dataset_id: dataset.id,
            file,
            uri,
        }
    }

    pub fn dataset_id(&self) -> i64 {
        self.dataset_id
    }

    pub fn file(&self) -> &NewFile {
        &self.file
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

pub(crate) fn file_extension(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default()
}
