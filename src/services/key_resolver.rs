//! Canonical storage keys and `scheme://bucket/key` URIs.
//!
//! `resolve` is pure: the same parts always produce the same URI and any
//! changed part produces a different one, which is what lets the registry's
//! unique constraint on the URI double as a dedup check.

use crate::models::Stage;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UriError {
    #[error("invalid storage URI `{0}`: expected scheme://bucket/key")]
    MissingScheme(String),
    #[error("invalid storage URI `{0}`: no bucket specified")]
    MissingBucket(String),
}

/// Every attribute the storage key is derived from.
#[derive(Clone, Copy, Debug)]
pub struct KeyParts<'a> {
    pub bucket: &'a str,
    pub prefix: &'a str,
    pub domain: &'a str,
    pub dataset: &'a str,
    pub stage: Stage,
    pub mime_type: &'a str,
    pub content_hash: &'a str,
    /// Original extension including the dot (`".png"`), or empty.
    pub extension: &'a str,
}

/// Object key (no scheme, no bucket) for a file.
///
/// Layout: `{prefix}/{domain}/{dataset}/{stage}/{mime_type}/{hash}{ext}`; an
/// empty prefix contributes no segment.
pub fn object_key(parts: &KeyParts<'_>) -> String {
    let mut segments: Vec<&str> = Vec::with_capacity(6);
    let prefix = parts.prefix.trim_matches('/');
    if !prefix.is_empty() {
        segments.push(prefix);
    }
    segments.push(parts.domain);
    segments.push(parts.dataset);
    segments.push(parts.stage.as_str());
    segments.push(parts.mime_type);
    let mut key = segments.join("/");
    key.push('/');
    key.push_str(parts.content_hash);
    key.push_str(parts.extension);
    key
}

/// Full storage URI for a file.
pub fn resolve(scheme: &str, parts: &KeyParts<'_>) -> String {
    BlobUri::new(scheme, parts.bucket, object_key(parts)).to_string()
}

/// A parsed `scheme://bucket/key` location.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlobUri {
    pub scheme: String,
    pub bucket: String,
    /// Key inside the bucket; may be empty when the URI names a bucket root.
    pub key: String,
}

impl BlobUri {
    pub fn new(scheme: impl Into<String>, bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, UriError> {
        let (scheme, rest) = raw
            .split_once("://")
            .filter(|(scheme, _)| !scheme.is_empty())
            .ok_or_else(|| UriError::MissingScheme(raw.to_string()))?;
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(UriError::MissingBucket(raw.to_string()));
        }
        Ok(Self::new(scheme, bucket, key))
    }

    /// Whether `raw` looks like a storage URI rather than a local path.
    pub fn is_uri(raw: &str) -> bool {
        raw.split_once("://")
            .is_some_and(|(scheme, _)| !scheme.is_empty())
    }

    /// Append a relative object name below this URI's key.
    pub fn join(&self, name: &str) -> Self {
        let base = self.key.trim_end_matches('/');
        let name = name.trim_start_matches('/');
        let key = if base.is_empty() {
            name.to_string()
        } else {
            format!("{base}/{name}")
        };
        Self::new(self.scheme.clone(), self.bucket.clone(), key)
    }

    /// Last segment of the key.
    pub fn file_name(&self) -> &str {
        self.key
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
    }
}

impl fmt::Display for BlobUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key.is_empty() {
            write!(f, "{}://{}", self.scheme, self.bucket)
        } else {
            write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key)
        }
    }
}
