//! Blob storage access over an object storage backend.
//!
//! Objects are addressed by `scheme://bucket/key` URIs. A single
//! implementation, [`ObjectBlobStore`], sits on top of the `object_store`
//! crate and serves three schemes: `s3` (Amazon S3 or a compatible endpoint),
//! `file` (a local directory per bucket) and `memory` (in-process).
//!
//! Object tags are kept in a JSON sidecar under [`TAGS_PREFIX`] in the same
//! bucket. Sidecars are never returned by [`BlobStore::list`].

use super::key_resolver::{BlobUri, UriError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use object_store::{
    ObjectMeta, ObjectStore, PutPayload, WriteMultipart, aws::AmazonS3Builder,
    local::LocalFileSystem, memory::InMemory, path::Path as ObjectPath,
};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    future::Future,
    io,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use uuid::Uuid;

/// Reserved key prefix holding per-object tag sidecars.
pub const TAGS_PREFIX: &str = ".dj-tags";

/// Tag used to count how many registrations point at one object.
pub const REF_COUNT_TAG: &str = "ref_count";

/// Read size when streaming a local file into an upload.
const READ_CHUNK: usize = 256 * 1024;

/// Multipart parts allowed in flight per upload.
const UPLOAD_CONCURRENCY: usize = 4;

pub type ObjectTags = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error(transparent)]
    InvalidUri(#[from] UriError),
    #[error("URI scheme `{found}` does not match the `{expected}` storage backend")]
    SchemeMismatch { expected: String, found: String },
    #[error("unsupported storage scheme `{0}` (expected s3, file or memory)")]
    UnsupportedScheme(String),
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error(
        "permission denied for `{uri}`: {message}. Verify that your access keys are valid and associated with an appropriate role"
    )]
    Permission { uri: String, message: String },
    #[error("transient storage failure on `{uri}`: {message}")]
    Transient { uri: String, message: String },
    #[error("storage backend error on `{uri}`: {source}")]
    Backend {
        uri: String,
        #[source]
        source: object_store::Error,
    },
    #[error("storage configuration error: {0}")]
    Config(String),
    #[error("invalid tag sidecar for `{uri}`: {source}")]
    Tags {
        uri: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl BlobError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BlobError::Transient { .. })
    }
}

pub type BlobResult<T> = Result<T, BlobError>;

/// What `put` ended up doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Uploaded,
    /// The object already existed and overwriting was not requested.
    Skipped,
}

/// Operations the ingestion and retrieval pipelines need from object storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// URI scheme served by this store (`s3`, `file`, ...).
    fn scheme(&self) -> &str;

    async fn exists(&self, uri: &str) -> BlobResult<bool>;

    /// Object names below `prefix`, relative to it, optionally restricted to
    /// the given extensions (case-insensitive, with or without the dot).
    async fn list(&self, prefix: &str, extensions: &[String]) -> BlobResult<Vec<String>>;

    async fn put(
        &self,
        local: &Path,
        uri: &str,
        overwrite: bool,
        tags: Option<&ObjectTags>,
    ) -> BlobResult<PutOutcome>;

    /// Download `uri` to `local`, creating parent directories.
    async fn get(&self, uri: &str, local: &Path) -> BlobResult<()>;

    async fn copy(&self, from: &str, to: &str) -> BlobResult<()>;

    async fn get_tags(&self, uri: &str) -> BlobResult<ObjectTags>;

    async fn put_tags(&self, uri: &str, tags: &ObjectTags) -> BlobResult<()>;
}

/// Increment the `ref_count` tag of an object and return the new value.
pub async fn bump_ref_count(store: &dyn BlobStore, uri: &str) -> BlobResult<u64> {
    let mut tags = store.get_tags(uri).await?;
    let count = tags
        .get(REF_COUNT_TAG)
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    tags.insert(REF_COUNT_TAG.to_string(), count.to_string());
    debug!("updating `{}` ref count -> {}", uri, count);
    store.put_tags(uri, &tags).await?;
    Ok(count)
}

/// Normalize extension filters to lowercase `.ext` form.
pub fn normalize_extensions(extensions: &[String]) -> Vec<String> {
    extensions
        .iter()
        .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
        .filter(|ext| !ext.is_empty())
        .map(|ext| format!(".{ext}"))
        .collect()
}

/// True when no filter is given or `name` ends with one of `normalized`.
pub fn matches_extension(name: &str, normalized: &[String]) -> bool {
    if normalized.is_empty() {
        return true;
    }
    let lower = name.to_lowercase();
    normalized.iter().any(|ext| lower.ends_with(ext.as_str()))
}

/// Backend families the blob store can talk to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageScheme {
    S3,
    File,
    Memory,
}

impl StorageScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageScheme::S3 => "s3",
            StorageScheme::File => "file",
            StorageScheme::Memory => "memory",
        }
    }
}

impl fmt::Display for StorageScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageScheme {
    type Err = BlobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s3" => Ok(StorageScheme::S3),
            "file" => Ok(StorageScheme::File),
            "memory" => Ok(StorageScheme::Memory),
            other => Err(BlobError::UnsupportedScheme(other.to_string())),
        }
    }
}

/// Bounded retry for transient backend failures.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    /// Run `call` until it succeeds, fails with a non-transient error, or
    /// `max_attempts` is reached.
    pub async fn run<T, F, Fut>(&self, uri: &str, op: &'static str, mut call: F) -> BlobResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, object_store::Error>> + Send,
        T: Send,
    {
        let mut attempt = 1;
        loop {
            match call().await.map_err(|err| classify(uri, err)) {
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        uri,
                        op,
                        attempt,
                        ?delay,
                        error = %err,
                        "transient storage failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Translate an `object_store` failure into the blob error taxonomy.
///
/// Only causes known to clear up on their own become `Transient`; anything
/// unrecognised is a permanent `Backend` error and is not retried.
fn classify(uri: &str, err: object_store::Error) -> BlobError {
    match err {
        object_store::Error::NotFound { .. } => BlobError::NotFound(uri.to_string()),
        object_store::Error::PermissionDenied { source, .. }
        | object_store::Error::Unauthenticated { source, .. } => BlobError::Permission {
            uri: uri.to_string(),
            message: source.to_string(),
        },
        object_store::Error::Generic { store, source } => match cause_of(&*source) {
            Cause::Permission => BlobError::Permission {
                uri: uri.to_string(),
                message: source.to_string(),
            },
            Cause::Transient => BlobError::Transient {
                uri: uri.to_string(),
                message: source.to_string(),
            },
            Cause::Permanent => BlobError::Backend {
                uri: uri.to_string(),
                source: object_store::Error::Generic { store, source },
            },
        },
        other => BlobError::Backend {
            uri: uri.to_string(),
            source: other,
        },
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Cause {
    Permission,
    Transient,
    Permanent,
}

/// Walk the source chain of a generic backend error looking for an I/O kind
/// or an HTTP status that says what went wrong.
fn cause_of(err: &(dyn std::error::Error + 'static)) -> Cause {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::PermissionDenied => return Cause::Permission,
                io::ErrorKind::TimedOut
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::Interrupted => return Cause::Transient,
                _ => {}
            }
        }
        match http_status(&err.to_string()) {
            Some(401 | 403) => return Cause::Permission,
            Some(429 | 500..=599) => return Cause::Transient,
            _ => {}
        }
        current = err.source();
    }
    Cause::Permanent
}

/// First HTTP error status mentioned in a message that talks about a status.
fn http_status(message: &str) -> Option<u16> {
    if !message.to_ascii_lowercase().contains("status") {
        return None;
    }
    message
        .split(|c: char| !c.is_ascii_digit())
        .filter(|token| token.len() == 3)
        .filter_map(|token| token.parse::<u16>().ok())
        .find(|code| (400..=599).contains(code))
}

/// Blob store over `object_store` backends, one client per bucket.
pub struct ObjectBlobStore {
    scheme: StorageScheme,
    /// Root directory for the `file` scheme; each bucket is a subdirectory.
    root: PathBuf,
    /// Optional S3-compatible endpoint.
    endpoint: Option<String>,
    retry: RetryPolicy,
    stores: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl ObjectBlobStore {
    pub fn new(scheme: StorageScheme, root: impl Into<PathBuf>, endpoint: Option<String>) -> Self {
        debug!(
            "storage scheme: {}, endpoint: {}",
            scheme,
            endpoint.as_deref().unwrap_or("default")
        );
        Self {
            scheme,
            root: root.into(),
            endpoint,
            retry: RetryPolicy::default(),
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// In-process store; contents live as long as this value.
    pub fn memory() -> Self {
        Self::new(StorageScheme::Memory, PathBuf::new(), None)
    }

    /// Directory-backed store rooted at `root`.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self::new(StorageScheme::File, root, None)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Parse `uri` and make sure it belongs to this backend.
    fn locate(&self, uri: &str) -> BlobResult<BlobUri> {
        let location = BlobUri::parse(uri)?;
        if location.scheme != self.scheme.as_str() {
            return Err(BlobError::SchemeMismatch {
                expected: self.scheme.to_string(),
                found: location.scheme,
            });
        }
        Ok(location)
    }

    async fn store_for(&self, bucket: &str) -> BlobResult<Arc<dyn ObjectStore>> {
        if let Some(store) = self
            .stores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(bucket)
        {
            return Ok(store.clone());
        }

        let store: Arc<dyn ObjectStore> = match self.scheme {
            StorageScheme::S3 => {
                let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
                if let Some(endpoint) = &self.endpoint {
                    builder = builder
                        .with_endpoint(endpoint)
                        .with_allow_http(endpoint.starts_with("http://"));
                }
                Arc::new(builder.build().map_err(|err| {
                    BlobError::Config(format!("failed to create S3 client for `{bucket}`: {err}"))
                })?)
            }
            StorageScheme::File => {
                let dir = self.root.join(bucket);
                fs::create_dir_all(&dir).await?;
                Arc::new(LocalFileSystem::new_with_prefix(&dir).map_err(|err| {
                    BlobError::Config(format!("invalid storage root {}: {err}", dir.display()))
                })?)
            }
            StorageScheme::Memory => Arc::new(InMemory::new()),
        };

        let mut stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(stores.entry(bucket.to_string()).or_insert(store).clone())
    }

    async fn read_tags(
        &self,
        store: &Arc<dyn ObjectStore>,
        uri: &str,
        key: &str,
    ) -> BlobResult<ObjectTags> {
        let path = tags_path(key);
        match self.retry.run(uri, "get_tags", || store.get(&path)).await {
            Ok(result) => {
                let raw = result.bytes().await.map_err(|err| classify(uri, err))?;
                serde_json::from_slice(&raw).map_err(|source| BlobError::Tags {
                    uri: uri.to_string(),
                    source,
                })
            }
            Err(BlobError::NotFound(_)) => Ok(ObjectTags::new()),
            Err(err) => Err(err),
        }
    }

    async fn write_tags(
        &self,
        store: &Arc<dyn ObjectStore>,
        uri: &str,
        key: &str,
        tags: &ObjectTags,
    ) -> BlobResult<()> {
        let raw = Bytes::from(serde_json::to_vec(tags).map_err(|source| BlobError::Tags {
            uri: uri.to_string(),
            source,
        })?);
        let path = tags_path(key);
        self.retry
            .run(uri, "put_tags", || store.put(&path, PutPayload::from(raw.clone())))
            .await?;
        debug!("{} tags: {:?}", uri, tags);
        Ok(())
    }
}

fn tags_path(key: &str) -> ObjectPath {
    ObjectPath::from(format!("{TAGS_PREFIX}/{key}.json"))
}

/// Quoted or bare 32-hex-digit ETags are plain MD5 digests of the payload.
fn md5_etag(e_tag: Option<&str>) -> Option<String> {
    let tag = e_tag?.trim_matches('"');
    (tag.len() == 32 && tag.chars().all(|c| c.is_ascii_hexdigit())).then(|| tag.to_ascii_lowercase())
}

/// Write a byte stream to `path`, returning the MD5 of what was written.
async fn write_stream<S>(path: &Path, uri: &str, mut stream: S) -> BlobResult<String>
where
    S: Stream<Item = object_store::Result<Bytes>> + Unpin,
{
    let mut file = File::create(path).await?;
    let mut digest = md5::Context::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| classify(uri, err))?;
        digest.consume(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(format!("{:x}", digest.compute()))
}

/// Stream `chunks` into a multipart upload at `path`, aborting it on failure.
async fn upload_stream<S>(
    store: &dyn ObjectStore,
    path: &ObjectPath,
    mut chunks: S,
) -> object_store::Result<()>
where
    S: Stream<Item = object_store::Result<Bytes>> + Unpin + Send,
{
    let upload = store.put_multipart(path).await?;
    let mut writer = WriteMultipart::new(upload);
    while let Some(chunk) = chunks.next().await {
        let written = match chunk {
            Ok(chunk) => writer
                .wait_for_capacity(UPLOAD_CONCURRENCY)
                .await
                .map(|()| writer.put(chunk)),
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            if let Err(abort) = writer.abort().await {
                warn!(%path, error = %abort, "failed to abort multipart upload");
            }
            return Err(err);
        }
    }
    writer.finish().await?;
    Ok(())
}

fn local_read_error(err: io::Error) -> object_store::Error {
    object_store::Error::Generic {
        store: "local file",
        source: Box::new(err),
    }
}

#[async_trait]
impl BlobStore for ObjectBlobStore {
    fn scheme(&self) -> &str {
        self.scheme.as_str()
    }

    async fn exists(&self, uri: &str) -> BlobResult<bool> {
        let location = self.locate(uri)?;
        let store = self.store_for(&location.bucket).await?;
        let path = ObjectPath::from(location.key.as_str());
        match self.retry.run(uri, "head", || store.head(&path)).await {
            Ok(_) => {
                debug!("{} exists", uri);
                Ok(true)
            }
            Err(BlobError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn list(&self, prefix: &str, extensions: &[String]) -> BlobResult<Vec<String>> {
        let location = self.locate(prefix)?;
        let store = self.store_for(&location.bucket).await?;
        let key_prefix = location.key.trim_matches('/').to_string();
        let list_prefix = (!key_prefix.is_empty()).then(|| ObjectPath::from(key_prefix.as_str()));
        let wanted = normalize_extensions(extensions);

        debug!("starting to search for objects in `{}/`", prefix.trim_end_matches('/'));
        let objects: Vec<ObjectMeta> = self
            .retry
            .run(prefix, "list", || {
                store.list(list_prefix.as_ref()).try_collect::<Vec<_>>()
            })
            .await?;

        let mut names: Vec<String> = objects
            .iter()
            .map(|meta| meta.location.as_ref())
            .filter(|full| !full.starts_with(TAGS_PREFIX))
            .map(|full| {
                full.strip_prefix(key_prefix.as_str())
                    .unwrap_or(full)
                    .trim_start_matches('/')
            })
            .filter(|name| !name.is_empty() && matches_extension(name, &wanted))
            .map(str::to_string)
            .collect();
        names.sort();

        debug!("found {} object(s) under {}", names.len(), prefix);
        Ok(names)
    }

    async fn put(
        &self,
        local: &Path,
        uri: &str,
        overwrite: bool,
        tags: Option<&ObjectTags>,
    ) -> BlobResult<PutOutcome> {
        if !overwrite && self.exists(uri).await? {
            debug!("object {} already exists, skipping upload", uri);
            return Ok(PutOutcome::Skipped);
        }

        let location = self.locate(uri)?;
        let store = self.store_for(&location.bucket).await?;
        let path = ObjectPath::from(location.key.as_str());
        // Surface a missing or unreadable local file as an I/O error.
        fs::metadata(local).await?;
        self.retry
            .run(uri, "put", || {
                let store = store.clone();
                let path = path.clone();
                let local = local.to_path_buf();
                async move {
                    let file = File::open(&local).await.map_err(local_read_error)?;
                    let chunks = ReaderStream::with_capacity(file, READ_CHUNK).map_err(local_read_error);
                    upload_stream(store.as_ref(), &path, chunks).await
                }
            })
            .await?;
        debug!("uploaded {} -> {}", local.display(), uri);

        if let Some(tags) = tags {
            self.write_tags(&store, uri, &location.key, tags).await?;
        }
        Ok(PutOutcome::Uploaded)
    }

    async fn get(&self, uri: &str, local: &Path) -> BlobResult<()> {
        let location = self.locate(uri)?;
        let store = self.store_for(&location.bucket).await?;
        let path = ObjectPath::from(location.key.as_str());
        let result = self.retry.run(uri, "get", || store.get(&path)).await?;
        let expected = md5_etag(result.meta.e_tag.as_deref());

        let parent = local
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let digest = match write_stream(&tmp_path, uri, result.into_stream()).await {
            Ok(digest) => digest,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };
        if let Some(expected) = expected {
            if expected != digest {
                warn!(uri, %expected, actual = %digest, "downloaded payload does not match ETag");
            }
        }
        if let Err(err) = fs::rename(&tmp_path, local).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BlobError::Io(err));
        }

        debug!("downloaded {} -> {}", uri, local.display());
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> BlobResult<()> {
        let source = self.locate(from)?;
        let target = self.locate(to)?;
        let source_store = self.store_for(&source.bucket).await?;
        let source_path = ObjectPath::from(source.key.as_str());
        let target_path = ObjectPath::from(target.key.as_str());

        if source.bucket == target.bucket {
            self.retry
                .run(from, "copy", || source_store.copy(&source_path, &target_path))
                .await?;
        } else {
            let target_store = self.store_for(&target.bucket).await?;
            self.retry
                .run(from, "copy", || {
                    let source_store = source_store.clone();
                    let target_store = target_store.clone();
                    let source_path = source_path.clone();
                    let target_path = target_path.clone();
                    async move {
                        let result = source_store.get(&source_path).await?;
                        upload_stream(target_store.as_ref(), &target_path, result.into_stream())
                            .await
                    }
                })
                .await?;
        }

        debug!("copy completed successfully {} -> {}", from, to);
        Ok(())
    }

    async fn get_tags(&self, uri: &str) -> BlobResult<ObjectTags> {
        if !self.exists(uri).await? {
            return Err(BlobError::NotFound(uri.to_string()));
        }
        let location = self.locate(uri)?;
        let store = self.store_for(&location.bucket).await?;
        self.read_tags(&store, uri, &location.key).await
    }

    async fn put_tags(&self, uri: &str, tags: &ObjectTags) -> BlobResult<()> {
        if !self.exists(uri).await? {
            return Err(BlobError::NotFound(uri.to_string()));
        }
        let location = self.locate(uri)?;
        let store = self.store_for(&location.bucket).await?;
        self.write_tags(&store, uri, &location.key, tags).await
    }
}
