//! Ingestion pipeline.
//!
//! A batch moves through three phases: gathering candidate sources,
//! processing each one (fetch to a scratch directory when remote, inspect,
//! register, optionally upload) and summarizing. Items are processed one at a
//! time; each item registers inside its own transaction and a failing item
//! never aborts its siblings.

use super::{
    ItemFailure, PipelineError, PipelineResult,
    blob_store::{
        BlobStore, ObjectTags, PutOutcome, REF_COUNT_TAG, bump_ref_count, matches_extension,
        normalize_extensions,
    },
    inspector,
    key_resolver::BlobUri,
    registry::{Registry, RegistryError},
};
use crate::models::{Dataset, NewFile, PendingFile, Stage};
use std::{
    collections::BTreeSet,
    fmt, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tempfile::TempDir;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Parameters of one `load` batch.
#[derive(Clone, Debug)]
pub struct LoadRequest {
    /// Local directory or file, or a `scheme://bucket/prefix` URI.
    pub source: String,
    pub domain: String,
    pub dataset: String,
    pub description: Option<String>,
    /// Reuse the dataset if it already exists.
    pub exists_ok: bool,
    pub stage: Stage,
    /// Extensions to keep, with or without the leading dot.
    pub extensions: Vec<String>,
    pub tags: Vec<String>,
    /// Descend into subdirectories (or nested keys) of `source`.
    pub recursive: bool,
    /// Upload each registered file to its storage URI.
    pub upload: bool,
}

impl LoadRequest {
    pub fn new(source: impl Into<String>, domain: &str, dataset: &str) -> Self {
        Self {
            source: source.into(),
            domain: domain.to_string(),
            dataset: dataset.to_string(),
            description: None,
            exists_ok: true,
            stage: Stage::Raw,
            extensions: Vec::new(),
            tags: Vec::new(),
            recursive: false,
            upload: false,
        }
    }
}

/// A candidate file.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Source {
    Local(PathBuf),
    Remote(String),
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Local(path) => write!(f, "{}", path.display()),
            Source::Remote(uri) => f.write_str(uri),
        }
    }
}

/// Outcome of a batch that had at least one successful item.
#[derive(Clone, Debug)]
pub struct IngestReport {
    pub dataset: Dataset,
    /// Ids of files registered by this batch.
    pub registered: Vec<i64>,
    /// Ids of files that were already registered.
    pub existing: Vec<i64>,
    pub failures: Vec<ItemFailure>,
}

impl IngestReport {
    pub(crate) fn new(dataset: Dataset) -> Self {
        Self {
            dataset,
            registered: Vec::new(),
            existing: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Every file id the batch accounts for, new or pre-existing.
    pub fn file_ids(&self) -> BTreeSet<i64> {
        self.registered
            .iter()
            .chain(self.existing.iter())
            .copied()
            .collect()
    }
}

/// Drives ingestion batches against one registry and blob store.
#[derive(Clone)]
pub struct Ingestor {
    pub(crate) registry: Registry,
    pub(crate) blobs: Arc<dyn BlobStore>,
    bucket: String,
    prefix: String,
    /// Parent directory for fetched copies of remote sources; the system
    /// temp directory when unset.
    scratch_root: Option<PathBuf>,
}

impl Ingestor {
    pub fn new(
        registry: Registry,
        blobs: Arc<dyn BlobStore>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            blobs,
            bucket: bucket.into(),
            prefix: prefix.into(),
            scratch_root: None,
        }
    }

    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    fn scratch_dir(&self) -> io::Result<TempDir> {
        match &self.scratch_root {
            Some(root) => TempDir::new_in(root),
            None => TempDir::new(),
        }
    }

    /// Gather the sources of `request` and ingest them.
    pub async fn load(&self, request: &LoadRequest) -> PipelineResult<IngestReport> {
        let sources = self.gather(request).await?;
        self.ingest_sources(request, sources).await
    }

    /// Enumerate candidate sources, applying the extension filter.
    pub async fn gather(&self, request: &LoadRequest) -> PipelineResult<BTreeSet<Source>> {
        let wanted = normalize_extensions(&request.extensions);
        let sources: BTreeSet<Source> = if BlobUri::is_uri(&request.source) {
            let base = BlobUri::parse(&request.source)?;
            self.blobs
                .list(&request.source, &request.extensions)
                .await?
                .into_iter()
                .filter(|name| request.recursive || !name.contains('/'))
                .map(|name| Source::Remote(base.join(&name).to_string()))
                .collect()
        } else {
            gather_local(Path::new(&request.source), &wanted, request.recursive)?
        };

        if sources.is_empty() {
            return Err(PipelineError::EmptySource(request.source.clone()));
        }
        info!("found {} candidate file(s) in {}", sources.len(), request.source);
        Ok(sources)
    }

    /// Process an explicit set of sources as one batch.
    pub async fn ingest_sources(
        &self,
        request: &LoadRequest,
        sources: BTreeSet<Source>,
    ) -> PipelineResult<IngestReport> {
        if sources.is_empty() {
            return Err(PipelineError::EmptySource(request.source.clone()));
        }
        if self.bucket.is_empty() {
            return Err(PipelineError::Validation(
                "no bucket configured: set one with `dj config --set-bucket`".into(),
            ));
        }

        let mut session = self.registry.begin().await?;
        let dataset = session
            .ensure_dataset(
                &request.domain,
                &request.dataset,
                request.description.as_deref(),
                request.exists_ok,
            )
            .await?;
        session.commit().await?;

        let mut report = IngestReport::new(dataset);
        for source in &sources {
            match self.ingest_one(request, &report.dataset, source).await {
                Ok(id) => {
                    debug!("{} registered as file {}", source, id);
                    report.registered.push(id);
                }
                Err(PipelineError::Registry(RegistryError::FileExists { uri, existing_id })) => {
                    warn!("{} is already registered at {}", source, uri);
                    report.existing.extend(existing_id);
                }
                Err(err) => {
                    error!("failed to ingest {}: {}", source, err);
                    report.failures.push(ItemFailure {
                        source: source.to_string(),
                        error: err.to_string(),
                    });
                }
            }
        }

        if report.registered.is_empty() && report.existing.is_empty() {
            return Err(PipelineError::BatchFailed {
                attempted: sources.len(),
            });
        }
        info!(
            "loaded {} new file(s) into {}/{} ({} already present, {} failed)",
            report.registered.len(),
            report.dataset.domain,
            report.dataset.name,
            report.existing.len(),
            report.failures.len()
        );
        Ok(report)
    }

    async fn ingest_one(
        &self,
        request: &LoadRequest,
        dataset: &Dataset,
        source: &Source,
    ) -> PipelineResult<i64> {
        // Held until the item is done; dropping it removes any fetched copy.
        let mut scratch: Option<TempDir> = None;
        let local = match source {
            Source::Local(path) => path.clone(),
            Source::Remote(uri) => {
                let dir = scratch.insert(self.scratch_dir()?);
                let target = dir.path().join(BlobUri::parse(uri)?.file_name());
                self.blobs.get(uri, &target).await?;
                target
            }
        };

        let meta = inspector::inspect(&local).await?;
        let size_bytes = i64::try_from(meta.size_bytes).map_err(|_| {
            PipelineError::Validation(format!("{} is too large to register", source))
        })?;
        let pending = PendingFile::new(
            self.blobs.scheme(),
            dataset,
            NewFile {
                bucket: self.bucket.clone(),
                prefix: self.prefix.clone(),
                filename: meta.filename,
                content_hash: meta.content_hash,
                mime_type: meta.mime_type,
                size_bytes,
                stage: request.stage,
            },
        );

        let mut session = self.registry.begin().await?;
        let record = session.add_file(pending, &request.tags).await?;
        if request.upload {
            self.upload(&local, &record.uri).await?;
        }
        session.commit().await?;
        Ok(record.id)
    }

    /// Upload without overwriting; an object that is already there gets its
    /// reference count bumped instead.
    async fn upload(&self, local: &Path, uri: &str) -> PipelineResult<()> {
        let tags = ObjectTags::from([(REF_COUNT_TAG.to_string(), "1".to_string())]);
        match self.blobs.put(local, uri, false, Some(&tags)).await? {
            PutOutcome::Uploaded => debug!("uploaded {}", uri),
            PutOutcome::Skipped => {
                let count = bump_ref_count(self.blobs.as_ref(), uri).await?;
                debug!("{} already stored, ref count now {}", uri, count);
            }
        }
        Ok(())
    }
}

fn gather_local(root: &Path, wanted: &[String], recursive: bool) -> PipelineResult<BTreeSet<Source>> {
    if root.is_file() {
        let keep = root
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| matches_extension(name, wanted));
        return Ok(keep
            .then(|| Source::Local(root.to_path_buf()))
            .into_iter()
            .collect());
    }
    if !root.is_dir() {
        return Err(PipelineError::SourceNotFound(root.display().to_string()));
    }

    let mut walker = WalkDir::new(root).min_depth(1).sort_by_file_name();
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut sources = BTreeSet::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("skipping unreadable entry under {}: {}", root.display(), err);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if matches_extension(&name, wanted) {
            sources.insert(Source::Local(entry.into_path()));
        }
    }
    Ok(sources)
}
