//! Retrieval pipeline: query the registry, optionally export the matching
//! records, then download their objects.

use super::{
    ItemFailure, PipelineError, PipelineResult,
    blob_store::BlobStore,
    export::{self, ExportFormat},
    registry::{FileQuery, Registry},
};
use crate::models::FileRecord;
use std::{path::PathBuf, sync::Arc};
use tracing::{debug, error, info};

#[derive(Clone, Debug)]
pub struct FetchRequest {
    pub query: FileQuery,
    /// Download and export target.
    pub directory: PathBuf,
    pub export: Option<ExportFormat>,
    /// Query (and export) only; download nothing.
    pub dry_run: bool,
}

#[derive(Clone, Debug, Default)]
pub struct FetchReport {
    pub files: Vec<FileRecord>,
    pub export_path: Option<PathBuf>,
    pub downloaded: Vec<PathBuf>,
    pub failures: Vec<ItemFailure>,
}

#[derive(Clone)]
pub struct Retriever {
    registry: Registry,
    blobs: Arc<dyn BlobStore>,
}

impl Retriever {
    pub fn new(registry: Registry, blobs: Arc<dyn BlobStore>) -> Self {
        Self { registry, blobs }
    }

    pub async fn fetch(&self, request: &FetchRequest) -> PipelineResult<FetchReport> {
        let mut session = self.registry.begin().await?;
        let files = session.query_files(&request.query).await?;
        if files.is_empty() {
            info!(
                "no files matched in {}/{}",
                request.query.domain, request.query.stage
            );
            return Ok(FetchReport::default());
        }
        info!("{} file(s) matched", files.len());

        let mut report = FetchReport::default();
        if let Some(format) = request.export {
            let records = export::collect_records(&mut session, &files).await?;
            let path = export::write_export(
                &request.directory,
                &request.query.domain,
                request.query.stage,
                format,
                &records,
            )
            .await?;
            report.export_path = Some(path);
        }
        session.commit().await?;

        if !request.dry_run {
            for file in &files {
                let target = request.directory.join(file.object_name());
                match self.blobs.get(&file.uri, &target).await {
                    Ok(()) => {
                        debug!("fetched {} -> {}", file.uri, target.display());
                        report.downloaded.push(target);
                    }
                    Err(err) => {
                        error!("failed to download {}: {}", file.uri, err);
                        report.failures.push(ItemFailure {
                            source: file.uri.clone(),
                            error: err.to_string(),
                        });
                    }
                }
            }
            if report.downloaded.is_empty() {
                return Err(PipelineError::BatchFailed {
                    attempted: files.len(),
                });
            }
            info!(
                "downloaded {} file(s) to {} ({} failed)",
                report.downloaded.len(),
                request.directory.display(),
                report.failures.len()
            );
        }

        report.files = files;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::Stage,
        services::{
            ingest::{Ingestor, LoadRequest},
            testing::{memory_store, registry, write},
        },
    };
    use std::path::Path;

    async fn loaded(dir: &Path, upload: bool) -> (Ingestor, Retriever) {
        let registry = registry(dir).await;
        let blobs = memory_store();
        let ingestor = Ingestor::new(registry.clone(), blobs.clone(), "lake", "dj");
        let src = dir.join("src");
        write(&src, "a.txt", b"alpha");
        write(&src, "b.txt", b"beta");
        let mut request = LoadRequest::new(src.display().to_string(), "vision", "street");
        request.upload = upload;
        request.tags = vec!["day".into()];
        ingestor.load(&request).await.unwrap();
        (ingestor, Retriever::new(registry, blobs))
    }

    #[tokio::test]
    async fn exports_then_downloads() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, retriever) = loaded(tmp.path(), true).await;
        let out = tmp.path().join("out");

        let request = FetchRequest {
            query: FileQuery::new("vision", Stage::Raw),
            directory: out.clone(),
            export: Some(ExportFormat::Json),
            dry_run: false,
        };
        let report = retriever.fetch(&request).await.unwrap();
        assert_eq!(report.files.len(), 2);
        assert_eq!(report.downloaded.len(), 2);
        assert_eq!(report.export_path, Some(out.join("dj_vision_raw.json")));

        let exported = export::parse_records(
            &std::fs::read_to_string(out.join("dj_vision_raw.json")).unwrap(),
        )
        .unwrap();
        for file in &report.files {
            let record = &exported[&file.content_hash];
            assert_eq!(record.uri, file.uri);
            assert_eq!(record.dataset.name, "street");
            assert_eq!(record.tag_names(), vec!["day".to_string()]);
            assert!(out.join(file.object_name()).is_file());
        }
    }

    #[tokio::test]
    async fn dry_run_exports_without_downloading() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, retriever) = loaded(tmp.path(), true).await;
        let out = tmp.path().join("out");

        let request = FetchRequest {
            query: FileQuery::new("vision", Stage::Raw),
            directory: out.clone(),
            export: Some(ExportFormat::Toml),
            dry_run: true,
        };
        let report = retriever.fetch(&request).await.unwrap();
        assert!(report.downloaded.is_empty());
        assert!(out.join("dj_vision_raw.toml").is_file());
        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn no_match_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, retriever) = loaded(tmp.path(), true).await;
        let out = tmp.path().join("out");

        let request = FetchRequest {
            query: FileQuery::new("vision", Stage::Published),
            directory: out.clone(),
            export: Some(ExportFormat::Json),
            dry_run: false,
        };
        let report = retriever.fetch(&request).await.unwrap();
        assert!(report.files.is_empty());
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn all_downloads_failing_is_a_batch_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, retriever) = loaded(tmp.path(), false).await;

        let request = FetchRequest {
            query: FileQuery::new("vision", Stage::Raw),
            directory: tmp.path().join("out"),
            export: None,
            dry_run: false,
        };
        let err = retriever.fetch(&request).await.unwrap_err();
        assert!(matches!(err, PipelineError::BatchFailed { attempted: 2 }));
    }
}
