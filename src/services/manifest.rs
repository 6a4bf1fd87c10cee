//! Dataset creation from manifests (previous exports).

use super::{
    PipelineResult,
    export::parse_records,
    ingest::{IngestReport, Ingestor},
    registry::RegistryError,
};
use crate::models::PendingFile;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct ManifestRequest {
    pub domain: String,
    pub dataset: String,
    pub description: Option<String>,
    pub exists_ok: bool,
    pub manifests: Vec<PathBuf>,
}

impl Ingestor {
    /// Relate every record of every manifest to one dataset.
    ///
    /// Runs in a single transaction: an unreadable or unsupported manifest,
    /// or any failure other than an already-registered file, leaves the
    /// registry untouched. Objects are copied to the URIs the new dataset
    /// resolves to.
    pub async fn create_from_manifests(
        &self,
        request: &ManifestRequest,
    ) -> PipelineResult<IngestReport> {
        let mut session = self.registry.begin().await?;
        let dataset = session
            .ensure_dataset(
                &request.domain,
                &request.dataset,
                request.description.as_deref(),
                request.exists_ok,
            )
            .await?;
        let mut report = IngestReport::new(dataset);

        for path in &request.manifests {
            let raw = fs::read_to_string(path).await?;
            let records = parse_records(&raw)?;
            debug!("{} record(s) in {}", records.len(), path.display());

            for record in records.values() {
                let pending =
                    PendingFile::new(self.blobs.scheme(), &report.dataset, record.to_new_file());
                match session.add_file(pending, &record.tag_names()).await {
                    Ok(file) => {
                        if file.uri != record.uri {
                            if self.blobs.exists(&record.uri).await? {
                                self.blobs.copy(&record.uri, &file.uri).await?;
                            } else {
                                warn!("{} has no stored object to copy", record.uri);
                            }
                        }
                        report.registered.push(file.id);
                    }
                    Err(RegistryError::FileExists { uri, existing_id }) => {
                        warn!("{} is already registered at {}", record.filename, uri);
                        report.existing.extend(existing_id);
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }

        session.commit().await?;
        info!(
            "related {} file(s) to {}/{} ({} already present)",
            report.registered.len(),
            report.dataset.domain,
            report.dataset.name,
            report.existing.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::Stage,
        services::{
            PipelineError,
            export::ExportFormat,
            ingest::LoadRequest,
            registry::{FileLookup, FileQuery},
            retrieve::{FetchRequest, Retriever},
            testing::{memory_store, registry, write},
        },
    };
    use std::path::Path;

    async fn exported(dir: &Path, format: ExportFormat) -> (Ingestor, PathBuf) {
        let registry = registry(dir).await;
        let blobs = memory_store();
        let ingestor = Ingestor::new(registry.clone(), blobs.clone(), "lake", "dj");
        let src = dir.join("src");
        write(&src, "a.txt", b"alpha");
        write(&src, "b.txt", b"beta");
        let mut load = LoadRequest::new(src.display().to_string(), "vision", "street");
        load.upload = true;
        load.tags = vec!["day".into()];
        ingestor.load(&load).await.unwrap();

        let fetch = FetchRequest {
            query: FileQuery::new("vision", Stage::Raw),
            directory: dir.join("out"),
            export: Some(format),
            dry_run: true,
        };
        let report = Retriever::new(registry, blobs).fetch(&fetch).await.unwrap();
        (ingestor, report.export_path.unwrap())
    }

    fn request(manifests: Vec<PathBuf>) -> ManifestRequest {
        ManifestRequest {
            domain: "vision".into(),
            dataset: "curated".into(),
            description: Some("hand picked".into()),
            exists_ok: true,
            manifests,
        }
    }

    #[tokio::test]
    async fn relates_records_and_copies_objects() {
        let tmp = tempfile::tempdir().unwrap();
        let (ingestor, manifest) = exported(tmp.path(), ExportFormat::Toml).await;

        let report = ingestor
            .create_from_manifests(&request(vec![manifest.clone()]))
            .await
            .unwrap();
        assert_eq!(report.registered.len(), 2);
        assert_eq!(report.dataset.name, "curated");

        let mut session = ingestor.registry.begin().await.unwrap();
        for id in &report.registered {
            let file = session.get_file(&FileLookup::Id(*id)).await.unwrap().unwrap();
            assert!(file.uri.contains("/vision/curated/raw/"));
            assert!(ingestor.blobs.exists(&file.uri).await.unwrap());
            assert_eq!(session.tags_of_file(file.id).await.unwrap()[0].name, "day");
        }
        drop(session);

        let again = ingestor
            .create_from_manifests(&request(vec![manifest]))
            .await
            .unwrap();
        assert!(again.registered.is_empty());
        assert_eq!(again.file_ids(), report.file_ids());
    }

    #[tokio::test]
    async fn bad_manifest_rolls_everything_back() {
        let tmp = tempfile::tempdir().unwrap();
        let (ingestor, manifest) = exported(tmp.path(), ExportFormat::Toml).await;
        let bogus = write(tmp.path(), "notes.txt", b"not a manifest");

        let err = ingestor
            .create_from_manifests(&request(vec![manifest, bogus]))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));

        let mut session = ingestor.registry.begin().await.unwrap();
        assert_eq!(session.get_dataset("vision", "curated").await.unwrap(), None);
    }

    #[tokio::test]
    async fn yaml_manifest_relates_records() {
        let tmp = tempfile::tempdir().unwrap();
        let (ingestor, manifest) = exported(tmp.path(), ExportFormat::Yaml).await;
        assert_eq!(manifest.extension().and_then(|ext| ext.to_str()), Some("yaml"));

        let report = ingestor
            .create_from_manifests(&request(vec![manifest]))
            .await
            .unwrap();
        assert_eq!(report.registered.len(), 2);

        let mut session = ingestor.registry.begin().await.unwrap();
        let curated = session.get_dataset("vision", "curated").await.unwrap().unwrap();
        assert_eq!(session.files_of_dataset(curated.id).await.unwrap().len(), 2);
    }
}
