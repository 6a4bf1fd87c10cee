use dataset_journal::{
    errors::{AppError, ErrorKind},
    models::Stage,
    services::{
        blob_store::{BlobStore, ObjectBlobStore},
        export::ExportFormat,
        ingest::{Ingestor, LoadRequest},
        registry::{FileQuery, Registry, RegistryConfig},
        retrieve::{FetchRequest, Retriever},
    },
};
use std::{path::Path, sync::Arc};

async fn setup(dir: &Path, blobs: Arc<dyn BlobStore>) -> (Ingestor, Retriever) {
    let endpoint = format!("sqlite://{}", dir.join("meta/registry.db").display());
    let registry = Registry::connect(&RegistryConfig::new(endpoint)).await.unwrap();
    (
        Ingestor::new(registry.clone(), blobs.clone(), "lake", "dj"),
        Retriever::new(registry, blobs),
    )
}

fn seed(dir: &Path) -> String {
    let src = dir.join("incoming");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(src.join("frame-1.png"), [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 1]).unwrap();
    std::fs::write(src.join("frame-2.png"), [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 2]).unwrap();
    std::fs::write(src.join("notes.json"), br#"{"camera": "front"}"#).unwrap();
    src.display().to_string()
}

#[tokio::test]
async fn load_then_fetch_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let (ingestor, retriever) = setup(tmp.path(), Arc::new(ObjectBlobStore::memory())).await;
    let source = seed(tmp.path());

    let mut images = LoadRequest::new(source.clone(), "Vision", "street");
    images.extensions = vec!["PNG".into()];
    images.tags = vec!["front".into()];
    images.upload = true;
    let report = ingestor.load(&images).await.unwrap();
    assert_eq!(report.registered.len(), 2);

    let mut notes = LoadRequest::new(source, "vision", "street");
    notes.extensions = vec![".json".into()];
    notes.upload = true;
    ingestor.load(&notes).await.unwrap();

    let mut query = FileQuery::new("vision", Stage::Raw);
    query.mime = Some("image".into());
    query.tags = vec!["FRONT".into()];
    let out = tmp.path().join("out");
    let fetched = retriever
        .fetch(&FetchRequest {
            query,
            directory: out.clone(),
            export: Some(ExportFormat::Json),
            dry_run: false,
        })
        .await
        .unwrap();

    assert_eq!(fetched.files.len(), 2);
    assert!(fetched.files.iter().all(|f| f.mime_type == "image/png"));
    assert!(out.join("dj_vision_raw.json").is_file());
    for file in &fetched.files {
        assert!(file.uri.starts_with("memory://lake/dj/vision/street/raw/image/png/"));
        assert!(out.join(file.object_name()).is_file());
    }
}

#[tokio::test]
async fn file_backend_keeps_objects_on_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("objects");
    let (ingestor, retriever) = setup(tmp.path(), Arc::new(ObjectBlobStore::local(&root))).await;
    let source = seed(tmp.path());

    let mut request = LoadRequest::new(source, "vision", "street");
    request.stage = Stage::Published;
    request.upload = true;
    ingestor.load(&request).await.unwrap();
    assert!(root.join("lake/dj/vision/street/published/application/json").is_dir());

    let fetched = retriever
        .fetch(&FetchRequest {
            query: FileQuery::new("vision", Stage::Published),
            directory: tmp.path().join("out"),
            export: None,
            dry_run: false,
        })
        .await
        .unwrap();
    assert_eq!(fetched.downloaded.len(), 3);
}

#[tokio::test]
async fn batch_errors_map_to_exit_codes() {
    let tmp = tempfile::tempdir().unwrap();
    let (ingestor, _) = setup(tmp.path(), Arc::new(ObjectBlobStore::memory())).await;
    let empty = tmp.path().join("empty");
    std::fs::create_dir_all(&empty).unwrap();

    let err: AppError = ingestor
        .load(&LoadRequest::new(empty.display().to_string(), "vision", "street"))
        .await
        .unwrap_err()
        .into();
    assert_eq!(err.kind, ErrorKind::Validation);
}
