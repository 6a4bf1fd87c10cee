//! Command handlers: turn parsed CLI arguments into pipeline calls and print
//! their outcome.

use anyhow::Context as _;
use dataset_journal::{
    config::{
        AppConfig, Command, ConfigArgs, CreateArgs, DatasetsArgs, FetchArgs, LoadArgs, Settings,
        ShowArgs, TagArgs,
    },
    errors::AppError,
    services::{
        blob_store::{BlobStore, ObjectBlobStore, StorageScheme},
        ingest::{Ingestor, LoadRequest},
        manifest::ManifestRequest,
        registry::{FileLookup, FileQuery, Registry},
        retrieve::{FetchRequest, Retriever},
    },
};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// Shared handles for commands that touch the registry or storage.
struct Backends {
    registry: Registry,
    blobs: Arc<dyn BlobStore>,
}

impl Backends {
    async fn connect(cfg: &AppConfig) -> Result<Self, AppError> {
        let registry = Registry::connect(&cfg.registry).await?;
        let blobs: Arc<dyn BlobStore> = Arc::new(ObjectBlobStore::new(
            cfg.storage_scheme,
            cfg.storage_root.clone(),
            cfg.storage_endpoint.clone(),
        ));
        Ok(Self { registry, blobs })
    }

    fn ingestor(&self, cfg: &AppConfig) -> Ingestor {
        Ingestor::new(
            self.registry.clone(),
            self.blobs.clone(),
            cfg.bucket.clone(),
            cfg.prefix.clone(),
        )
    }
}

pub async fn run(command: Command, cfg: &AppConfig) -> Result<(), AppError> {
    let command = match command {
        Command::Config(args) => return configure(&args, cfg),
        other => other,
    };

    let backends = Backends::connect(cfg).await?;
    let result = match command {
        Command::Load(args) => load(args, cfg, &backends).await,
        Command::Fetch(args) => fetch(args, &backends).await,
        Command::Datasets(args) => datasets(args, &backends).await,
        Command::Show(args) => show(args, &backends).await,
        Command::Tag(args) => tag(args, &backends).await,
        Command::Create(args) => create(args, cfg, &backends).await,
        Command::Config(_) => Ok(()),
    };
    backends.registry.close().await;
    result
}

fn configure(args: &ConfigArgs, cfg: &AppConfig) -> Result<(), AppError> {
    let updates = args.updates();
    if updates == Settings::default() {
        let effective = Settings {
            bucket: Some(cfg.bucket.clone()).filter(|b| !b.is_empty()),
            prefix: Some(cfg.prefix.clone()),
            storage_scheme: Some(cfg.storage_scheme.to_string()),
            storage_root: Some(cfg.storage_root.clone()),
            storage_endpoint: cfg.storage_endpoint.clone(),
            registry_endpoint: Some(cfg.registry.endpoint.clone()),
            pool_size: Some(cfg.registry.pool_size),
            max_overflow: Some(cfg.registry.max_overflow),
            echo: Some(cfg.registry.echo),
        };
        let body = toml::to_string_pretty(&effective).context("encoding settings")?;
        println!("# {}\n{}", cfg.settings_path.display(), body);
        return Ok(());
    }

    if let Some(scheme) = &updates.storage_scheme {
        scheme
            .parse::<StorageScheme>()
            .map_err(|err| AppError::validation(err.to_string()))?;
    }
    let merged = updates.or(Settings::load(&cfg.settings_path)?);
    merged.save(&cfg.settings_path)?;
    info!("saved settings to {}", cfg.settings_path.display());
    Ok(())
}

async fn load(args: LoadArgs, cfg: &AppConfig, backends: &Backends) -> Result<(), AppError> {
    let mut request = LoadRequest::new(args.source, &args.domain, &args.dataset);
    request.description = args.description;
    request.exists_ok = args.exists_ok;
    request.stage = args.stage;
    request.extensions = args.filters;
    request.tags = args.tags;
    request.recursive = args.recursive;
    request.upload = args.upload;

    let report = backends.ingestor(cfg).load(&request).await?;
    println!(
        "{}/{}: {} new, {} already registered, {} failed",
        report.dataset.domain,
        report.dataset.name,
        report.registered.len(),
        report.existing.len(),
        report.failures.len()
    );
    Ok(())
}

async fn fetch(args: FetchArgs, backends: &Backends) -> Result<(), AppError> {
    let mut query = FileQuery::new(&args.domain, args.stage);
    query.dataset = args.dataset;
    query.mime = args.mime;
    query.tags = args.tags;
    query.filenames = args.filenames;
    query.hashes = args.hashes;
    query.limit = Some(args.limit);

    let request = FetchRequest {
        query,
        directory: args.directory,
        export: args.export.then_some(args.export_format),
        dry_run: args.dry,
    };
    let retriever = Retriever::new(backends.registry.clone(), backends.blobs.clone());
    let report = retriever.fetch(&request).await?;
    if let Some(path) = &report.export_path {
        println!("exported to {}", path.display());
    }
    println!(
        "{} matched, {} downloaded, {} failed",
        report.files.len(),
        report.downloaded.len(),
        report.failures.len()
    );
    Ok(())
}

async fn datasets(args: DatasetsArgs, backends: &Backends) -> Result<(), AppError> {
    let mut session = backends.registry.begin().await?;
    let summaries = session
        .list_datasets(&args.domain, args.name.as_deref(), args.limit, args.offset)
        .await?;
    for summary in &summaries {
        println!(
            "{}\t{}\t{} file(s)\t{}",
            summary.dataset.id,
            summary.dataset.name,
            summary.total_files,
            summary.dataset.description.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn show(args: ShowArgs, backends: &Backends) -> Result<(), AppError> {
    let by_name = args
        .filename
        .map(|filename| (filename, args.dataset.unwrap_or_default(), args.domain));
    let lookup = FileLookup::from_parts(args.id, args.hash, by_name)?;

    let mut session = backends.registry.begin().await?;
    let file = session
        .get_file(&lookup)
        .await?
        .ok_or_else(|| AppError::not_found(format!("no file matches {lookup:?}")))?;
    let tags = session.tags_of_file(file.id).await?;
    let body = serde_json::to_string_pretty(&json!({ "file": file, "tags": tags }))
        .context("encoding file record")?;
    println!("{body}");
    Ok(())
}

async fn tag(args: TagArgs, backends: &Backends) -> Result<(), AppError> {
    let mut session = backends.registry.begin().await?;
    let file = session.tag_file(args.file_id, &args.tags).await?;
    let names: Vec<String> = session
        .tags_of_file(file.id)
        .await?
        .into_iter()
        .map(|tag| tag.name)
        .collect();
    session.commit().await?;
    println!("{}: {}", file.filename, names.join(", "));
    Ok(())
}

async fn create(args: CreateArgs, cfg: &AppConfig, backends: &Backends) -> Result<(), AppError> {
    let request = ManifestRequest {
        domain: args.domain,
        dataset: args.dataset,
        description: args.description,
        exists_ok: args.exists_ok,
        manifests: args.manifests,
    };
    let report = backends.ingestor(cfg).create_from_manifests(&request).await?;
    println!(
        "{}/{}: {} related, {} already registered",
        report.dataset.domain,
        report.dataset.name,
        report.registered.len(),
        report.existing.len()
    );
    Ok(())
}
