//! Export of retrieved file records to a structured file, and the reverse
//! parse used when a previous export is fed back in as a manifest.

use super::{
    PipelineError, PipelineResult,
    inspector::{MIME_JSON, MIME_TOML, MIME_YAML, sniff_mime},
    registry::{RegistryResult, Session},
};
use crate::models::{Dataset, FileRecord, NewFile, Stage};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::info;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    #[default]
    Json,
    Yaml,
    Toml,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Yaml => "yaml",
            ExportFormat::Toml => "toml",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DatasetRef {
    pub id: i64,
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TagRef {
    pub id: i64,
    pub name: String,
}

/// One exported file: flattened attributes, owning dataset, tags.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExportRecord {
    pub id: i64,
    pub bucket: String,
    pub prefix: String,
    pub stage: Stage,
    pub filename: String,
    pub content_hash: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub created_at: String,
    pub uri: String,
    pub dataset: DatasetRef,
    #[serde(default)]
    pub tags: Vec<TagRef>,
}

impl ExportRecord {
    fn new(file: &FileRecord, dataset: &Dataset, tags: Vec<TagRef>) -> Self {
        Self {
            id: file.id,
            bucket: file.bucket.clone(),
            prefix: file.prefix.clone(),
            stage: file.stage,
            filename: file.filename.clone(),
            content_hash: file.content_hash.clone(),
            mime_type: file.mime_type.clone(),
            size_bytes: file.size_bytes,
            created_at: file.created_at.format(TIMESTAMP_FORMAT).to_string(),
            uri: file.uri.clone(),
            dataset: DatasetRef {
                id: dataset.id,
                name: dataset.name.clone(),
            },
            tags,
        }
    }

    /// Attributes for registering this record's content again.
    pub fn to_new_file(&self) -> NewFile {
        NewFile {
            bucket: self.bucket.clone(),
            prefix: self.prefix.clone(),
            filename: self.filename.clone(),
            content_hash: self.content_hash.clone(),
            mime_type: self.mime_type.clone(),
            size_bytes: self.size_bytes,
            stage: self.stage,
        }
    }

    pub fn tag_names(&self) -> Vec<String> {
        self.tags.iter().map(|tag| tag.name.clone()).collect()
    }
}

/// Records keyed by content hash.
pub type ExportRecords = BTreeMap<String, ExportRecord>;

/// Resolve datasets and tags for `files` and build their export records.
pub async fn collect_records(
    session: &mut Session,
    files: &[FileRecord],
) -> RegistryResult<ExportRecords> {
    let mut datasets: HashMap<i64, Dataset> = HashMap::new();
    let mut records = ExportRecords::new();
    for file in files {
        if !datasets.contains_key(&file.dataset_id) {
            if let Some(dataset) = session.get_dataset_by_id(file.dataset_id).await? {
                datasets.insert(dataset.id, dataset);
            }
        }
        let Some(dataset) = datasets.get(&file.dataset_id) else {
            continue;
        };
        let tags = session
            .tags_of_file(file.id)
            .await?
            .into_iter()
            .map(|tag| TagRef {
                id: tag.id,
                name: tag.name,
            })
            .collect();
        records.insert(file.content_hash.clone(), ExportRecord::new(file, dataset, tags));
    }
    Ok(records)
}

/// `<directory>/dj_<domain>_<stage>.<ext>`
pub fn export_path(directory: &Path, domain: &str, stage: Stage, format: ExportFormat) -> PathBuf {
    directory.join(format!("dj_{}_{}.{}", domain, stage, format.extension()))
}

pub fn encode(records: &ExportRecords, format: ExportFormat) -> PipelineResult<String> {
    match format {
        ExportFormat::Json => {
            serde_json::to_string_pretty(records).map_err(|err| PipelineError::Export {
                format: "json",
                message: err.to_string(),
            })
        }
        ExportFormat::Yaml => serde_yaml::to_string(records).map_err(|err| PipelineError::Export {
            format: "yaml",
            message: err.to_string(),
        }),
        ExportFormat::Toml => toml::to_string_pretty(records).map_err(|err| PipelineError::Export {
            format: "toml",
            message: err.to_string(),
        }),
    }
}

/// Write `records` to their export path, replacing any previous export.
pub async fn write_export(
    directory: &Path,
    domain: &str,
    stage: Stage,
    format: ExportFormat,
    records: &ExportRecords,
) -> PipelineResult<PathBuf> {
    let body = encode(records, format)?;
    fs::create_dir_all(directory).await?;
    let path = export_path(directory, domain, stage, format);
    fs::write(&path, body).await?;
    info!("exported {} record(s) to {}", records.len(), path.display());
    Ok(path)
}

/// Parse a previous export, detecting JSON, YAML or TOML from the content.
pub fn parse_records(raw: &str) -> PipelineResult<ExportRecords> {
    match sniff_mime(raw.as_bytes(), true) {
        MIME_JSON => serde_json::from_str(raw)
            .map_err(|err| PipelineError::Validation(format!("invalid JSON manifest: {err}"))),
        MIME_YAML => serde_yaml::from_str(raw)
            .map_err(|err| PipelineError::Validation(format!("invalid YAML manifest: {err}"))),
        MIME_TOML => toml::from_str(raw)
            .map_err(|err| PipelineError::Validation(format!("invalid TOML manifest: {err}"))),
        other => Err(PipelineError::Validation(format!(
            "unsupported manifest type `{other}`: expected JSON, YAML or TOML"
        ))),
    }
}
