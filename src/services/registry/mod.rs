//! Relational persistence of datasets, files and tags.
//!
//! Backed by `sqlx::Any` so one code path serves both an embedded SQLite
//! file (`sqlite:` endpoints) and a PostgreSQL server (`postgres:`
//! endpoints). All reads and writes go through a [`Session`], which wraps a
//! single database transaction: dropping a session without committing rolls
//! every enclosed write back.

mod sql;

use crate::models::{
    Dataset, DatasetSummary, FileRecord, PendingFile, Stage, Tag, normalize_domain,
    normalize_tag_name,
};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use sql::{FILE_COLUMNS, SqlBuilder};
use sqlx::{
    Any, AnyConnection, AnyPool, ConnectOptions, Connection, FromRow, Transaction,
    any::{AnyConnectOptions, AnyPoolOptions},
};
use std::{io, path::Path, str::FromStr};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

const SQLITE_SCHEMA: &str = include_str!("../../../migrations/0001_init.sql");
const POSTGRES_SCHEMA: &str = include_str!("../../../migrations/0001_init.postgres.sql");

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("{0}")]
    Validation(String),
    #[error("dataset `{domain}/{name}` already exists")]
    DatasetExists { domain: String, name: String },
    #[error("file already registered at `{uri}`")]
    FileExists {
        uri: String,
        /// Id of the record that holds the conflicting key, when it could be found.
        existing_id: Option<i64>,
    },
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("unsupported registry endpoint `{0}`: expected a sqlite: or postgres: URL")]
    UnsupportedEndpoint(String),
    #[error("malformed registry row: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// The two supported database families.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Sqlite,
    Postgres,
}

impl Backend {
    pub fn from_endpoint(endpoint: &str) -> RegistryResult<Self> {
        match endpoint.split_once(':').map(|(scheme, _)| scheme) {
            Some("sqlite") => Ok(Backend::Sqlite),
            Some("postgres" | "postgresql") => Ok(Backend::Postgres),
            _ => Err(RegistryError::UnsupportedEndpoint(endpoint.to_string())),
        }
    }

    fn schema(&self) -> &'static str {
        match self {
            Backend::Sqlite => SQLITE_SCHEMA,
            Backend::Postgres => POSTGRES_SCHEMA,
        }
    }
}

/// Connection settings for the registry database.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    pub endpoint: String,
    pub pool_size: u32,
    pub max_overflow: u32,
    /// Log every SQL statement at debug level.
    pub echo: bool,
}

impl RegistryConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            pool_size: 5,
            max_overflow: 10,
            echo: false,
        }
    }

    fn max_connections(&self) -> u32 {
        (self.pool_size + self.max_overflow).max(1)
    }
}

/// Lookup modes for [`Session::get_file`].
#[derive(Clone, Debug, PartialEq)]
pub enum FileLookup {
    Id(i64),
    Hash(String),
    Name {
        filename: String,
        dataset: String,
        domain: String,
    },
}

impl FileLookup {
    /// Build a lookup from optional parts; exactly one mode must be given.
    pub fn from_parts(
        id: Option<i64>,
        hash: Option<String>,
        name: Option<(String, String, String)>,
    ) -> RegistryResult<Self> {
        match (id, hash, name) {
            (Some(id), None, None) => Ok(FileLookup::Id(id)),
            (None, Some(hash), None) => Ok(FileLookup::Hash(hash)),
            (None, None, Some((filename, dataset, domain))) => Ok(FileLookup::Name {
                filename,
                dataset,
                domain,
            }),
            (None, None, None) => Err(RegistryError::InvalidQuery(
                "no file lookup given: use an id, a content hash, or filename with dataset and domain"
                    .into(),
            )),
            _ => Err(RegistryError::InvalidQuery(
                "ambiguous file lookup: give exactly one of id, content hash, or filename".into(),
            )),
        }
    }
}

/// Filters for [`Session::query_files`].
#[derive(Clone, Debug, PartialEq)]
pub struct FileQuery {
    pub domain: String,
    pub stage: Stage,
    /// Exact dataset name.
    pub dataset: Option<String>,
    /// Substring of the MIME type.
    pub mime: Option<String>,
    /// Files carrying any of these tags.
    pub tags: Vec<String>,
    pub filenames: Vec<String>,
    pub hashes: Vec<String>,
    pub limit: Option<i64>,
}

impl FileQuery {
    pub fn new(domain: &str, stage: Stage) -> Self {
        Self {
            domain: normalize_domain(domain),
            stage,
            dataset: None,
            mime: None,
            tags: Vec::new(),
            filenames: Vec::new(),
            hashes: Vec::new(),
            limit: None,
        }
    }
}

#[derive(FromRow)]
struct DatasetRow {
    id: i64,
    domain: String,
    name: String,
    description: Option<String>,
    created_at: String,
}

impl TryFrom<DatasetRow> for Dataset {
    type Error = RegistryError;

    fn try_from(row: DatasetRow) -> RegistryResult<Self> {
        Ok(Dataset {
            id: row.id,
            domain: row.domain,
            name: row.name,
            description: row.description,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

#[derive(FromRow)]
struct SummaryRow {
    id: i64,
    domain: String,
    name: String,
    description: Option<String>,
    created_at: String,
    total_files: i64,
}

impl TryFrom<SummaryRow> for DatasetSummary {
    type Error = RegistryError;

    fn try_from(row: SummaryRow) -> RegistryResult<Self> {
        Ok(DatasetSummary {
            dataset: Dataset {
                id: row.id,
                domain: row.domain,
                name: row.name,
                description: row.description,
                created_at: parse_timestamp(&row.created_at)?,
            },
            total_files: row.total_files,
        })
    }
}

#[derive(FromRow)]
struct TagRow {
    id: i64,
    name: String,
    description: Option<String>,
    created_at: String,
}

impl TryFrom<TagRow> for Tag {
    type Error = RegistryError;

    fn try_from(row: TagRow) -> RegistryResult<Self> {
        Ok(Tag {
            id: row.id,
            name: row.name,
            description: row.description,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

#[derive(FromRow)]
struct FileRow {
    id: i64,
    dataset_id: i64,
    bucket: String,
    prefix: String,
    stage: String,
    filename: String,
    content_hash: String,
    mime_type: String,
    size_bytes: i64,
    uri: String,
    created_at: String,
}

impl TryFrom<FileRow> for FileRecord {
    type Error = RegistryError;

    fn try_from(row: FileRow) -> RegistryResult<Self> {
        let stage = Stage::from_str(&row.stage)
            .map_err(|err| RegistryError::Corrupt(format!("file {}: {err}", row.id)))?;
        Ok(FileRecord {
            id: row.id,
            dataset_id: row.dataset_id,
            bucket: row.bucket,
            prefix: row.prefix,
            stage,
            filename: row.filename,
            content_hash: row.content_hash,
            mime_type: row.mime_type,
            size_bytes: row.size_bytes,
            uri: row.uri,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

/// Connection pool to the registry database.
#[derive(Clone)]
pub struct Registry {
    pool: AnyPool,
    backend: Backend,
}

impl Registry {
    /// Connect to `config.endpoint` and make sure the schema exists.
    pub async fn connect(config: &RegistryConfig) -> RegistryResult<Self> {
        sqlx::any::install_default_drivers();
        let backend = Backend::from_endpoint(&config.endpoint)?;
        if backend == Backend::Sqlite {
            prepare_sqlite_file(&config.endpoint).await?;
        }

        let mut options = AnyConnectOptions::from_str(&config.endpoint)?;
        if !config.echo {
            options = options.disable_statement_logging();
        }

        let pool = AnyPoolOptions::new()
            .max_connections(config.max_connections())
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if backend == Backend::Sqlite {
                        sqlx::query("PRAGMA foreign_keys = ON").execute(conn).await?;
                    }
                    Ok(())
                })
            })
            .connect_with(options)
            .await?;

        let registry = Self { pool, backend };
        registry.run_migrations().await?;
        debug!("connected to {:?} registry", backend);
        Ok(registry)
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Open a transaction scope. Nothing it writes is visible to other
    /// sessions until [`Session::commit`].
    pub async fn begin(&self) -> RegistryResult<Session> {
        Ok(Session {
            tx: self.pool.begin().await?,
            backend: self.backend,
        })
    }

    /// Run `f` inside one transaction: commit when it returns `Ok`, roll
    /// back when it returns `Err`.
    pub async fn with_transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: for<'s> FnOnce(&'s mut Session) -> BoxFuture<'s, Result<T, E>>,
        E: From<RegistryError>,
    {
        let mut session = self.begin().await?;
        match f(&mut session).await {
            Ok(value) => {
                session.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = session.rollback().await {
                    warn!("rollback failed: {}", rollback);
                }
                Err(err)
            }
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Create tables and indexes from the embedded schema.
    async fn run_migrations(&self) -> RegistryResult<()> {
        let statements = self
            .backend
            .schema()
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("running {} schema statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }
}

/// Make sure the SQLite database file and its directory exist.
async fn prepare_sqlite_file(endpoint: &str) -> RegistryResult<()> {
    let path = endpoint
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:");
    let path = path.split('?').next().unwrap_or_default();
    if path.is_empty() || path.contains(":memory:") {
        return Ok(());
    }

    let path = Path::new(path);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    Ok(())
}

/// One transaction against the registry.
///
/// Nesting is not supported: each session owns exactly one transaction.
/// Operations that may hit a uniqueness constraint run inside a savepoint so
/// the conflict does not poison the rest of the transaction.
pub struct Session {
    tx: Transaction<'static, Any>,
    backend: Backend,
}

impl Session {
    pub async fn commit(self) -> RegistryResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> RegistryResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }

    pub async fn get_dataset(&mut self, domain: &str, name: &str) -> RegistryResult<Option<Dataset>> {
        let domain = domain_key(domain)?;
        fetch_dataset(&mut self.tx, &domain, name).await
    }

    pub async fn get_dataset_by_id(&mut self, id: i64) -> RegistryResult<Option<Dataset>> {
        sqlx::query_as::<Any, DatasetRow>(
            "SELECT id, domain, name, description, created_at FROM datasets WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?
        .map(Dataset::try_from)
        .transpose()
    }

    /// Insert a dataset; an existing `(domain, name)` is a constraint violation.
    pub async fn create_dataset(
        &mut self,
        domain: &str,
        name: &str,
        description: Option<&str>,
    ) -> RegistryResult<Dataset> {
        let domain = domain_key(domain)?;
        validate_name("dataset", name)?;

        let mut savepoint = Connection::begin(&mut *self.tx).await?;
        let inserted = sqlx::query_scalar::<Any, i64>(
            "INSERT INTO datasets (domain, name, description, created_at)
             VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(domain.as_str())
        .bind(name)
        .bind(description)
        .bind(timestamp(Utc::now()))
        .fetch_one(&mut *savepoint)
        .await;

        let id = match inserted {
            Ok(id) => id,
            Err(err) if is_unique_violation(&err) => {
                savepoint.rollback().await?;
                return Err(RegistryError::ConstraintViolation(format!(
                    "dataset `{domain}/{name}` already exists"
                )));
            }
            Err(err) => return Err(err.into()),
        };
        savepoint.commit().await?;

        info!("created dataset {}/{} (id {})", domain, name, id);
        self.get_dataset_by_id(id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("dataset {id}")))
    }

    /// Get-or-create. An existing dataset is an error unless `exists_ok`.
    pub async fn ensure_dataset(
        &mut self,
        domain: &str,
        name: &str,
        description: Option<&str>,
        exists_ok: bool,
    ) -> RegistryResult<Dataset> {
        match self.get_dataset(domain, name).await? {
            Some(dataset) if exists_ok => {
                debug!("using existing dataset {}/{}", dataset.domain, dataset.name);
                Ok(dataset)
            }
            Some(dataset) => Err(RegistryError::DatasetExists {
                domain: dataset.domain,
                name: dataset.name,
            }),
            None => self.create_dataset(domain, name, description).await,
        }
    }

    /// Delete a dataset together with its files and their tag links.
    pub async fn delete_dataset(&mut self, domain: &str, name: &str) -> RegistryResult<()> {
        let domain = domain_key(domain)?;
        let result = sqlx::query("DELETE FROM datasets WHERE domain = $1 AND name = $2")
            .bind(domain.as_str())
            .bind(name)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(format!("dataset `{domain}/{name}`")));
        }
        info!("deleted dataset {}/{}", domain, name);
        Ok(())
    }

    /// Datasets of `domain` with their file counts, ordered by name.
    pub async fn list_datasets(
        &mut self,
        domain: &str,
        name_pattern: Option<&str>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> RegistryResult<Vec<DatasetSummary>> {
        let domain = domain_key(domain)?;
        let mut builder = SqlBuilder::new(
            "SELECT d.id, d.domain, d.name, d.description, d.created_at, \
             (SELECT COUNT(*) FROM files f WHERE f.dataset_id = d.id) AS total_files \
             FROM datasets d WHERE d.domain = ",
        );
        builder.push_bind(domain);
        if let Some(pattern) = name_pattern.filter(|p| !p.is_empty()) {
            sql::push_contains(&mut builder, "d.name", pattern);
        }
        builder.push(" ORDER BY d.name");
        sql::push_page(&mut builder, self.backend, limit, offset);

        builder
            .query_as::<SummaryRow>()
            .fetch_all(&mut *self.tx)
            .await?
            .into_iter()
            .map(DatasetSummary::try_from)
            .collect()
    }

    pub async fn get_file(&mut self, lookup: &FileLookup) -> RegistryResult<Option<FileRecord>> {
        let mut builder = SqlBuilder::new(&format!("SELECT {FILE_COLUMNS} FROM files f"));
        match lookup {
            FileLookup::Id(id) => {
                builder.push(" WHERE f.id = ").push_bind(*id);
            }
            FileLookup::Hash(hash) => {
                builder.push(" WHERE f.content_hash = ").push_bind(hash.as_str());
            }
            FileLookup::Name {
                filename,
                dataset,
                domain,
            } => {
                builder
                    .push(" JOIN datasets d ON d.id = f.dataset_id WHERE f.filename = ")
                    .push_bind(filename.as_str())
                    .push(" AND d.name = ")
                    .push_bind(dataset.as_str())
                    .push(" AND d.domain = ")
                    .push_bind(normalize_domain(domain));
            }
        }
        builder.push(" ORDER BY f.id LIMIT 1");

        builder
            .query_as::<FileRow>()
            .fetch_optional(&mut *self.tx)
            .await?
            .map(FileRecord::try_from)
            .transpose()
    }

    pub async fn files_of_dataset(&mut self, dataset_id: i64) -> RegistryResult<Vec<FileRecord>> {
        let mut builder = SqlBuilder::new(&format!(
            "SELECT {FILE_COLUMNS} FROM files f WHERE f.dataset_id = "
        ));
        builder.push_bind(dataset_id).push(" ORDER BY f.id");
        builder
            .query_as::<FileRow>()
            .fetch_all(&mut *self.tx)
            .await?
            .into_iter()
            .map(FileRecord::try_from)
            .collect()
    }

    /// Register a file and attach `tags` (created on first use).
    ///
    /// The URI stored is the one `pending` resolved at construction. A
    /// conflict on the per-dataset unique key or on the URI yields
    /// [`RegistryError::FileExists`] and leaves the session usable.
    pub async fn add_file(
        &mut self,
        pending: PendingFile,
        tags: &[String],
    ) -> RegistryResult<FileRecord> {
        let file = pending.file();
        let mut savepoint = Connection::begin(&mut *self.tx).await?;
        let inserted = sqlx::query_scalar::<Any, i64>(
            "INSERT INTO files (dataset_id, bucket, prefix, stage, filename, content_hash,
                                mime_type, size_bytes, uri, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING id",
        )
        .bind(pending.dataset_id())
        .bind(file.bucket.as_str())
        .bind(file.prefix.as_str())
        .bind(file.stage.as_str())
        .bind(file.filename.as_str())
        .bind(file.content_hash.as_str())
        .bind(file.mime_type.as_str())
        .bind(file.size_bytes)
        .bind(pending.uri())
        .bind(timestamp(Utc::now()))
        .fetch_one(&mut *savepoint)
        .await;

        let id = match inserted {
            Ok(id) => id,
            Err(err) if is_unique_violation(&err) => {
                savepoint.rollback().await?;
                let existing_id = self.conflicting_file_id(&pending).await?;
                return Err(RegistryError::FileExists {
                    uri: pending.uri().to_string(),
                    existing_id,
                });
            }
            Err(err) => return Err(err.into()),
        };

        for name in normalized_tags(tags)? {
            let tag = upsert_tag(&mut savepoint, &name).await?;
            link_tag(&mut savepoint, id, tag.id).await?;
        }
        let record = fetch_file(&mut savepoint, id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("file {id}")))?;
        savepoint.commit().await?;

        debug!("registered file {} at {}", record.id, record.uri);
        Ok(record)
    }

    async fn conflicting_file_id(&mut self, pending: &PendingFile) -> RegistryResult<Option<i64>> {
        let file = pending.file();
        let id = sqlx::query_scalar::<Any, i64>(
            "SELECT id FROM files
             WHERE (dataset_id = $1 AND bucket = $2 AND prefix = $3 AND stage = $4
                    AND content_hash = $5)
                OR uri = $6
             ORDER BY id LIMIT 1",
        )
        .bind(pending.dataset_id())
        .bind(file.bucket.as_str())
        .bind(file.prefix.as_str())
        .bind(file.stage.as_str())
        .bind(file.content_hash.as_str())
        .bind(pending.uri())
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(id)
    }

    /// Get-or-create a tag by its normalized name.
    pub async fn add_tag(&mut self, name: &str) -> RegistryResult<Tag> {
        let name = normalize_tag_name(name);
        if name.is_empty() {
            return Err(RegistryError::Validation("tag name must not be empty".into()));
        }
        upsert_tag(&mut self.tx, &name).await
    }

    pub async fn get_tag(&mut self, name: &str) -> RegistryResult<Option<Tag>> {
        fetch_tag(&mut self.tx, &normalize_tag_name(name)).await
    }

    /// Attach tags to a file. Already-attached tags are left as they are.
    pub async fn tag_file(&mut self, file_id: i64, tags: &[String]) -> RegistryResult<FileRecord> {
        let file = fetch_file(&mut self.tx, file_id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("file {file_id}")))?;
        for name in normalized_tags(tags)? {
            let tag = upsert_tag(&mut self.tx, &name).await?;
            link_tag(&mut self.tx, file.id, tag.id).await?;
        }
        Ok(file)
    }

    pub async fn tags_of_file(&mut self, file_id: i64) -> RegistryResult<Vec<Tag>> {
        sqlx::query_as::<Any, TagRow>(
            "SELECT t.id, t.name, t.description, t.created_at
             FROM tags t JOIN file_tags ft ON ft.tag_id = t.id
             WHERE ft.file_id = $1 ORDER BY t.name",
        )
        .bind(file_id)
        .fetch_all(&mut *self.tx)
        .await?
        .into_iter()
        .map(Tag::try_from)
        .collect()
    }

    /// Files of one domain and stage, narrowed by the optional filters.
    pub async fn query_files(&mut self, query: &FileQuery) -> RegistryResult<Vec<FileRecord>> {
        let builder = sql::file_query(self.backend, query);
        debug!("file query: {}", builder.sql());
        builder
            .query_as::<FileRow>()
            .fetch_all(&mut *self.tx)
            .await?
            .into_iter()
            .map(FileRecord::try_from)
            .collect()
    }
}

async fn fetch_dataset(
    conn: &mut AnyConnection,
    domain: &str,
    name: &str,
) -> RegistryResult<Option<Dataset>> {
    sqlx::query_as::<Any, DatasetRow>(
        "SELECT id, domain, name, description, created_at
         FROM datasets WHERE domain = $1 AND name = $2",
    )
    .bind(domain)
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?
    .map(Dataset::try_from)
    .transpose()
}

async fn fetch_file(conn: &mut AnyConnection, id: i64) -> RegistryResult<Option<FileRecord>> {
    let mut builder = SqlBuilder::new(&format!("SELECT {FILE_COLUMNS} FROM files f WHERE f.id = "));
    builder.push_bind(id);
    builder
        .query_as::<FileRow>()
        .fetch_optional(&mut *conn)
        .await?
        .map(FileRecord::try_from)
        .transpose()
}

async fn fetch_tag(conn: &mut AnyConnection, name: &str) -> RegistryResult<Option<Tag>> {
    sqlx::query_as::<Any, TagRow>(
        "SELECT id, name, description, created_at FROM tags WHERE name = $1",
    )
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?
    .map(Tag::try_from)
    .transpose()
}

/// `name` must already be normalized.
async fn upsert_tag(conn: &mut AnyConnection, name: &str) -> RegistryResult<Tag> {
    sqlx::query(
        "INSERT INTO tags (name, created_at) VALUES ($1, $2) ON CONFLICT (name) DO NOTHING",
    )
    .bind(name)
    .bind(timestamp(Utc::now()))
    .execute(&mut *conn)
    .await?;
    fetch_tag(conn, name)
        .await?
        .ok_or_else(|| RegistryError::NotFound(format!("tag `{name}`")))
}

async fn link_tag(conn: &mut AnyConnection, file_id: i64, tag_id: i64) -> RegistryResult<()> {
    sqlx::query("INSERT INTO file_tags (file_id, tag_id) VALUES ($1, $2) ON CONFLICT DO NOTHING")
        .bind(file_id)
        .bind(tag_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn normalized_tags(tags: &[String]) -> RegistryResult<Vec<String>> {
    let mut names: Vec<String> = tags.iter().map(|tag| normalize_tag_name(tag)).collect();
    if names.iter().any(String::is_empty) {
        return Err(RegistryError::Validation("tag name must not be empty".into()));
    }
    names.sort();
    names.dedup();
    Ok(names)
}

/// Normalized domain, rejecting raw input that contains a `/`.
fn domain_key(raw: &str) -> RegistryResult<String> {
    if raw.contains('/') {
        return Err(RegistryError::Validation(format!(
            "domain `{raw}` must not contain `/`"
        )));
    }
    Ok(normalize_domain(raw))
}

fn validate_name(kind: &str, value: &str) -> RegistryResult<()> {
    if value.trim().is_empty() {
        return Err(RegistryError::Validation(format!("{kind} name must not be empty")));
    }
    if value.contains('/') {
        return Err(RegistryError::Validation(format!(
            "{kind} name `{value}` must not contain `/`"
        )));
    }
    Ok(())
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> RegistryResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| RegistryError::Corrupt(format!("timestamp `{raw}`: {err}")))
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewFile;

    async fn registry() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = format!("sqlite://{}", dir.path().join("db/registry.db").display());
        let registry = Registry::connect(&RegistryConfig::new(endpoint)).await.unwrap();
        (dir, registry)
    }

    fn new_file(hash: &str) -> NewFile {
        NewFile {
            bucket: "lake".into(),
            prefix: "dj".into(),
            filename: format!("{hash}.png"),
            content_hash: hash.into(),
            mime_type: "image/png".into(),
            size_bytes: 3,
            stage: Stage::Raw,
        }
    }

    fn tags(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[tokio::test]
    async fn tagging_is_idempotent_across_case_and_whitespace() {
        let (_dir, registry) = registry().await;
        let mut session = registry.begin().await.unwrap();
        let dataset = session.create_dataset("vision", "street", None).await.unwrap();
        let file = session
            .add_file(PendingFile::new("s3", &dataset, new_file("aa")), &tags(&["Night"]))
            .await
            .unwrap();

        session.tag_file(file.id, &tags(&[" night ", "NIGHT"])).await.unwrap();
        session.tag_file(file.id, &tags(&["night"])).await.unwrap();

        let attached = session.tags_of_file(file.id).await.unwrap();
        assert_eq!(attached.len(), 1);
        assert_eq!(attached[0].name, "night");
        session.commit().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_file_is_rejected_and_original_kept() {
        let (_dir, registry) = registry().await;
        let mut session = registry.begin().await.unwrap();
        let dataset = session.create_dataset("vision", "street", None).await.unwrap();
        let first = session
            .add_file(PendingFile::new("s3", &dataset, new_file("aa")), &[])
            .await
            .unwrap();
        session.commit().await.unwrap();

        let mut session = registry.begin().await.unwrap();
        let mut again = new_file("aa");
        again.filename = "renamed.png".into();
        let err = session
            .add_file(PendingFile::new("s3", &dataset, again), &[])
            .await
            .unwrap_err();
        match err {
            RegistryError::FileExists { existing_id, .. } => assert_eq!(existing_id, Some(first.id)),
            other => panic!("unexpected error: {other}"),
        }

        // The session survives the conflict.
        let stored = session.get_file(&FileLookup::Id(first.id)).await.unwrap();
        assert_eq!(stored, Some(first));
        session.commit().await.unwrap();
    }

    #[tokio::test]
    async fn ensure_dataset_is_get_or_create() {
        let (_dir, registry) = registry().await;
        let mut session = registry.begin().await.unwrap();
        let first = session
            .ensure_dataset("Vision", "street", Some("street scenes"), true)
            .await
            .unwrap();
        let second = session.ensure_dataset("vision", "street", None, true).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.description.as_deref(), Some("street scenes"));

        let all = session.list_datasets("vision", None, None, None).await.unwrap();
        assert_eq!(all.len(), 1);

        let err = session
            .ensure_dataset("vision", "street", None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DatasetExists { .. }));
    }

    #[tokio::test]
    async fn create_dataset_conflict_keeps_session_usable() {
        let (_dir, registry) = registry().await;
        let mut session = registry.begin().await.unwrap();
        session.create_dataset("vision", "street", None).await.unwrap();
        let err = session.create_dataset("vision", "street", None).await.unwrap_err();
        assert!(matches!(err, RegistryError::ConstraintViolation(_)));

        session.create_dataset("vision", "highway", None).await.unwrap();
        session.commit().await.unwrap();

        let mut session = registry.begin().await.unwrap();
        let names: Vec<String> = session
            .list_datasets("vision", None, None, None)
            .await
            .unwrap()
            .into_iter()
            .map(|summary| summary.dataset.name)
            .collect();
        assert_eq!(names, vec!["highway".to_string(), "street".to_string()]);
    }

    #[tokio::test]
    async fn tag_filter_uses_union_semantics() {
        let (_dir, registry) = registry().await;
        let mut session = registry.begin().await.unwrap();
        let dataset = session.create_dataset("vision", "street", None).await.unwrap();
        let only_a = session
            .add_file(PendingFile::new("s3", &dataset, new_file("01")), &tags(&["a"]))
            .await
            .unwrap();
        session
            .add_file(PendingFile::new("s3", &dataset, new_file("02")), &tags(&["b"]))
            .await
            .unwrap();
        let both = session
            .add_file(PendingFile::new("s3", &dataset, new_file("03")), &tags(&["a", "b"]))
            .await
            .unwrap();

        let mut query = FileQuery::new("vision", Stage::Raw);
        query.tags = tags(&["A"]);
        let ids: Vec<i64> = session
            .query_files(&query)
            .await
            .unwrap()
            .iter()
            .map(|file| file.id)
            .collect();
        assert_eq!(ids, vec![only_a.id, both.id]);

        query.tags.clear();
        query.limit = Some(2);
        assert_eq!(session.query_files(&query).await.unwrap().len(), 2);

        query.limit = None;
        query.stage = Stage::Published;
        assert!(session.query_files(&query).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn query_narrows_by_dataset_mime_filename_and_hash() {
        let (_dir, registry) = registry().await;
        let mut session = registry.begin().await.unwrap();
        let street = session.create_dataset("vision", "street", None).await.unwrap();
        let highway = session.create_dataset("vision", "highway", None).await.unwrap();
        let mut csv = new_file("0c");
        csv.mime_type = "text/csv".into();
        csv.filename = "table.csv".into();
        let table = session
            .add_file(PendingFile::new("s3", &street, csv), &[])
            .await
            .unwrap();
        session
            .add_file(PendingFile::new("s3", &street, new_file("0d")), &[])
            .await
            .unwrap();
        session
            .add_file(PendingFile::new("s3", &highway, new_file("0e")), &[])
            .await
            .unwrap();

        let mut query = FileQuery::new("vision", Stage::Raw);
        query.dataset = Some("street".into());
        assert_eq!(session.query_files(&query).await.unwrap().len(), 2);

        query.mime = Some("csv".into());
        assert_eq!(session.query_files(&query).await.unwrap(), vec![table.clone()]);

        let mut query = FileQuery::new("vision", Stage::Raw);
        query.filenames = vec!["table.csv".into()];
        assert_eq!(session.query_files(&query).await.unwrap(), vec![table]);

        let mut query = FileQuery::new("vision", Stage::Raw);
        query.hashes = vec!["0d".into(), "0e".into()];
        assert_eq!(session.query_files(&query).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_transaction_leaves_no_partial_state() {
        let (_dir, registry) = registry().await;
        let result: Result<(), RegistryError> = registry
            .with_transaction(|session| {
                Box::pin(async move {
                    let dataset = session.create_dataset("vision", "street", None).await?;
                    session
                        .add_file(PendingFile::new("s3", &dataset, new_file("aa")), &[])
                        .await?;
                    Err::<(), _>(RegistryError::Validation("simulated failure".into()))
                })
            })
            .await;
        assert!(result.is_err());

        let mut session = registry.begin().await.unwrap();
        assert_eq!(session.get_dataset("vision", "street").await.unwrap(), None);
        assert_eq!(
            session.get_file(&FileLookup::Hash("aa".into())).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn with_transaction_commits_on_success() {
        let (_dir, registry) = registry().await;
        let id = registry
            .with_transaction(|session| {
                Box::pin(async move {
                    let dataset = session.create_dataset("vision", "street", None).await?;
                    Ok::<_, RegistryError>(dataset.id)
                })
            })
            .await
            .unwrap();

        let mut session = registry.begin().await.unwrap();
        let dataset = session.get_dataset_by_id(id).await.unwrap().unwrap();
        assert_eq!(dataset.name, "street");
    }

    #[tokio::test]
    async fn dropped_session_rolls_back() {
        let (_dir, registry) = registry().await;
        {
            let mut session = registry.begin().await.unwrap();
            session.create_dataset("vision", "street", None).await.unwrap();
        }
        let mut session = registry.begin().await.unwrap();
        assert_eq!(session.get_dataset("vision", "street").await.unwrap(), None);
    }

    #[tokio::test]
    async fn deleting_dataset_cascades_to_files() {
        let (_dir, registry) = registry().await;
        let mut session = registry.begin().await.unwrap();
        let dataset = session.create_dataset("vision", "street", None).await.unwrap();
        let file = session
            .add_file(PendingFile::new("s3", &dataset, new_file("aa")), &tags(&["keep"]))
            .await
            .unwrap();
        session.commit().await.unwrap();

        let mut session = registry.begin().await.unwrap();
        session.delete_dataset("vision", "street").await.unwrap();
        assert_eq!(session.get_file(&FileLookup::Id(file.id)).await.unwrap(), None);
        assert!(session.tags_of_file(file.id).await.unwrap().is_empty());
        assert!(session.get_tag("keep").await.unwrap().is_some());

        let err = session.delete_dataset("vision", "street").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_datasets_counts_filters_and_pages() {
        let (_dir, registry) = registry().await;
        let mut session = registry.begin().await.unwrap();
        let alpha = session.create_dataset("vision", "alpha", None).await.unwrap();
        session.create_dataset("vision", "beta", None).await.unwrap();
        session.create_dataset("vision", "gamma", None).await.unwrap();
        session.create_dataset("audio", "alphabet", None).await.unwrap();
        for hash in ["01", "02"] {
            session
                .add_file(PendingFile::new("s3", &alpha, new_file(hash)), &[])
                .await
                .unwrap();
        }

        let all = session.list_datasets("vision", None, None, None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].dataset.name, "alpha");
        assert_eq!(all[0].total_files, 2);
        assert_eq!(all[1].total_files, 0);

        let matching = session.list_datasets("vision", Some("alp"), None, None).await.unwrap();
        assert_eq!(matching.len(), 1);

        let page = session.list_datasets("vision", None, Some(1), Some(1)).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].dataset.name, "beta");

        let rest = session.list_datasets("vision", None, None, Some(2)).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].dataset.name, "gamma");
    }

    #[tokio::test]
    async fn substring_filters_are_literal_and_ignore_case() {
        let (_dir, registry) = registry().await;
        let mut session = registry.begin().await.unwrap();
        let street = session.create_dataset("vision", "Street", None).await.unwrap();
        session.create_dataset("vision", "night_50%", None).await.unwrap();
        session
            .add_file(PendingFile::new("s3", &street, new_file("aa")), &[])
            .await
            .unwrap();

        let names = |summaries: Vec<DatasetSummary>| -> Vec<String> {
            summaries.into_iter().map(|s| s.dataset.name).collect()
        };
        let wildcard = session.list_datasets("vision", Some("s%t"), None, None).await.unwrap();
        assert!(wildcard.is_empty());
        let single = session.list_datasets("vision", Some("n_ght"), None, None).await.unwrap();
        assert!(single.is_empty());
        let literal = session.list_datasets("vision", Some("T_50%"), None, None).await.unwrap();
        assert_eq!(names(literal), vec!["night_50%".to_string()]);
        let folded = session.list_datasets("vision", Some("TRE"), None, None).await.unwrap();
        assert_eq!(names(folded), vec!["Street".to_string()]);

        let mut query = FileQuery::new("vision", Stage::Raw);
        query.mime = Some("image_png".into());
        assert!(session.query_files(&query).await.unwrap().is_empty());
        query.mime = Some("IMAGE/".into());
        assert_eq!(session.query_files(&query).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_lookup_modes() {
        let (_dir, registry) = registry().await;
        let mut session = registry.begin().await.unwrap();
        let dataset = session.create_dataset("vision", "street", None).await.unwrap();
        let file = session
            .add_file(PendingFile::new("s3", &dataset, new_file("ab")), &[])
            .await
            .unwrap();

        let by_hash = FileLookup::from_parts(None, Some("ab".into()), None).unwrap();
        assert_eq!(session.get_file(&by_hash).await.unwrap(), Some(file.clone()));

        let by_name = FileLookup::from_parts(
            None,
            None,
            Some(("ab.png".into(), "street".into(), "Vision".into())),
        )
        .unwrap();
        assert_eq!(session.get_file(&by_name).await.unwrap(), Some(file.clone()));
        assert_eq!(session.files_of_dataset(dataset.id).await.unwrap(), vec![file]);

        assert!(matches!(
            FileLookup::from_parts(None, None, None),
            Err(RegistryError::InvalidQuery(_))
        ));
        assert!(matches!(
            FileLookup::from_parts(Some(1), Some("ab".into()), None),
            Err(RegistryError::InvalidQuery(_))
        ));
    }

    #[tokio::test]
    async fn tagging_unknown_file_is_not_found() {
        let (_dir, registry) = registry().await;
        let mut session = registry.begin().await.unwrap();
        let err = session.tag_file(42, &tags(&["a"])).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn names_with_slashes_are_rejected() {
        let (_dir, registry) = registry().await;
        let mut session = registry.begin().await.unwrap();
        assert!(matches!(
            session.create_dataset("vision", "a/b", None).await,
            Err(RegistryError::Validation(_))
        ));
        assert!(matches!(
            session.create_dataset("vi/sion", "ab", None).await,
            Err(RegistryError::Validation(_))
        ));
    }

    #[test]
    fn endpoint_selects_backend() {
        assert_eq!(Backend::from_endpoint("sqlite://x.db").unwrap(), Backend::Sqlite);
        assert_eq!(
            Backend::from_endpoint("postgresql://u@h/db").unwrap(),
            Backend::Postgres
        );
        assert!(matches!(
            Backend::from_endpoint("mysql://u@h/db"),
            Err(RegistryError::UnsupportedEndpoint(_))
        ));
    }
}
