use crate::{
    models::Stage,
    services::{blob_store::StorageScheme, export::ExportFormat, registry::RegistryConfig},
};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
};

const ENV_PREFIX: &str = "DJ_";
const DEFAULT_PREFIX: &str = "dj";

/// Centralized application configuration.
/// Combines CLI arguments, environment variables and the settings file.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bucket: String,
    pub prefix: String,
    pub storage_scheme: StorageScheme,
    pub storage_root: PathBuf,
    pub storage_endpoint: Option<String>,
    pub registry: RegistryConfig,
    pub settings_path: PathBuf,
    pub verbose: bool,
}

/// Persisted settings; every field is optional so layers can be merged.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub bucket: Option<String>,
    pub prefix: Option<String>,
    pub storage_scheme: Option<String>,
    pub storage_root: Option<PathBuf>,
    pub storage_endpoint: Option<String>,
    pub registry_endpoint: Option<String>,
    pub pool_size: Option<u32>,
    pub max_overflow: Option<u32>,
    pub echo: Option<bool>,
}

impl Settings {
    /// Read a settings file; a missing file yields empty settings.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(raw) => toml::from_str(&raw)
                .with_context(|| format!("parsing settings file {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => {
                Err(err).with_context(|| format!("reading settings file {}", path.display()))
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating settings directory {}", parent.display()))?;
        }
        let body = toml::to_string_pretty(self).context("encoding settings")?;
        fs::write(path, body).with_context(|| format!("writing settings file {}", path.display()))
    }

    /// Settings from `DJ_*` variables, looked up through `var`.
    pub fn from_env_with(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| var(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.is_empty());
        let parse_u32 = |name: &str| -> Result<Option<u32>> {
            get(name)
                .map(|value| {
                    value
                        .parse::<u32>()
                        .with_context(|| format!("parsing {ENV_PREFIX}{name} value `{value}`"))
                })
                .transpose()
        };
        let echo = get("ECHO")
            .map(|value| match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => anyhow::bail!("parsing {ENV_PREFIX}ECHO value `{value}`"),
            })
            .transpose()?;

        Ok(Self {
            bucket: get("BUCKET"),
            prefix: get("PREFIX"),
            storage_scheme: get("STORAGE_SCHEME"),
            storage_root: get("STORAGE_ROOT").map(PathBuf::from),
            storage_endpoint: get("STORAGE_ENDPOINT"),
            registry_endpoint: get("REGISTRY_ENDPOINT"),
            pool_size: parse_u32("POOL_SIZE")?,
            max_overflow: parse_u32("MAX_OVERFLOW")?,
            echo,
        })
    }

    /// Field-wise: keep `self` where set, otherwise take `fallback`.
    pub fn or(self, fallback: Settings) -> Settings {
        Settings {
            bucket: self.bucket.or(fallback.bucket),
            prefix: self.prefix.or(fallback.prefix),
            storage_scheme: self.storage_scheme.or(fallback.storage_scheme),
            storage_root: self.storage_root.or(fallback.storage_root),
            storage_endpoint: self.storage_endpoint.or(fallback.storage_endpoint),
            registry_endpoint: self.registry_endpoint.or(fallback.registry_endpoint),
            pool_size: self.pool_size.or(fallback.pool_size),
            max_overflow: self.max_overflow.or(fallback.max_overflow),
            echo: self.echo.or(fallback.echo),
        }
    }
}

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "dj",
    author,
    version,
    about = "Dataset journal: catalog files into datasets, store and retrieve them"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Settings file (overrides DJ_CONFIG, default ~/.dj/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug-level logging unless RUST_LOG is set
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Storage bucket (overrides DJ_BUCKET)
    #[arg(long, global = true)]
    pub bucket: Option<String>,

    /// Key prefix inside the bucket (overrides DJ_PREFIX)
    #[arg(long, global = true)]
    pub prefix: Option<String>,

    /// Registry database URL, sqlite: or postgres: (overrides DJ_REGISTRY_ENDPOINT)
    #[arg(long, global = true)]
    pub registry_endpoint: Option<String>,

    /// Storage backend: s3, file or memory (overrides DJ_STORAGE_SCHEME)
    #[arg(long, global = true)]
    pub storage_scheme: Option<String>,

    /// Root directory of the file backend (overrides DJ_STORAGE_ROOT)
    #[arg(long, global = true)]
    pub storage_root: Option<PathBuf>,

    /// S3-compatible endpoint URL (overrides DJ_STORAGE_ENDPOINT)
    #[arg(long, global = true)]
    pub storage_endpoint: Option<String>,

    /// Registry connection pool size (overrides DJ_POOL_SIZE)
    #[arg(long, global = true)]
    pub pool_size: Option<u32>,

    /// Extra connections allowed beyond the pool size (overrides DJ_MAX_OVERFLOW)
    #[arg(long, global = true)]
    pub max_overflow: Option<u32>,

    /// Log SQL statements
    #[arg(long, global = true)]
    pub echo: bool,
}

impl GlobalArgs {
    fn settings(&self) -> Settings {
        Settings {
            bucket: self.bucket.clone(),
            prefix: self.prefix.clone(),
            storage_scheme: self.storage_scheme.clone(),
            storage_root: self.storage_root.clone(),
            storage_endpoint: self.storage_endpoint.clone(),
            registry_endpoint: self.registry_endpoint.clone(),
            pool_size: self.pool_size,
            max_overflow: self.max_overflow,
            echo: self.echo.then_some(true),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show the effective configuration or persist settings
    Config(ConfigArgs),
    /// Register files from a directory or storage prefix into a dataset
    Load(LoadArgs),
    /// Query registered files, then export and/or download them
    Fetch(FetchArgs),
    /// List the datasets of a domain
    Datasets(DatasetsArgs),
    /// Show one file record and its tags
    Show(ShowArgs),
    /// Attach tags to a file
    Tag(TagArgs),
    /// Create a dataset from exported manifests
    Create(CreateArgs),
}

#[derive(Args, Debug, Default)]
pub struct ConfigArgs {
    #[arg(long)]
    pub set_bucket: Option<String>,
    #[arg(long)]
    pub set_prefix: Option<String>,
    #[arg(long)]
    pub set_storage_scheme: Option<String>,
    #[arg(long)]
    pub set_storage_root: Option<PathBuf>,
    #[arg(long)]
    pub set_storage_endpoint: Option<String>,
    #[arg(long)]
    pub set_registry_endpoint: Option<String>,
    #[arg(long)]
    pub set_pool_size: Option<u32>,
    #[arg(long)]
    pub set_max_overflow: Option<u32>,
    #[arg(long)]
    pub set_echo: Option<bool>,
}

impl ConfigArgs {
    pub fn updates(&self) -> Settings {
        Settings {
            bucket: self.set_bucket.clone(),
            prefix: self.set_prefix.clone(),
            storage_scheme: self.set_storage_scheme.clone(),
            storage_root: self.set_storage_root.clone(),
            storage_endpoint: self.set_storage_endpoint.clone(),
            registry_endpoint: self.set_registry_endpoint.clone(),
            pool_size: self.set_pool_size,
            max_overflow: self.set_max_overflow,
            echo: self.set_echo,
        }
    }
}

#[derive(Args, Debug)]
pub struct LoadArgs {
    /// Local directory/file or scheme://bucket/prefix
    pub source: String,
    pub dataset: String,
    #[arg(long, default_value = "global")]
    pub domain: String,
    #[arg(long, default_value_t = Stage::Raw)]
    pub stage: Stage,
    /// Keep only these extensions
    #[arg(long, num_args = 1..)]
    pub filters: Vec<String>,
    #[arg(long, num_args = 1..)]
    pub tags: Vec<String>,
    #[arg(long)]
    pub description: Option<String>,
    /// Allow loading into an existing dataset
    #[arg(long)]
    pub exists_ok: bool,
    #[arg(short, long)]
    pub recursive: bool,
    /// Upload registered files to storage
    #[arg(long)]
    pub upload: bool,
}

#[derive(Args, Debug)]
pub struct FetchArgs {
    pub directory: PathBuf,
    pub limit: i64,
    #[arg(long, default_value = "global")]
    pub domain: String,
    #[arg(long, default_value_t = Stage::Raw)]
    pub stage: Stage,
    #[arg(long)]
    pub dataset: Option<String>,
    /// MIME type substring
    #[arg(long)]
    pub mime: Option<String>,
    /// Match files carrying any of these tags
    #[arg(long, num_args = 1..)]
    pub tags: Vec<String>,
    #[arg(long = "sha256", num_args = 1..)]
    pub hashes: Vec<String>,
    #[arg(long, num_args = 1..)]
    pub filenames: Vec<String>,
    /// Write the matching records to an export file
    #[arg(long)]
    pub export: bool,
    #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
    pub export_format: ExportFormat,
    /// Do not download anything
    #[arg(long)]
    pub dry: bool,
}

#[derive(Args, Debug)]
pub struct DatasetsArgs {
    #[arg(long, default_value = "global")]
    pub domain: String,
    /// Substring of the dataset name
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long)]
    pub limit: Option<i64>,
    #[arg(long)]
    pub offset: Option<i64>,
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    #[arg(long)]
    pub id: Option<i64>,
    #[arg(long = "sha256")]
    pub hash: Option<String>,
    /// Filename; needs --dataset
    #[arg(long, requires = "dataset")]
    pub filename: Option<String>,
    #[arg(long)]
    pub dataset: Option<String>,
    #[arg(long, default_value = "global")]
    pub domain: String,
}

#[derive(Args, Debug)]
pub struct TagArgs {
    pub file_id: i64,
    #[arg(required = true)]
    pub tags: Vec<String>,
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    pub dataset: String,
    #[arg(required = true)]
    pub manifests: Vec<PathBuf>,
    #[arg(long, default_value = "global")]
    pub domain: String,
    #[arg(long)]
    pub description: Option<String>,
    #[arg(long)]
    pub exists_ok: bool,
}

impl AppConfig {
    /// Merge CLI arguments, `DJ_*` variables and the settings file, in that
    /// order of precedence, over the built-in defaults.
    pub fn from_env_and_args(args: &GlobalArgs) -> Result<Self> {
        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let settings_path = args
            .config
            .clone()
            .or_else(|| env::var_os("DJ_CONFIG").map(PathBuf::from))
            .unwrap_or_else(|| default_settings_path(&home));

        let env_settings = Settings::from_env_with(|key| env::var(key).ok())?;
        let file_settings = Settings::load(&settings_path)?;
        Self::resolve(args, env_settings, file_settings, &home, settings_path)
    }

    pub fn resolve(
        args: &GlobalArgs,
        env_settings: Settings,
        file_settings: Settings,
        home: &Path,
        settings_path: PathBuf,
    ) -> Result<Self> {
        let merged = args.settings().or(env_settings).or(file_settings);
        let storage_scheme = merged
            .storage_scheme
            .as_deref()
            .unwrap_or("s3")
            .parse::<StorageScheme>()
            .context("resolving storage scheme")?;
        let mut registry = RegistryConfig::new(
            merged
                .registry_endpoint
                .unwrap_or_else(|| default_registry_endpoint(home)),
        );
        registry.pool_size = merged.pool_size.unwrap_or(registry.pool_size);
        registry.max_overflow = merged.max_overflow.unwrap_or(registry.max_overflow);
        registry.echo = merged.echo.unwrap_or(false);

        Ok(Self {
            bucket: merged.bucket.unwrap_or_default(),
            prefix: merged.prefix.unwrap_or_else(|| DEFAULT_PREFIX.into()),
            storage_scheme,
            storage_root: merged
                .storage_root
                .unwrap_or_else(|| home.join(".dj").join("objects")),
            storage_endpoint: merged.storage_endpoint,
            registry,
            settings_path,
            verbose: args.verbose,
        })
    }
}

pub fn default_settings_path(home: &Path) -> PathBuf {
    home.join(".dj").join("config.toml")
}

fn default_registry_endpoint(home: &Path) -> String {
    format!("sqlite://{}", home.join(".dj").join("registry.db").display())
}
