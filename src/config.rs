//! Pipeline configuration.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (AUDIO_ETL_CATALOG, AUDIO_ETL_SCHEMA, ...)
//! 2. Config file (`--config FILE`, else .audio-etl/pipeline.yaml)
//! 3. Defaults
//!
//! Config file discovery:
//! - Searches current directory and parents for .audio-etl/pipeline.yaml
//! - Relative paths in the file are resolved against the directory holding
//!   `.audio-etl/`

pub mod paths;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::formats;
use crate::stages::RetryPolicy;

/// Directory searched for in the current directory and its parents
pub const CONFIG_DIR: &str = ".audio-etl";

/// File name inside [`CONFIG_DIR`]
pub const CONFIG_FILE: &str = "pipeline.yaml";

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "AUDIO_ETL_";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Missing required setting: {0}")]
    Missing(&'static str),
}

/// What discovery captures per file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestMode {
    /// Path, size and modification time only
    #[default]
    MetadataOnly,

    /// Also embed the file's bytes in the bronze record
    ContentInline,
}

impl std::str::FromStr for IngestMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "metadata_only" => Ok(Self::MetadataOnly),
            "content_inline" => Ok(Self::ContentInline),
            _ => Err(format!(
                "unknown mode '{}' (expected metadata_only or content_inline)",
                s
            )),
        }
    }
}

/// Discovery stage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BronzeSettings {
    pub mode: IngestMode,

    /// Supported extensions; also drives the listing glob
    pub extensions: Vec<String>,

    /// Upper bound on files planned into one batch
    pub max_files_per_trigger: usize,

    /// Files stat'ed or read at once
    pub max_concurrency: usize,

    /// Write a discovery snapshot every N committed batches
    pub snapshot_interval: u64,

    /// Retry policy for transient storage errors
    pub retry: RetryPolicy,

    /// Runs of one batch before files still failing transiently are dead-lettered
    pub max_batch_attempts: u32,
}

impl Default for BronzeSettings {
    fn default() -> Self {
        Self {
            mode: IngestMode::default(),
            extensions: formats::default_extensions(),
            max_files_per_trigger: 1000,
            max_concurrency: 8,
            snapshot_interval: 10,
            retry: RetryPolicy::default(),
            max_batch_attempts: 3,
        }
    }
}

/// Enrichment stage settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SilverSettings {
    /// Upper bound on bronze versions consumed per batch (unbounded if unset)
    pub max_versions_per_trigger: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Drain available input, then exit
    #[default]
    AvailableNow,

    /// Drain, then wait for the next tick or wake-up
    Continuous,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerSettings {
    pub mode: TriggerKind,
    pub interval_secs: u64,

    /// Debounce window for filesystem wake-ups (0 disables watching)
    pub watch_debounce_ms: u64,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            mode: TriggerKind::default(),
            interval_secs: 30,
            watch_debounce_ms: 2000,
        }
    }
}

/// The full pipeline configuration, passed explicitly to each stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub catalog: String,
    pub schema: String,

    /// Root for stage checkpoints
    pub schema_location_base: PathBuf,

    /// Mount point of the volumes holding incoming files
    #[serde(default = "default_volumes_root")]
    pub volumes_root: PathBuf,

    /// Root for bronze/silver/dead-letter tables
    #[serde(default = "default_tables_root")]
    pub tables_root: PathBuf,

    #[serde(default)]
    pub bronze: BronzeSettings,

    #[serde(default)]
    pub silver: SilverSettings,

    #[serde(default)]
    pub trigger: TriggerSettings,
}

fn default_volumes_root() -> PathBuf {
    PathBuf::from("/Volumes")
}

fn default_tables_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("audio-etl")
        .join("tables")
}

impl PipelineConfig {
    /// Parse a config from YAML content
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Load a config file, resolving relative paths against `base_dir`
    pub fn from_file(path: &Path, base_dir: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::from_yaml(&content)?;
        config.schema_location_base = resolve_path(base_dir, &config.schema_location_base);
        config.volumes_root = resolve_path(base_dir, &config.volumes_root);
        config.tables_root = resolve_path(base_dir, &config.tables_root);
        Ok(config)
    }

    /// Apply `AUDIO_ETL_*` overrides, looking keys up with `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(catalog) = var("CATALOG") {
            self.catalog = catalog;
        }
        if let Some(schema) = var("SCHEMA") {
            self.schema = schema;
        }
        if let Some(base) = var("SCHEMA_LOCATION_BASE") {
            self.schema_location_base = PathBuf::from(base);
        }
        if let Some(root) = var("VOLUMES_ROOT") {
            self.volumes_root = PathBuf::from(root);
        }
        if let Some(root) = var("TABLES_ROOT") {
            self.tables_root = PathBuf::from(root);
        }
        if let Some(mode) = var("BRONZE_MODE") {
            self.bronze.mode = mode.parse().map_err(|message| ConfigError::InvalidValue {
                key: format!("{}BRONZE_MODE", ENV_PREFIX),
                message,
            })?;
        }

        Ok(())
    }

    /// Reject settings the stages cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.catalog.trim().is_empty() {
            return Err(ConfigError::Missing("catalog"));
        }
        if self.schema.trim().is_empty() {
            return Err(ConfigError::Missing("schema"));
        }
        if self.schema_location_base.as_os_str().is_empty() {
            return Err(ConfigError::Missing("schema_location_base"));
        }

        for (key, value) in [("catalog", &self.catalog), ("schema", &self.schema)] {
            if value.contains('/') || value == ".." || value == "." {
                return Err(invalid(key, "must be a single path segment"));
            }
        }

        if self.bronze.extensions.is_empty() {
            return Err(invalid("bronze.extensions", "at least one extension is required"));
        }
        for ext in &self.bronze.extensions {
            let malformed = ext.is_empty() || ext.contains(['.', '/', ',', '{', '}']);
            if malformed || *ext != ext.to_lowercase() {
                return Err(invalid(
                    "bronze.extensions",
                    &format!("'{}' must be a bare lowercase extension", ext),
                ));
            }
        }
        if self.bronze.max_files_per_trigger == 0 {
            return Err(invalid("bronze.max_files_per_trigger", "must be at least 1"));
        }
        if self.bronze.max_concurrency == 0 {
            return Err(invalid("bronze.max_concurrency", "must be at least 1"));
        }
        if self.bronze.snapshot_interval == 0 {
            return Err(invalid("bronze.snapshot_interval", "must be at least 1"));
        }
        if self.bronze.retry.max_attempts == 0 {
            return Err(invalid("bronze.retry.max_attempts", "must be at least 1"));
        }
        if self.bronze.max_batch_attempts == 0 {
            return Err(invalid("bronze.max_batch_attempts", "must be at least 1"));
        }
        if self.silver.max_versions_per_trigger == Some(0) {
            return Err(invalid("silver.max_versions_per_trigger", "must be at least 1"));
        }
        if self.trigger.interval_secs == 0 {
            return Err(invalid("trigger.interval_secs", "must be at least 1"));
        }

        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

/// A validated config plus where it came from
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: PipelineConfig,

    /// Path to config file (if one was used)
    pub config_file: Option<PathBuf>,
}

impl ResolvedConfig {
    /// Load from an explicit file, or the discovered one, then apply env overrides
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let config_file = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => find_config_file(),
        };

        let mut config = match &config_file {
            Some(path) => {
                let base_dir = config_base_dir(path);
                PipelineConfig::from_file(path, &base_dir)?
            }
            // Without a file, every required setting must come from the environment
            None => PipelineConfig::from_yaml(
                "catalog: \"\"\nschema: \"\"\nschema_location_base: \"\"\n",
            )?,
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(Self {
            config,
            config_file,
        })
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Directory relative paths in `config_path` are resolved against
fn config_base_dir(config_path: &Path) -> PathBuf {
    let parent = config_path.parent().unwrap_or(Path::new("."));

    // .audio-etl/pipeline.yaml resolves against the project root
    if parent.file_name().map_or(false, |name| name == CONFIG_DIR) {
        parent.parent().unwrap_or(Path::new(".")).to_path_buf()
    } else {
        parent.to_path_buf()
    }
}

/// Resolve a path that may be relative to the config file's base
fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() || path.as_os_str().is_empty() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
