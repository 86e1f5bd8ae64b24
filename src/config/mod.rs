use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::model::SourceDescriptor;
use crate::normalize::PointerFields;

pub const TOKEN_ENV: &str = "HOSTMERGE_TOKEN";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizerChoice {
    Crowdstrike,
    Qualys,
    Pointer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub name: String,
    pub endpoint: String,
    pub index_id: String,
    pub normalizer: NormalizerChoice,
    pub fields: Option<PointerFields>,
}

impl SourceSpec {
    pub fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor::new(&self.name, &self.endpoint, &self.index_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetcherKind {
    Http,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Relative paths resolve against the state directory.
    pub path: PathBuf,
    pub busy_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetcherConfig {
    pub kind: FetcherKind,
    pub base_url: Option<String>,
    pub token: Option<String>,
    pub timeout: Duration,
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub fetch_interval: u64,
    pub merge_retries: u32,
    pub retry_backoff: Duration,
    pub parallel: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveConfig {
    pub database: DatabaseConfig,
    pub fetcher: FetcherConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
    pub sources: Vec<SourceSpec>,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                path: PathBuf::from("hostmerge.sqlite"),
                busy_timeout: Duration::from_millis(5_000),
            },
            fetcher: FetcherConfig {
                kind: FetcherKind::Http,
                base_url: None,
                token: None,
                timeout: Duration::from_secs(30),
                dir: None,
            },
            pipeline: PipelineConfig {
                fetch_interval: 100,
                merge_retries: 5,
                retry_backoff: Duration::from_millis(25),
                parallel: false,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: LogFormat::Text,
            },
            sources: Vec::new(),
        }
    }
}

impl EffectiveConfig {
    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|source| source.name.clone()).collect()
    }

    pub fn descriptors(&self) -> Vec<SourceDescriptor> {
        self.sources.iter().map(SourceSpec::descriptor).collect()
    }

    /// Applies environment overrides; `lookup` is `std::env::var` outside tests.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup(TOKEN_ENV).filter(|value| !value.is_empty()) {
            self.fetcher.token = Some(token);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.fetch_interval == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.fetch_interval must be greater than zero".to_string(),
            ));
        }
        if self.pipeline.merge_retries == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.merge_retries must be at least 1".to_string(),
            ));
        }
        match self.fetcher.kind {
            FetcherKind::Http if self.fetcher.base_url.is_none() => {
                return Err(ConfigError::Invalid(
                    "fetcher.base_url is required for the http fetcher".to_string(),
                ));
            }
            FetcherKind::File if self.fetcher.dir.is_none() => {
                return Err(ConfigError::Invalid(
                    "fetcher.dir is required for the file fetcher".to_string(),
                ));
            }
            _ => {}
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(ConfigError::Invalid("source name must not be empty".to_string()));
            }
            if !seen.insert(source.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "source `{}` is configured twice",
                    source.name
                )));
            }
            if source.index_id.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "source `{}` needs an index_id",
                    source.name
                )));
            }
            if source.normalizer == NormalizerChoice::Pointer && source.fields.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "source `{}` uses the pointer normalizer but has no fields",
                    source.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    database: Option<RawDatabase>,
    #[serde(default)]
    fetcher: Option<RawFetcher>,
    #[serde(default)]
    pipeline: Option<RawPipeline>,
    #[serde(default)]
    logging: Option<RawLogging>,
    #[serde(default)]
    sources: Option<Vec<RawSourceSpec>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDatabase {
    path: Option<PathBuf>,
    busy_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFetcher {
    kind: Option<String>,
    base_url: Option<String>,
    token: Option<String>,
    timeout_secs: Option<u64>,
    dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPipeline {
    fetch_interval: Option<u64>,
    merge_retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
    parallel: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLogging {
    level: Option<String>,
    format: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSourceSpec {
    name: String,
    endpoint: String,
    index_id: String,
    #[serde(default)]
    normalizer: String,
    #[serde(default)]
    fields: Option<PointerFields>,
}

impl RawSourceSpec {
    fn into_source(self) -> Result<SourceSpec, ConfigError> {
        // Without an explicit normalizer the source name selects one.
        let normalizer = if self.normalizer.trim().is_empty() {
            parse_normalizer_choice(&self.name)?
        } else {
            parse_normalizer_choice(&self.normalizer)?
        };
        Ok(SourceSpec {
            name: self.name,
            endpoint: self.endpoint,
            index_id: self.index_id,
            normalizer,
            fields: self.fields,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("unknown normalizer `{0}`")]
    InvalidNormalizer(String),
    #[error("unknown fetcher kind `{0}`")]
    InvalidFetcher(String),
    #[error("unknown log format `{0}`")]
    InvalidLogFormat(String),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug)]
struct ConfigLayer {
    raw: RawConfig,
    sources: Option<Vec<SourceSpec>>,
}

/// Merges the user config and then the repo config over the defaults. Scalar
/// settings from later layers win; sources are merged by name.
pub fn load_effective_config(
    repo_config: Option<&Path>,
    user_config: Option<&Path>,
) -> Result<EffectiveConfig, ConfigError> {
    let mut merged = EffectiveConfig::default();

    if let Some(path) = user_config.filter(|path| path.exists()) {
        let layer = load_config_layer(path)?;
        merge_layer(&mut merged, layer)?;
    }

    if let Some(path) = repo_config.filter(|path| path.exists()) {
        let layer = load_config_layer(path)?;
        merge_layer(&mut merged, layer)?;
    }

    Ok(merged)
}

pub fn load_config_file(path: &Path) -> Result<EffectiveConfig, ConfigError> {
    let mut merged = EffectiveConfig::default();
    merge_layer(&mut merged, load_config_layer(path)?)?;
    Ok(merged)
}

fn merge_layer(merged: &mut EffectiveConfig, layer: ConfigLayer) -> Result<(), ConfigError> {
    let raw = layer.raw;
    if let Some(database) = raw.database {
        if let Some(path) = database.path {
            merged.database.path = path;
        }
        if let Some(ms) = database.busy_timeout_ms {
            merged.database.busy_timeout = Duration::from_millis(ms);
        }
    }
    if let Some(fetcher) = raw.fetcher {
        if let Some(kind) = fetcher.kind {
            merged.fetcher.kind = parse_fetcher_kind(&kind)?;
        }
        if fetcher.base_url.is_some() {
            merged.fetcher.base_url = fetcher.base_url;
        }
        if fetcher.token.is_some() {
            merged.fetcher.token = fetcher.token;
        }
        if let Some(secs) = fetcher.timeout_secs {
            merged.fetcher.timeout = Duration::from_secs(secs);
        }
        if fetcher.dir.is_some() {
            merged.fetcher.dir = fetcher.dir;
        }
    }
    if let Some(pipeline) = raw.pipeline {
        if let Some(interval) = pipeline.fetch_interval {
            merged.pipeline.fetch_interval = interval;
        }
        if let Some(retries) = pipeline.merge_retries {
            merged.pipeline.merge_retries = retries;
        }
        if let Some(ms) = pipeline.retry_backoff_ms {
            merged.pipeline.retry_backoff = Duration::from_millis(ms);
        }
        if let Some(parallel) = pipeline.parallel {
            merged.pipeline.parallel = parallel;
        }
    }
    if let Some(logging) = raw.logging {
        if let Some(level) = logging.level {
            merged.logging.level = level;
        }
        if let Some(format) = logging.format {
            merged.logging.format = parse_log_format(&format)?;
        }
    }
    if let Some(sources) = layer.sources {
        merge_sources_dedup(&mut merged.sources, sources);
    }
    Ok(())
}

fn merge_sources_dedup(existing: &mut Vec<SourceSpec>, incoming: Vec<SourceSpec>) {
    let mut indices = HashMap::new();
    for (idx, source) in existing.iter().enumerate() {
        indices.insert(source.name.clone(), idx);
    }

    for source in incoming {
        if let Some(idx) = indices.get(&source.name).copied() {
            existing[idx] = source;
        } else {
            let idx = existing.len();
            indices.insert(source.name.clone(), idx);
            existing.push(source);
        }
    }
}

fn load_config_layer(path: &Path) -> Result<ConfigLayer, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config_layer(&content)
}

fn parse_config_layer(content: &str) -> Result<ConfigLayer, ConfigError> {
    let mut raw: RawConfig = if content.trim().is_empty() {
        RawConfig::default()
    } else {
        serde_yaml::from_str(content)?
    };
    let sources = match raw.sources.take() {
        Some(raw_sources) => {
            let mut sources = Vec::with_capacity(raw_sources.len());
            for source in raw_sources {
                sources.push(source.into_source()?);
            }
            Some(sources)
        }
        None => None,
    };
    Ok(ConfigLayer { raw, sources })
}

pub fn default_repo_config_yaml() -> String {
    r#"database:
  path: hostmerge.sqlite
fetcher:
  kind: http
  base_url: https://inventory.example.com/api
  timeout_secs: 30
pipeline:
  fetch_interval: 100
  merge_retries: 5
  retry_backoff_ms: 25
  parallel: false
logging:
  level: info
  format: text
sources:
  - name: crowdstrike
    endpoint: /crowdstrike/hosts/get
    index_id: device_id
  - name: qualys
    endpoint: /qualys/hosts/get
    index_id: id
"#
    .to_string()
}

pub fn expand_tilde(path: &Path, home: &Path) -> PathBuf {
    if path == Path::new("~") {
        return home.to_path_buf();
    }
    if let Ok(rest) = path.strip_prefix("~") {
        return home.join(rest);
    }
    path.to_path_buf()
}

fn parse_normalizer_choice(raw: &str) -> Result<NormalizerChoice, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "crowdstrike" => Ok(NormalizerChoice::Crowdstrike),
        "qualys" => Ok(NormalizerChoice::Qualys),
        "pointer" => Ok(NormalizerChoice::Pointer),
        _ => Err(ConfigError::InvalidNormalizer(raw.to_string())),
    }
}

fn parse_fetcher_kind(raw: &str) -> Result<FetcherKind, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "http" => Ok(FetcherKind::Http),
        "file" => Ok(FetcherKind::File),
        _ => Err(ConfigError::InvalidFetcher(raw.to_string())),
    }
}

fn parse_log_format(raw: &str) -> Result<LogFormat, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        _ => Err(ConfigError::InvalidLogFormat(raw.to_string())),
    }
}
