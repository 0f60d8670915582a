//! Configuration models for storescout.
//!
//! All I^R (resolvable ignorance) is parameterized here.
//! The user resolves these unknowns at runtime via config file.
//! Every field has a default, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Top-level configuration for storescout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub sources: SourcesConfig,
}

/// Checkpoint database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// SQLite database file
    #[serde(default = "default_checkpoint_path")]
    pub path: PathBuf,

    /// Completed runs kept per source by `cleanup`
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("data/checkpoints.db")
}

fn default_keep_recent() -> usize {
    10
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: default_checkpoint_path(),
            keep_recent: default_keep_recent(),
        }
    }
}

/// Batching and batch-level retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Items per batch (fixed for a run)
    #[serde(default = "default_batch_size")]
    pub size: usize,

    /// Attempts per batch before the run is marked failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff (delay = base * 2^attempt)
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Upper bound for a single backoff delay
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_batch_size() -> usize {
    50
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl BatchConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

/// HTTP client settings shared by all sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Fixed pause between consecutive requests to the same host
    #[serde(default = "default_request_interval_ms")]
    pub request_interval_ms: u64,

    /// Attempts per page fetch / per-item call
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    concat!("storescout/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_request_interval_ms() -> u64 {
    500
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            user_agent: default_user_agent(),
            request_interval_ms: default_request_interval_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }
}

/// Output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// JSONL file stores are appended to
    #[serde(default = "default_output_path")]
    pub path: PathBuf,
}

fn default_output_path() -> PathBuf {
    PathBuf::from("data/stores.jsonl")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: default_output_path(),
        }
    }
}

/// Per-source settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcesConfig {
    #[serde(default)]
    pub rewe: ReweConfig,

    #[serde(default)]
    pub denns: DennsConfig,

    #[serde(default)]
    pub file: FileSourceConfig,
}

/// REWE market search, selection and product-count endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReweConfig {
    #[serde(default = "default_rewe_base_url")]
    pub base_url: String,

    /// One page is fetched per search term
    #[serde(default = "default_rewe_search_terms")]
    pub search_terms: Vec<String>,

    /// Run the two-phase brand availability check per market
    #[serde(default = "default_true")]
    pub verify: bool,

    /// Exact product query used for the availability check
    #[serde(default = "default_verification_query")]
    pub verification_query: String,

    /// Brand name the catalog is filtered by (case-insensitive)
    #[serde(default = "default_brand")]
    pub brand: String,
}

fn default_rewe_base_url() -> String {
    "https://www.rewe.de".to_string()
}

fn default_rewe_search_terms() -> Vec<String> {
    [
        "Baden-Württemberg",
        "Bayern",
        "Berlin",
        "Brandenburg",
        "Bremen",
        "Hamburg",
        "Hessen",
        "Mecklenburg-Vorpommern",
        "Niedersachsen",
        "Nordrhein-Westfalen",
        "Rheinland-Pfalz",
        "Saarland",
        "Sachsen",
        "Sachsen-Anhalt",
        "Schleswig-Holstein",
        "Thüringen",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_verification_query() -> String {
    "SOTO".to_string()
}

fn default_brand() -> String {
    "soto".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ReweConfig {
    fn default() -> Self {
        Self {
            base_url: default_rewe_base_url(),
            search_terms: default_rewe_search_terms(),
            verify: true,
            verification_query: default_verification_query(),
            brand: default_brand(),
        }
    }
}

/// denn's Biomarkt market index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DennsConfig {
    #[serde(default = "default_denns_url")]
    pub url: String,

    /// Only markets in this country are kept
    #[serde(default = "default_country")]
    pub country: String,
}

fn default_denns_url() -> String {
    "https://www.biomarkt.de/page-data/marktindex/page-data.json".to_string()
}

fn default_country() -> String {
    "DE".to_string()
}

impl Default for DennsConfig {
    fn default() -> Self {
        Self {
            url: default_denns_url(),
            country: default_country(),
        }
    }
}

/// Local JSONL fixture source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSourceConfig {
    #[serde(default = "default_file_source_path")]
    pub path: PathBuf,
}

fn default_file_source_path() -> PathBuf {
    PathBuf::from("data/stores.input.jsonl")
}

impl Default for FileSourceConfig {
    fn default() -> Self {
        Self {
            path: default_file_source_path(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// B_i(file exists) → Result
    /// B_i(file is valid TOML) → Result
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        Self::from_toml(&expand_env_vars(&content)).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_owned(),
                source,
            },
            other => other,
        })
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runner cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch.size == 0 {
            return Err(ConfigError::Invalid("batch.size must be at least 1".into()));
        }
        if self.batch.max_retries == 0 || self.http.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "max_retries must be at least 1 (it counts attempts)".into(),
            ));
        }
        if self.sources.rewe.search_terms.is_empty() {
            return Err(ConfigError::Invalid(
                "sources.rewe.search_terms must not be empty".into(),
            ));
        }
        Ok(())
    }
}

static ENV_VAR_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([^}]+)\}").unwrap_or_else(|e| panic!("invalid env var pattern: {e}"))
});

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();

    for cap in ENV_VAR_RE.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Configuration errors.
///
/// Epistemic origin:
/// - B_i falsified: File not found, parse error
/// - I^B materialized: Values out of range
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
