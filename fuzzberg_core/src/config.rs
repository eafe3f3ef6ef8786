use crate::transport::AuthToken;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML from config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Missing required setting `{0}`")]
    Missing(&'static str),
    #[error("Invalid value {value:?} for `{setting}` (expected one of: {expected})")]
    InvalidValue {
        setting: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("Database `{database}` cannot fuzz `{format}` files")]
    UnsupportedFormat {
        database: TargetDatabase,
        format: FileFormat,
    },
    #[error("A bucket name is required when fuzzing iceberg")]
    MissingBucket,
    #[error("Target binary {0:?} does not exist")]
    MissingBinary(PathBuf),
    #[error("Corpus directory {0:?} does not exist")]
    MissingCorpus(PathBuf),
    #[error("Invalid query set in {path:?}: {reason}")]
    InvalidQuerySet { path: PathBuf, reason: String },
    #[error("Invalid tuning: {0}")]
    InvalidTuning(String),
}

/// File format handled by a fuzzing session.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FileFormat {
    Csv,
    Parquet,
    Iceberg,
}

impl FileFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileFormat::Csv => "csv",
            FileFormat::Parquet => "parquet",
            FileFormat::Iceberg => "iceberg",
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "csv" => Ok(FileFormat::Csv),
            "parquet" => Ok(FileFormat::Parquet),
            "iceberg" => Ok(FileFormat::Iceberg),
            other => Err(ConfigError::InvalidValue {
                setting: "format",
                value: other.to_string(),
                expected: "csv, parquet, iceberg",
            }),
        }
    }
}

/// Database server the fuzzer launches. Each one reads a subset of the formats.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TargetDatabase {
    Firebolt,
    #[serde(rename = "duckdb")]
    DuckDb,
}

impl TargetDatabase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetDatabase::Firebolt => "firebolt",
            TargetDatabase::DuckDb => "duckdb",
        }
    }

    /// Whether this database's reader is fuzzed with `format` input.
    pub fn supports(&self, format: FileFormat) -> bool {
        match self {
            TargetDatabase::Firebolt => true,
            TargetDatabase::DuckDb => format == FileFormat::Csv,
        }
    }

    /// Header carrying the bearer token on query requests.
    pub fn auth_header(&self) -> &'static str {
        match self {
            TargetDatabase::Firebolt => "F-Authorization",
            TargetDatabase::DuckDb => "Authorization",
        }
    }
}

impl fmt::Display for TargetDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetDatabase {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "firebolt" => Ok(TargetDatabase::Firebolt),
            "duckdb" => Ok(TargetDatabase::DuckDb),
            other => Err(ConfigError::InvalidValue {
                setting: "database",
                value: other.to_string(),
                expected: "firebolt, duckdb",
            }),
        }
    }
}

/// `[target]`: how to start and reach the database under test.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub database: Option<TargetDatabase>,
    pub binary: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    pub url: Option<String>,
    pub auth_token: Option<String>,
}

/// `[fuzzing]`: what to fuzz and where files live.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzingConfig {
    pub format: Option<FileFormat>,
    pub corpus_dir: Option<PathBuf>,
    pub crash_dir: Option<PathBuf>,
    pub mutation_dir: Option<PathBuf>,
    pub queries_file: Option<PathBuf>,
    pub bucket: Option<String>,
    pub seed: Option<u64>,
}

/// `[tuning]`: timeouts in milliseconds and mutation limits.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TuningConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_interrupt_grace_ms")]
    pub interrupt_grace_ms: u64,
    #[serde(default = "default_exit_wait_ms")]
    pub exit_wait_ms: u64,
    #[serde(default = "default_mutation_capacity")]
    pub mutation_capacity: usize,
    #[serde(default = "default_field_retry_budget")]
    pub field_retry_budget: u32,
}

fn default_request_timeout_ms() -> u64 {
    15_000
}
fn default_startup_delay_ms() -> u64 {
    8_000
}
fn default_connect_timeout_ms() -> u64 {
    60_000
}
fn default_interrupt_grace_ms() -> u64 {
    10_000
}
fn default_exit_wait_ms() -> u64 {
    30_000
}
pub fn default_mutation_capacity() -> usize {
    crate::mutator::DEFAULT_MUTATION_CAPACITY
}
fn default_field_retry_budget() -> u32 {
    10_000
}

/// Smallest mutation buffer that still fits Parquet framing plus a few page bytes.
const MIN_MUTATION_CAPACITY: usize = 64;

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            startup_delay_ms: default_startup_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            interrupt_grace_ms: default_interrupt_grace_ms(),
            exit_wait_ms: default_exit_wait_ms(),
            mutation_capacity: default_mutation_capacity(),
            field_retry_budget: default_field_retry_budget(),
        }
    }
}

/// Resolved timing and sizing knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuning {
    pub request_timeout: Duration,
    pub startup_delay: Duration,
    pub connect_timeout: Duration,
    pub interrupt_grace: Duration,
    pub exit_wait: Duration,
    pub mutation_capacity: usize,
    pub field_retry_budget: u32,
}

impl TuningConfig {
    fn resolve(&self) -> Result<Tuning, ConfigError> {
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidTuning(
                "request-timeout-ms must be positive".to_string(),
            ));
        }
        if self.mutation_capacity < MIN_MUTATION_CAPACITY {
            return Err(ConfigError::InvalidTuning(format!(
                "mutation-capacity must be at least {MIN_MUTATION_CAPACITY} bytes"
            )));
        }
        if self.field_retry_budget == 0 {
            return Err(ConfigError::InvalidTuning(
                "field-retry-budget must be positive".to_string(),
            ));
        }
        Ok(self.to_tuning())
    }

    fn to_tuning(&self) -> Tuning {
        Tuning {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            startup_delay: Duration::from_millis(self.startup_delay_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            interrupt_grace: Duration::from_millis(self.interrupt_grace_ms),
            exit_wait: Duration::from_millis(self.exit_wait_ms),
            mutation_capacity: self.mutation_capacity,
            field_retry_budget: self.field_retry_budget,
        }
    }
}

impl Default for Tuning {
    fn default() -> Self {
        TuningConfig::default().to_tuning()
    }
}

/// Which byte mutator drives the session.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case", tag = "kind")]
#[serde(deny_unknown_fields)]
pub enum MutatorConfig {
    #[default]
    Havoc,
    /// External mutation tool reading the seed on stdin and writing the mutation
    /// to stdout. `{seed}` in any argument is replaced with the round's seed value.
    Command {
        command: Vec<String>,
        #[serde(default = "default_mutator_timeout_ms")]
        timeout_ms: u64,
    },
}

fn default_mutator_timeout_ms() -> u64 {
    5_000
}

/// Top-level `config.toml` contents. Every field may be overridden from the
/// command line before [`FuzzbergConfig::validate`] runs.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzbergConfig {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub fuzzing: FuzzingConfig,
    #[serde(default)]
    pub tuning: TuningConfig,
    #[serde(default)]
    pub mutator: MutatorConfig,
}

/// Everything a session needs, validated.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub database: TargetDatabase,
    pub format: FileFormat,
    pub binary: PathBuf,
    pub target_args: Vec<String>,
    pub url: String,
    pub auth: Option<AuthToken>,
    pub corpus_dir: PathBuf,
    pub crash_dir: PathBuf,
    pub mutation_dir: PathBuf,
    pub queries: Vec<String>,
    pub bucket: Option<String>,
    pub seed: Option<u64>,
    pub tuning: Tuning,
    pub mutator: MutatorConfig,
}

#[derive(Deserialize)]
struct QueryFile {
    queries: Vec<String>,
}

/// Reads a query-set file of the form `{"queries": ["...", ...]}`.
pub fn load_query_set(path: &Path) -> Result<Vec<String>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::InvalidQuerySet {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let parsed: QueryFile =
        serde_json::from_str(&content).map_err(|e| ConfigError::InvalidQuerySet {
            path: path.to_path_buf(),
            reason: format!("expected an array of strings under `queries`: {e}"),
        })?;
    if parsed.queries.is_empty() {
        return Err(ConfigError::InvalidQuerySet {
            path: path.to_path_buf(),
            reason: "query list is empty".to_string(),
        });
    }
    Ok(parsed.queries)
}

impl FuzzbergConfig {
    /// Reads and parses a TOML configuration file.
    ///
    /// # Arguments
    /// * `path`: Location of the TOML file.
    ///
    /// # Returns
    /// The parsed configuration, or `ConfigError::Read`/`ConfigError::Parse`.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: FuzzbergConfig = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;

        Ok(config)
    }

    /// Checks required values and cross-field rules, and loads the query set.
    pub fn validate(self) -> Result<SessionSettings, ConfigError> {
        let database = self.target.database.ok_or(ConfigError::Missing("database"))?;
        let format = self.fuzzing.format.ok_or(ConfigError::Missing("format"))?;
        if !database.supports(format) {
            return Err(ConfigError::UnsupportedFormat { database, format });
        }

        let url = self.target.url.ok_or(ConfigError::Missing("url"))?;
        let binary = self.target.binary.ok_or(ConfigError::Missing("bin"))?;
        if !binary.is_file() {
            return Err(ConfigError::MissingBinary(binary));
        }
        let corpus_dir = self.fuzzing.corpus_dir.ok_or(ConfigError::Missing("input"))?;
        if !corpus_dir.is_dir() {
            return Err(ConfigError::MissingCorpus(corpus_dir));
        }
        let crash_dir = self.fuzzing.crash_dir.ok_or(ConfigError::Missing("output"))?;
        let mutation_dir = self
            .fuzzing
            .mutation_dir
            .ok_or(ConfigError::Missing("mutate"))?;
        let queries_file = self
            .fuzzing
            .queries_file
            .ok_or(ConfigError::Missing("queries"))?;

        let bucket = self.fuzzing.bucket.filter(|b| !b.is_empty());
        if format == FileFormat::Iceberg && bucket.is_none() {
            return Err(ConfigError::MissingBucket);
        }

        let tuning = self.tuning.resolve()?;
        if let MutatorConfig::Command { command, .. } = &self.mutator {
            if command.is_empty() {
                return Err(ConfigError::Missing("mutator.command"));
            }
        }

        let queries = load_query_set(&queries_file)?;
        let auth = self
            .target
            .auth_token
            .filter(|t| !t.is_empty())
            .map(|token| AuthToken {
                header: database.auth_header().to_string(),
                token,
            });

        Ok(SessionSettings {
            database,
            format,
            binary,
            target_args: self.target.args,
            url,
            auth,
            corpus_dir,
            crash_dir,
            mutation_dir,
            queries,
            bucket,
            seed: self.fuzzing.seed,
            tuning,
            mutator: self.mutator,
        })
    }
}
