//! Sweep configuration
//!
//! Everything a run needs is resolved into an immutable [`SweepConfig`] before
//! enumeration begins. Values come from the environment (and an optional
//! `.env` file), then CLI overrides; [`SweepConfigBuilder::build`] reports all
//! missing required settings at once.

use objsweep_common::{Result, SweepError};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::builder::IDENTITY_COLUMNS;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Column holding the identifying value used for skip detection.
pub const DEFAULT_DEDUP_COLUMN: &str = "file_name";

/// Default number of concurrent fetch+build workers (sequential).
pub const DEFAULT_WORKERS: usize = 1;

/// Upper bound on workers; beyond this S3 throttling dominates.
pub const MAX_WORKERS: usize = 64;

/// Default PostgreSQL port.
pub const DEFAULT_DB_PORT: u16 = 5432;

/// Default maximum database connections in the pool.
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 4;

/// Default database connection timeout in seconds.
pub const DEFAULT_DB_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default number of retries for a failed batch under the retry policy.
pub const DEFAULT_PERSIST_RETRIES: u32 = 3;

/// Default base backoff between batch retries in milliseconds.
pub const DEFAULT_PERSIST_BACKOFF_MS: u64 = 500;

/// Default S3 region.
pub const DEFAULT_S3_REGION: &str = "us-east-1";

/// What to do when fetching or building one object fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectFailurePolicy {
    /// Log the key and continue with the next object
    #[default]
    Skip,
    Abort,
}

impl FromStr for ObjectFailurePolicy {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "skip" | "continue" => Ok(ObjectFailurePolicy::Skip),
            "abort" => Ok(ObjectFailurePolicy::Abort),
            _ => Err(SweepError::config(format!("Invalid object failure policy: {}", s))),
        }
    }
}

/// What to do with a record when a content-analysis extension fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisFailurePolicy {
    /// Keep the record; the failed extension's columns are persisted as NULL
    #[default]
    PersistPartial,
    /// Drop the whole record
    Drop,
}

impl FromStr for AnalysisFailurePolicy {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "persist-partial" | "partial" => Ok(AnalysisFailurePolicy::PersistPartial),
            "drop" => Ok(AnalysisFailurePolicy::Drop),
            _ => Err(SweepError::config(format!("Invalid analysis failure policy: {}", s))),
        }
    }
}

/// What to do when a batch fails to persist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum PersistFailurePolicy {
    /// Stop the sweep
    #[default]
    Abort,
    /// Retry the batch with linear backoff; once retries are exhausted, log
    /// every record key as dropped and continue the sweep
    Retry { max_retries: u32, backoff_ms: u64 },
}

impl PersistFailurePolicy {
    pub fn retry(max_retries: u32, backoff: Duration) -> Self {
        PersistFailurePolicy::Retry {
            max_retries,
            backoff_ms: backoff.as_millis() as u64,
        }
    }
}

/// What to do when the dedup index cannot be loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DedupFailurePolicy {
    #[default]
    Abort,
    /// Continue with an empty index, treating every object as new
    Proceed,
}

impl FromStr for DedupFailurePolicy {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "abort" => Ok(DedupFailurePolicy::Abort),
            "proceed" | "no-dedup" => Ok(DedupFailurePolicy::Proceed),
            _ => Err(SweepError::config(format!("Invalid dedup failure policy: {}", s))),
        }
    }
}

/// S3 connection settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Custom endpoint (MinIO, LocalStack); `None` for AWS
    pub endpoint: Option<String>,
    pub region: String,
    /// Named profile from ~/.aws/config
    pub profile: Option<String>,
    pub access_key: Option<String>,
    #[serde(skip_serializing)]
    pub secret_key: Option<String>,
    pub path_style: bool,
}

impl StorageConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: env_opt("S3_ENDPOINT"),
            region: env_opt("S3_REGION").unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
            profile: env_opt("S3_PROFILE").or_else(|| env_opt("AWS_PROFILE")),
            access_key: env_opt("S3_ACCESS_KEY").or_else(|| env_opt("AWS_ACCESS_KEY_ID")),
            secret_key: env_opt("S3_SECRET_KEY").or_else(|| env_opt("AWS_SECRET_ACCESS_KEY")),
            path_style: env_opt("S3_PATH_STYLE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        }
    }

    pub fn for_minio(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: DEFAULT_S3_REGION.to_string(),
            profile: None,
            access_key: Some("minioadmin".to_string()),
            secret_key: Some("minioadmin".to_string()),
            path_style: true,
        }
    }
}

/// Destination database settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_DB_PORT,
            name: "postgres".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DB_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl DatabaseConfig {
    /// Connection options assembled field by field, so credentials need no
    /// URL escaping
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.name)
            .username(&self.user)
            .password(&self.password)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Immutable configuration for one sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    pub bucket: String,
    pub prefix: String,
    pub table: String,
    pub download_dir: PathBuf,
    pub batch_size: usize,
    pub dedup_limit: i64,
    pub dedup_column: String,
    pub workers: usize,
    pub on_object_failure: ObjectFailurePolicy,
    pub on_analysis_failure: AnalysisFailurePolicy,
    pub on_persist_failure: PersistFailurePolicy,
    pub on_dedup_failure: DedupFailurePolicy,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
}

impl SweepConfig {
    pub fn builder() -> SweepConfigBuilder {
        SweepConfigBuilder::default()
    }

    /// Load from the environment (and `.env`), failing on any missing field
    pub fn from_env() -> Result<Self> {
        SweepConfigBuilder::from_env()?.build()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.bucket.trim().is_empty() {
            return Err(SweepError::config("Bucket name cannot be empty"));
        }

        if self.batch_size == 0 {
            return Err(SweepError::config("Batch size must be greater than 0"));
        }

        if self.dedup_limit <= 0 {
            return Err(SweepError::config("Dedup limit must be greater than 0"));
        }

        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(SweepError::config(format!(
                "Workers must be between 1 and {} (got {})",
                MAX_WORKERS, self.workers
            )));
        }

        if self.download_dir.as_os_str().is_empty() {
            return Err(SweepError::config("Download directory cannot be empty"));
        }

        if self.database.max_connections == 0 {
            return Err(SweepError::config("Database max_connections must be greater than 0"));
        }

        validate_identifier(&self.table)?;
        validate_identifier(&self.dedup_column)?;

        if !IDENTITY_COLUMNS.contains(&self.dedup_column.as_str()) {
            return Err(SweepError::config(format!(
                "Dedup column must be one of [{}] (got {})",
                IDENTITY_COLUMNS.join(", "),
                self.dedup_column
            )));
        }

        Ok(())
    }
}

/// Accumulates settings from the environment and CLI before validation
#[derive(Debug, Clone, Default)]
pub struct SweepConfigBuilder {
    pub bucket: Option<String>,
    pub prefix: Option<String>,
    pub table: Option<String>,
    pub download_dir: Option<PathBuf>,
    pub batch_size: Option<usize>,
    pub dedup_limit: Option<i64>,
    pub dedup_column: Option<String>,
    pub workers: Option<usize>,
    pub on_object_failure: Option<ObjectFailurePolicy>,
    pub on_analysis_failure: Option<AnalysisFailurePolicy>,
    pub on_persist_failure: Option<PersistFailurePolicy>,
    pub on_dedup_failure: Option<DedupFailurePolicy>,
    pub db_host: Option<String>,
    pub db_port: Option<u16>,
    pub db_name: Option<String>,
    pub db_user: Option<String>,
    pub db_password: Option<String>,
    pub db_max_connections: Option<u32>,
    pub storage: Option<StorageConfig>,
}

impl SweepConfigBuilder {
    /// Read every `SWEEP_*`, `DB_*` and `S3_*` variable that is set
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let on_persist_failure = match env_opt("SWEEP_ON_PERSIST_FAILURE").as_deref() {
            None => None,
            Some("abort") => Some(PersistFailurePolicy::Abort),
            Some("retry") => Some(PersistFailurePolicy::Retry {
                max_retries: env_parse("SWEEP_PERSIST_RETRIES")?
                    .unwrap_or(DEFAULT_PERSIST_RETRIES),
                backoff_ms: env_parse("SWEEP_PERSIST_BACKOFF_MS")?
                    .unwrap_or(DEFAULT_PERSIST_BACKOFF_MS),
            }),
            Some(other) => {
                return Err(SweepError::config(format!(
                    "Invalid persist failure policy: {}",
                    other
                )))
            },
        };

        Ok(Self {
            bucket: env_opt("SWEEP_BUCKET"),
            prefix: std::env::var("SWEEP_PREFIX").ok(),
            table: env_opt("SWEEP_TABLE"),
            download_dir: env_opt("SWEEP_DOWNLOAD_DIR").map(PathBuf::from),
            batch_size: env_parse("SWEEP_BATCH_SIZE")?,
            dedup_limit: env_parse("SWEEP_DEDUP_LIMIT")?,
            dedup_column: env_opt("SWEEP_DEDUP_COLUMN"),
            workers: env_parse("SWEEP_WORKERS")?,
            on_object_failure: env_parse("SWEEP_ON_OBJECT_FAILURE")?,
            on_analysis_failure: env_parse("SWEEP_ON_ANALYSIS_FAILURE")?,
            on_persist_failure,
            on_dedup_failure: env_parse("SWEEP_ON_DEDUP_FAILURE")?,
            db_host: env_opt("DB_HOST"),
            db_port: env_parse("DB_PORT")?,
            db_name: env_opt("DB_NAME"),
            db_user: env_opt("DB_USER"),
            db_password: std::env::var("DB_PASSWORD").ok(),
            db_max_connections: env_parse("DB_MAX_CONNECTIONS")?,
            storage: Some(StorageConfig::from_env()),
        })
    }

    /// Resolve into a validated config, listing every missing required field
    pub fn build(self) -> Result<SweepConfig> {
        let mut missing = Vec::new();

        let bucket = require(self.bucket, "bucket (SWEEP_BUCKET)", &mut missing);
        let prefix = require(self.prefix, "prefix (SWEEP_PREFIX)", &mut missing);
        let table = require(self.table, "table (SWEEP_TABLE)", &mut missing);
        let download_dir = require(
            self.download_dir,
            "download directory (SWEEP_DOWNLOAD_DIR)",
            &mut missing,
        );
        let batch_size = require(self.batch_size, "batch size (SWEEP_BATCH_SIZE)", &mut missing);
        let dedup_limit = require(self.dedup_limit, "dedup limit (SWEEP_DEDUP_LIMIT)", &mut missing);
        let db_host = require(self.db_host, "database host (DB_HOST)", &mut missing);
        let db_name = require(self.db_name, "database name (DB_NAME)", &mut missing);
        let db_user = require(self.db_user, "database user (DB_USER)", &mut missing);
        let db_password = require(self.db_password, "database password (DB_PASSWORD)", &mut missing);

        if !missing.is_empty() {
            return Err(SweepError::config(format!(
                "Missing required settings: {}",
                missing.join(", ")
            )));
        }

        let config = SweepConfig {
            bucket: bucket.unwrap_or_default(),
            prefix: prefix.unwrap_or_default(),
            table: table.unwrap_or_default(),
            download_dir: download_dir.unwrap_or_default(),
            batch_size: batch_size.unwrap_or_default(),
            dedup_limit: dedup_limit.unwrap_or_default(),
            dedup_column: self
                .dedup_column
                .unwrap_or_else(|| DEFAULT_DEDUP_COLUMN.to_string()),
            workers: self.workers.unwrap_or(DEFAULT_WORKERS),
            on_object_failure: self.on_object_failure.unwrap_or_default(),
            on_analysis_failure: self.on_analysis_failure.unwrap_or_default(),
            on_persist_failure: self.on_persist_failure.unwrap_or_default(),
            on_dedup_failure: self.on_dedup_failure.unwrap_or_default(),
            database: DatabaseConfig {
                host: db_host.unwrap_or_default(),
                port: self.db_port.unwrap_or(DEFAULT_DB_PORT),
                name: db_name.unwrap_or_default(),
                user: db_user.unwrap_or_default(),
                password: db_password.unwrap_or_default(),
                max_connections: self
                    .db_max_connections
                    .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS),
                connect_timeout_secs: DEFAULT_DB_CONNECT_TIMEOUT_SECS,
            },
            storage: self.storage.unwrap_or_else(|| StorageConfig {
                region: DEFAULT_S3_REGION.to_string(),
                ..StorageConfig::default()
            }),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Accepts `name` or `schema.name` where each part is `[A-Za-z_][A-Za-z0-9_]*`.
///
/// Table and column names are interpolated into SQL text, so anything else is
/// rejected outright.
pub fn validate_identifier(identifier: &str) -> Result<()> {
    let parts: Vec<&str> = identifier.split('.').collect();
    let valid = parts.len() <= 2
        && parts.iter().all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });

    if valid {
        Ok(())
    } else {
        Err(SweepError::InvalidIdentifier(identifier.to_string()))
    }
}

fn require<T>(value: Option<T>, name: &str, missing: &mut Vec<String>) -> Option<T> {
    if value.is_none() {
        missing.push(name.to_string());
    }
    value
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_opt(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| SweepError::config(format!("Invalid value for {}: {}", name, e))),
    }
}
