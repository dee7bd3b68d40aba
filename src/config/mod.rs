/// Configuration system for commit-sync
///
/// Supports loading from multiple sources with priority:
/// CLI args > Environment variables > Config file > Defaults
use crate::error::{ConfigError, SyncError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Relational store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Clone/pull configuration
    #[serde(default)]
    pub connector: ConnectorConfig,

    /// History walk and batch write configuration
    #[serde(default)]
    pub ingestion: IngestionConfig,

    /// Background worker configuration
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Relational store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// How long a connection waits on a locked database (milliseconds)
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

/// Clone/pull configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Directory that repositories registered by URL are cloned into
    #[serde(default = "default_clone_root")]
    pub clone_root: PathBuf,

    /// Seconds without transfer progress before a stall advisory is emitted
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Hosting domains accepted as clone sources (besides `.git` URLs)
    #[serde(default = "default_allowed_hosts")]
    pub allowed_hosts: Vec<String>,

    /// Credential callback attempts before authentication is reported failed
    #[serde(default = "default_credential_attempts")]
    pub credential_attempts: u32,
}

/// History walk and batch write configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Default cap on commits visited per analyze run (None = whole history)
    #[serde(default)]
    pub max_commits: Option<usize>,

    /// Cap for the slow-path commit count used for progress math
    #[serde(default = "default_count_cap")]
    pub count_cap: usize,

    /// Fixed batch size; when unset the size is chosen from the history size
    #[serde(default)]
    pub batch_size: Option<usize>,

    /// Files kept per commit when a batch falls back to single inserts
    #[serde(default = "default_fallback_file_cap")]
    pub fallback_file_cap: usize,

    /// Label commits with the branch whose first-parent chain contains them
    #[serde(default = "default_label_branches")]
    pub label_branches: bool,

    /// Derive role/team of new contributors from their email address
    #[serde(default)]
    pub infer_contributor_attributes: bool,
}

/// Background worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum number of clone/pull/analyze runs executing at once
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// Seconds to wait for another process's lock on the same repository
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,

    /// Capacity of the broadcast event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Directory holding the cross-process run lock files
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
}

// Default value functions
fn default_database_path() -> PathBuf {
    crate::paths::PlatformPaths::default_database_path()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_clone_root() -> PathBuf {
    crate::paths::PlatformPaths::default_clone_root()
}

fn default_idle_timeout_secs() -> u64 {
    300 // 5 minutes
}

fn default_allowed_hosts() -> Vec<String> {
    vec![
        "github.com".to_string(),
        "gitlab.com".to_string(),
        "bitbucket.org".to_string(),
    ]
}

fn default_credential_attempts() -> u32 {
    3
}

fn default_count_cap() -> usize {
    50_000
}

fn default_fallback_file_cap() -> usize {
    100
}

fn default_label_branches() -> bool {
    true
}

fn default_max_concurrent_runs() -> usize {
    4
}

fn default_lock_timeout_secs() -> u64 {
    30
}

fn default_event_capacity() -> usize {
    1024
}

fn default_lock_dir() -> PathBuf {
    crate::paths::PlatformPaths::default_lock_dir()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            clone_root: default_clone_root(),
            idle_timeout_secs: default_idle_timeout_secs(),
            allowed_hosts: default_allowed_hosts(),
            credential_attempts: default_credential_attempts(),
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_commits: None,
            count_cap: default_count_cap(),
            batch_size: None,
            fallback_file_cap: default_fallback_file_cap(),
            label_branches: default_label_branches(),
            infer_contributor_attributes: false,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: default_max_concurrent_runs(),
            lock_timeout_secs: default_lock_timeout_secs(),
            event_capacity: default_event_capacity(),
            lock_dir: default_lock_dir(),
        }
    }
}

impl ConnectorConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl RuntimeConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> Result<Self, SyncError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::LoadFailed(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseFailed(format!("Invalid TOML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default location or create default
    pub fn load_or_default() -> Result<Self, SyncError> {
        let config_path = crate::paths::PlatformPaths::default_config_path();

        if config_path.exists() {
            tracing::info!("Loading config from: {}", config_path.display());
            Self::from_file(&config_path)
        } else {
            tracing::info!("No config file found, using defaults");
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), SyncError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ConfigError::SaveFailed(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SaveFailed(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| ConfigError::SaveFailed(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved config to: {}", path.display());
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), SyncError> {
        fn positive(key: &str, value: u64) -> Result<(), SyncError> {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: "must be greater than 0".to_string(),
                }
                .into());
            }
            Ok(())
        }

        positive("connector.idle_timeout_secs", self.connector.idle_timeout_secs)?;
        positive(
            "connector.credential_attempts",
            u64::from(self.connector.credential_attempts),
        )?;
        positive("ingestion.count_cap", self.ingestion.count_cap as u64)?;
        positive(
            "ingestion.fallback_file_cap",
            self.ingestion.fallback_file_cap as u64,
        )?;
        positive(
            "runtime.max_concurrent_runs",
            self.runtime.max_concurrent_runs as u64,
        )?;
        positive("runtime.event_capacity", self.runtime.event_capacity as u64)?;

        if let Some(batch_size) = self.ingestion.batch_size {
            positive("ingestion.batch_size", batch_size as u64)?;
        }
        if let Some(max_commits) = self.ingestion.max_commits {
            positive("ingestion.max_commits", max_commits as u64)?;
        }

        if self.store.database_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "store.database_path".to_string(),
                reason: "must not be empty".to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("COMMIT_SYNC_DATABASE") {
            self.store.database_path = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("COMMIT_SYNC_CLONE_ROOT") {
            self.connector.clone_root = PathBuf::from(path);
        }

        if let Ok(secs) = std::env::var("COMMIT_SYNC_IDLE_TIMEOUT_SECS")
            && let Ok(secs) = secs.parse()
        {
            self.connector.idle_timeout_secs = secs;
        }

        if let Ok(max) = std::env::var("COMMIT_SYNC_MAX_COMMITS")
            && let Ok(max) = max.parse()
        {
            self.ingestion.max_commits = Some(max);
        }

        if let Ok(size) = std::env::var("COMMIT_SYNC_BATCH_SIZE")
            && let Ok(size) = size.parse()
        {
            self.ingestion.batch_size = Some(size);
        }

        if let Ok(runs) = std::env::var("COMMIT_SYNC_MAX_CONCURRENT_RUNS")
            && let Ok(runs) = runs.parse()
        {
            self.runtime.max_concurrent_runs = runs;
        }
    }

    /// Create a new Config with defaults and environment overrides
    pub fn new() -> Result<Self, SyncError> {
        let mut config = Self::load_or_default()?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}
