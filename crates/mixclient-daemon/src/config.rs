//! Configuration file management.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use mixclient_engine::EngineConfig;
use mixclient_types::MAX_HOPS;
use serde::{Deserialize, Serialize};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "MIXCLIENT_DATA_DIR";

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub pki: PkiConfig,
    #[serde(default)]
    pub mixing: MixingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Local accounts served by this client.
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "error" | "warn" | "info" | "debug" | "trace".
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file path. Empty = stderr.
    #[serde(default)]
    pub file: String,
}

/// Directory authority configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PkiConfig {
    /// Signed consensus document, relative to the data directory.
    #[serde(default = "default_consensus_file")]
    pub consensus_file: String,
    /// Hex Ed25519 public key of the directory authority.
    #[serde(default)]
    pub authority_public_key: String,
    /// Recipient directory, relative to the data directory.
    #[serde(default = "default_user_directory_file")]
    pub user_directory_file: String,
    /// How often to look for the next epoch's consensus.
    #[serde(default = "default_consensus_refresh")]
    pub consensus_refresh_secs: u64,
}

/// Path selection and mixing delays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixingConfig {
    /// Relay hops before the provider.
    #[serde(default = "default_hops")]
    pub hops: usize,
    /// Poisson rate per millisecond.
    #[serde(default = "default_lambda")]
    pub lambda: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u32,
}

/// Send and fetch scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_fetch_interval")]
    pub fetch_interval_secs: u64,
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Data directory. Empty = platform default.
    #[serde(default)]
    pub data_dir: String,
    /// SQLite database file, relative to the data directory.
    #[serde(default = "default_database")]
    pub database: String,
}

/// One `[[accounts]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    /// Provider node name in the consensus.
    pub provider: String,
    /// Hex X25519 private key, relative to the data directory.
    pub identity_key_file: String,
}

// Default value functions

fn default_log_level() -> String {
    "info".to_string()
}

fn default_consensus_file() -> String {
    "consensus.json".to_string()
}

fn default_user_directory_file() -> String {
    "users.json".to_string()
}

fn default_consensus_refresh() -> u64 {
    60
}

fn default_hops() -> usize {
    mixclient_path::DEFAULT_HOPS
}

fn default_lambda() -> f64 {
    mixclient_path::DEFAULT_LAMBDA
}

fn default_max_delay() -> u32 {
    mixclient_path::DEFAULT_MAX_DELAY_MS
}

fn default_fetch_interval() -> u64 {
    7
}

fn default_max_send_attempts() -> u32 {
    5
}

fn default_backoff_base() -> u64 {
    500
}

fn default_backoff_max() -> u64 {
    30_000
}

fn default_send_timeout() -> u64 {
    30
}

fn default_queue_capacity() -> usize {
    256
}

fn default_database() -> String {
    "mixclient.db".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: String::new(),
        }
    }
}

impl Default for PkiConfig {
    fn default() -> Self {
        Self {
            consensus_file: default_consensus_file(),
            authority_public_key: String::new(),
            user_directory_file: default_user_directory_file(),
            consensus_refresh_secs: default_consensus_refresh(),
        }
    }
}

impl Default for MixingConfig {
    fn default() -> Self {
        Self {
            hops: default_hops(),
            lambda: default_lambda(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fetch_interval_secs: default_fetch_interval(),
            max_send_attempts: default_max_send_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            send_timeout_secs: default_send_timeout(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: String::new(),
            database: default_database(),
        }
    }
}

const LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

impl DaemonConfig {
    /// Load configuration from the default config file location.
    ///
    /// Falls back to defaults if the file does not exist.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();
        if config_path.exists() {
            Self::from_file(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: DaemonConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.accounts.is_empty() {
            bail!("no accounts configured");
        }
        let mut names = HashSet::new();
        for account in &self.accounts {
            if !names.insert(account.name.as_str()) {
                bail!("duplicate account name {:?}", account.name);
            }
        }
        if self.mixing.hops == 0 || self.mixing.hops + 1 > MAX_HOPS {
            bail!(
                "mixing.hops must be between 1 and {}, got {}",
                MAX_HOPS - 1,
                self.mixing.hops
            );
        }
        if !(self.mixing.lambda > 0.0 && self.mixing.lambda.is_finite()) {
            bail!("mixing.lambda must be positive, got {}", self.mixing.lambda);
        }
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            bail!("unknown log level {:?}", self.logging.level);
        }
        if self.pki.authority_public_key.is_empty() {
            bail!("pki.authority_public_key is not set");
        }
        Ok(())
    }

    /// The programmatic engine configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            hops: self.mixing.hops,
            lambda: self.mixing.lambda,
            max_delay_ms: self.mixing.max_delay_ms,
            fetch_interval: Duration::from_secs(self.scheduler.fetch_interval_secs),
            max_send_attempts: self.scheduler.max_send_attempts,
            backoff_base: Duration::from_millis(self.scheduler.backoff_base_ms),
            backoff_max: Duration::from_millis(self.scheduler.backoff_max_ms),
            send_timeout: Duration::from_secs(self.scheduler.send_timeout_secs),
            queue_capacity: self.scheduler.queue_capacity,
            ..EngineConfig::default()
        }
    }

    /// Get the data directory path.
    pub fn data_dir(&self) -> PathBuf {
        if self.storage.data_dir.is_empty() {
            Self::default_data_dir()
        } else {
            PathBuf::from(&self.storage.data_dir)
        }
    }

    /// Resolve a configured file name against the data directory.
    pub fn data_path(&self, file: &str) -> PathBuf {
        let path = Path::new(file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir().join(path)
        }
    }

    /// Get the config file path.
    fn config_path() -> PathBuf {
        Self::default_data_dir().join("config.toml")
    }

    /// Platform-specific default data directory.
    fn default_data_dir() -> PathBuf {
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            return PathBuf::from(dir);
        }
        #[cfg(target_os = "macos")]
        {
            dirs_fallback("Library/Application Support/Mixclient")
        }
        #[cfg(not(target_os = "macos"))]
        {
            dirs_fallback(".mixclient")
        }
    }
}

/// Fallback home directory resolution.
fn dirs_fallback(subpath: &str) -> PathBuf {
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(subpath))
        .unwrap_or_else(|_| PathBuf::from("/tmp/mixclient"))
}
