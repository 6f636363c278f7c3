//! Engine configuration via `strata-stm.toml`
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working engine. Values are validated eagerly on load.

use super::transactions::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use strata_core::{StmError, StmResult, MAX_THREADS};

/// Conventional config file name.
pub const CONFIG_FILE_NAME: &str = "strata-stm.toml";

fn default_maintenance_interval_ms() -> u64 {
    100
}

fn default_stale_reader_warn_ms() -> u64 {
    30_000
}

fn default_max_threads() -> usize {
    MAX_THREADS - 1
}

/// Engine configuration loaded from TOML.
///
/// # Example
///
/// ```toml
/// background_maintenance = true
/// maintenance_interval_ms = 100
/// max_threads = 127
/// stale_reader_warn_ms = 30000
///
/// [retry]
/// max_retries = 64
/// base_delay_ms = 1
/// max_delay_ms = 10
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StmConfig {
    /// Retry policy used by [`Stm::atomically`](crate::Stm::atomically).
    #[serde(default)]
    pub retry: RetryConfig,
    /// Period of the background maintenance pass.
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,
    /// Start the maintenance thread when the engine is created.
    #[serde(default)]
    pub background_maintenance: bool,
    /// Number of distinct worker ids handed out to transactions.
    ///
    /// Bounded by the version word's thread-id field; id 0 is kept for
    /// non-transactional writers.
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    /// Maintenance warns about transactions open longer than this.
    #[serde(default = "default_stale_reader_warn_ms")]
    pub stale_reader_warn_ms: u64,
}

impl Default for StmConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            maintenance_interval_ms: default_maintenance_interval_ms(),
            background_maintenance: false,
            max_threads: default_max_threads(),
            stale_reader_warn_ms: default_stale_reader_warn_ms(),
        }
    }
}

impl StmConfig {
    /// Check field ranges.
    ///
    /// # Errors
    ///
    /// Returns `StmError::Config` describing the first invalid field.
    pub fn validate(&self) -> StmResult<()> {
        if self.max_threads == 0 || self.max_threads >= MAX_THREADS {
            return Err(StmError::Config(format!(
                "max_threads must be in 1..={}, got {}",
                MAX_THREADS - 1,
                self.max_threads
            )));
        }
        if self.maintenance_interval_ms == 0 {
            return Err(StmError::Config(
                "maintenance_interval_ms must be positive".to_string(),
            ));
        }
        if self.stale_reader_warn_ms == 0 {
            return Err(StmError::Config(
                "stale_reader_warn_ms must be positive".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(StmError::Config(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        Ok(())
    }

    /// Parse and validate config text.
    ///
    /// # Errors
    ///
    /// Returns `StmError::Config` if the text is not valid TOML for this
    /// schema or a value is out of range.
    pub fn from_toml_str(content: &str) -> StmResult<Self> {
        let config: StmConfig = toml::from_str(content)
            .map_err(|e| StmError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> StmResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StmError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            StmError::Config(msg) => StmError::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> StmResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| StmError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            StmError::Config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Strata STM configuration
#
# Run history compaction, MVCC garbage collection and epoch reclamation
# on a background thread (default: false; call Stm::run_maintenance otherwise)
background_maintenance = false

# Period of the maintenance pass in milliseconds
maintenance_interval_ms = 100

# Distinct worker ids stamped into version words (1..=127)
max_threads = 127

# Warn when a transaction stays open longer than this (milliseconds)
stale_reader_warn_ms = 30000

# Retry policy for Stm::atomically
[retry]
max_retries = 64
base_delay_ms = 1
max_delay_ms = 10
"#
    }
}
