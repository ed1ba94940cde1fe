//! # drift-config
//!
//! Work-directory resolution, the on-disk layout, and the TOML
//! configuration layer.
//!
//! Configuration is loaded from `$WORK_DIR/etc/config.toml` and then
//! overridden by environment variables. The work directory itself
//! resolves: explicit argument → `DRIFT_WORK_DIR` → `~/.drift`.

pub mod layout;
pub mod logging;

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub use layout::Layout;
pub use logging::{init_logging, LogLevel};

/// Environment variable overriding the work directory.
pub const WORK_DIR_ENV: &str = "DRIFT_WORK_DIR";

static DEFAULT_WORK_DIR: Lazy<PathBuf> = Lazy::new(|| {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".drift")
});

/// Resolve the work directory: explicit argument wins, then the
/// environment, then `~/.drift`.
pub fn resolve_work_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    if let Ok(env) = std::env::var(WORK_DIR_ENV) {
        if !env.is_empty() {
            return PathBuf::from(env);
        }
    }
    DEFAULT_WORK_DIR.clone()
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub fd: FdConfig,
    pub dupcheck: DupcheckConfig,
    pub operator: OperatorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fd: FdConfig::default(),
            dupcheck: DupcheckConfig::default(),
            operator: OperatorConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration for a work directory.
    pub fn load(work_dir: &Path) -> Result<Self> {
        let mut config = Config::default();
        let path = Layout::new(work_dir).config_file;
        if path.exists() {
            debug!(path = %path.display(), "loading config");
            let contents = std::fs::read_to_string(&path)?;
            config = toml::from_str(&contents)?;
        }
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DRIFT_MAX_SHUTDOWN_TIME") {
            if let Ok(n) = v.parse() {
                self.fd.max_shutdown_time = n;
            }
        }
        if let Ok(v) = std::env::var("DRIFT_OPERATOR_PORT") {
            if let Ok(n) = v.parse() {
                self.operator.port = n;
            }
        }
        if let Ok(v) = std::env::var("DRIFT_WORKER_COMMAND") {
            if !v.is_empty() {
                self.fd.worker_command = v;
            }
        }
    }

    /// Default configuration rendered as TOML, for `etc/config.toml`
    /// bootstrapping.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// Dispatch supervisor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FdConfig {
    /// Upper bound for the shutdown drain, seconds.
    pub max_shutdown_time: u64,
    /// Grace slice reserved for the kill pass, seconds.
    pub min_shutdown_time: u64,
    /// Fallback retry interval when a host record carries none.
    pub default_retry_interval: u32,
    /// Command spawned per dispatched message.
    pub worker_command: String,
    /// Escalate repaired counter drift to an event record.
    pub strict_accounting: bool,
}

impl Default for FdConfig {
    fn default() -> Self {
        Self {
            max_shutdown_time: 600,
            min_shutdown_time: 10,
            default_retry_interval: 120,
            worker_command: "drift-worker".to_string(),
            strict_accounting: false,
        }
    }
}

/// Duplicate-check defaults handed to hosts without explicit settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DupcheckConfig {
    pub enabled: bool,
    /// Entry lifetime in seconds; clamped by the store's window at
    /// parse time.
    pub timeout: i64,
}

impl Default for DupcheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout: 7 * 86_400,
        }
    }
}

/// Operator TCP service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1".to_string(),
            port: 4548,
        }
    }
}
