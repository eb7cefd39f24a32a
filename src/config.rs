//! Configuration loader and validator for the parts-desk sync engine.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub shop: Shop,
    pub sync: Sync,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
}

/// Remote shop API settings. The token is kept out of all log output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Shop {
    pub base_url: String,
    pub access_token: String,
    pub api_version: String,
}

/// Sync pipeline tunables. Batch size and delays control throughput against
/// the remote rate limit; any batch size >= 1 produces the same end state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sync {
    pub batch_size: usize,
    pub page_size: usize,
    pub batch_delay_ms: u64,
    pub retry_delay_ms: u64,
    pub status_stale_secs: u64,
    pub verify_min_interval_secs: u64,
    pub audit_log_cap: usize,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

impl Sync {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }

    if cfg.shop.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("shop.base_url must be non-empty"));
    }
    if cfg.shop.access_token.trim().is_empty() {
        return Err(ConfigError::Invalid("shop.access_token must be non-empty"));
    }
    if cfg.shop.api_version.trim().is_empty() {
        return Err(ConfigError::Invalid("shop.api_version must be non-empty"));
    }

    if cfg.sync.batch_size == 0 {
        return Err(ConfigError::Invalid("sync.batch_size must be >= 1"));
    }
    if cfg.sync.page_size == 0 {
        return Err(ConfigError::Invalid("sync.page_size must be >= 1"));
    }
    if cfg.sync.status_stale_secs == 0 {
        return Err(ConfigError::Invalid("sync.status_stale_secs must be > 0"));
    }
    if cfg.sync.audit_log_cap == 0 {
        return Err(ConfigError::Invalid("sync.audit_log_cap must be > 0"));
    }

    Ok(())
}

/// Example YAML configuration with defaults explained inline.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 1000

shop:
  base_url: "https://example.myshopify.com"
  access_token: "YOUR_SHOP_ACCESS_TOKEN"
  api_version: "2024-01"

sync:
  batch_size: 5
  page_size: 50
  batch_delay_ms: 500
  retry_delay_ms: 2000
  status_stale_secs: 300
  verify_min_interval_secs: 5
  audit_log_cap: 500
"#
}
