//! Application configuration for the item relationship engine.
//!
//! User config lives at `~/.irs/irs.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IrsError, Result};
use crate::types::{BomLifecycle, Direction, MAX_TREE_DEPTH};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "irs.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".irs";

// ---------------------------------------------------------------------------
// Config structs (matching irs.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Defaults applied to job requests that leave a field unset.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Worker pool and crawl limits.
    #[serde(default)]
    pub engine: EngineSection,

    /// Collaborator selection and endpoints.
    #[serde(default)]
    pub clients: ClientsConfig,

    /// Optional known-subtree store.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Traversal depth when a request sets none.
    #[serde(default = "default_depth")]
    pub depth: u32,

    #[serde(default)]
    pub direction: Direction,

    #[serde(default)]
    pub bom_lifecycle: BomLifecycle,

    /// Wall-clock limit of a single job.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            depth: default_depth(),
            direction: Direction::default(),
            bom_lifecycle: BomLifecycle::default(),
            job_timeout_secs: default_job_timeout_secs(),
        }
    }
}

fn default_depth() -> u32 {
    MAX_TREE_DEPTH
}
fn default_job_timeout_secs() -> u64 {
    3600
}

/// `[engine]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Jobs running in parallel; further jobs queue.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Sibling nodes enriched concurrently within one job.
    #[serde(default = "default_per_job_fanout")]
    pub per_job_fanout: usize,

    /// How long a timed-out crawl may take to wind down.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    /// Terminal jobs older than this are pruned from the registry.
    #[serde(default = "default_retention_hours")]
    pub terminal_job_retention_hours: u64,

    /// Extra attempts for a collaborator call that failed in transport.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry; doubles on every further attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            per_job_fanout: default_per_job_fanout(),
            grace_period_secs: default_grace_period_secs(),
            terminal_job_retention_hours: default_retention_hours(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_worker_pool_size() -> usize {
    8
}
fn default_per_job_fanout() -> usize {
    4
}
fn default_grace_period_secs() -> u64 {
    5
}
fn default_retention_hours() -> u64 {
    24
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    500
}

/// Which collaborator implementations to wire at process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientProfile {
    /// In-memory stubs, no network.
    #[default]
    Stub,
    /// HTTP clients against the configured services.
    Live,
}

/// `[clients]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientsConfig {
    #[serde(default)]
    pub profile: ClientProfile,

    /// Digital twin registry base URL.
    #[serde(default)]
    pub registry_url: String,

    /// Semantics hub base URL (JSON schemas).
    #[serde(default)]
    pub semantics_hub_url: String,

    /// Business partner data management base URL.
    #[serde(default)]
    pub bpdm_url: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ClientsConfig {
    fn default() -> Self {
        Self {
            profile: ClientProfile::default(),
            registry_url: String::new(),
            semantics_hub_url: String::new(),
            bpdm_url: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// `[storage]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// libSQL database holding edges of finished jobs. Unset disables the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_subtree_db: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Engine config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Bounded retry of collaborator calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Every call gets exactly one attempt.
    pub const NONE: Self = Self {
        max_retries: 0,
        backoff: Duration::ZERO,
    };

    /// Delay before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        self.backoff.saturating_mul(1u32 << retry.min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff: Duration::from_millis(default_retry_backoff_ms()),
        }
    }
}

/// Runtime engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub worker_pool_size: usize,
    pub per_job_fanout: usize,
    pub grace_period: Duration,
    pub default_job_timeout: Duration,
    pub terminal_job_retention: Duration,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for EngineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            worker_pool_size: config.engine.worker_pool_size.max(1),
            per_job_fanout: config.engine.per_job_fanout.max(1),
            grace_period: Duration::from_secs(config.engine.grace_period_secs),
            default_job_timeout: Duration::from_secs(config.defaults.job_timeout_secs),
            terminal_job_retention: Duration::from_secs(
                config.engine.terminal_job_retention_hours * 3600,
            ),
            retry: RetryPolicy {
                max_retries: config.engine.max_retries,
                backoff: Duration::from_millis(config.engine.retry_backoff_ms),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.irs/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| IrsError::configuration("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.irs/irs.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| IrsError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        IrsError::configuration(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Reject configurations the engine cannot run with.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.clients.profile == ClientProfile::Live {
        for (name, value) in [
            ("registry_url", &config.clients.registry_url),
            ("semantics_hub_url", &config.clients.semantics_hub_url),
        ] {
            if url::Url::parse(value).is_err() {
                return Err(IrsError::configuration(format!(
                    "clients.{name} must be an absolute URL for the live profile, got '{value}'"
                )));
            }
        }
    }
    Ok(())
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| IrsError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| IrsError::configuration(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| IrsError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("worker_pool_size"));
        assert!(toml_str.contains("profile = \"stub\""));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.defaults.depth, MAX_TREE_DEPTH);
        assert_eq!(parsed.engine.per_job_fanout, 4);
    }

    #[test]
    fn partial_config_uses_defaults() {
        let toml_str = r#"
[engine]
worker_pool_size = 2

[clients]
profile = "live"
registry_url = "https://registry.example.com"
semantics_hub_url = "https://semantics.example.com"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.engine.worker_pool_size, 2);
        assert_eq!(config.engine.grace_period_secs, 5);
        assert_eq!(config.clients.profile, ClientProfile::Live);
        assert_eq!(config.defaults.direction, Direction::Downward);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn live_profile_requires_urls() {
        let mut config = AppConfig::default();
        config.clients.profile = ClientProfile::Live;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("registry_url"));
    }

    #[test]
    fn engine_config_from_app_config() {
        let app = AppConfig::default();
        let engine = EngineConfig::from(&app);
        assert_eq!(engine.worker_pool_size, 8);
        assert_eq!(engine.grace_period, Duration::from_secs(5));
        assert_eq!(engine.default_job_timeout, Duration::from_secs(3600));
        assert_eq!(engine.terminal_job_retention, Duration::from_secs(24 * 3600));
        assert_eq!(engine.retry, RetryPolicy::default());
    }

    #[test]
    fn retry_backoff_doubles() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(RetryPolicy::NONE.delay(5), Duration::ZERO);
    }
}
