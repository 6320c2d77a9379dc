use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level process configuration, loaded from `ling-core.toml` with
/// environment-variable overrides for the handful of values §6 names
/// explicitly (`BASE_URL`, `REGISTRY_URL`, `DEV_MODE`).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub agent_runner: AgentRunnerConfig,
    #[serde(default)]
    pub warm_pool: WarmPoolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// `REGISTRY_URL` — base URL the Kit Store's registry-fetch operation downloads from.
    #[serde(default)]
    pub registry_url: Option<String>,
    /// `BASE_URL` — the host address containers use to reach the bridge (`host.docker.internal`-style).
    #[serde(default)]
    pub base_url: Option<String>,
    /// `DEV_MODE` — keep containers around after exit for inspection.
    #[serde(default)]
    pub dev_mode: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StorageConfig {
    pub kits_dir: PathBuf,
    pub workspace_seeds_dir: PathBuf,
    pub workspaces_dir: PathBuf,
    pub venvs_dir: PathBuf,
    pub db_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kits_dir: crate::paths::kits_dir(),
            workspace_seeds_dir: crate::paths::workspace_seeds_dir(),
            workspaces_dir: crate::paths::workspaces_dir(),
            venvs_dir: crate::paths::venvs_dir(),
            db_dir: crate::paths::db_dir(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BridgeConfig {
    pub bind_addr: String,
    pub port: u16,
    /// §5 "Bridge RPC: 300s ceiling per call."
    pub rpc_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 7762,
            rpc_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AgentRunnerConfig {
    /// §4.H "optional per-invocation timeout (default 600 s)"
    pub default_timeout_secs: u64,
    /// Poll interval for the supervisor loop (§4.H step 6).
    pub poll_interval_ms: u64,
}

impl Default for AgentRunnerConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 600,
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WarmPoolConfig {
    /// §4.G "idle for more than the configured timeout (default 900 s)"
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for WarmPoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 900,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub directory: Option<String>,
    pub retention_days: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            bridge: BridgeConfig::default(),
            agent_runner: AgentRunnerConfig::default(),
            warm_pool: WarmPoolConfig::default(),
            logging: LoggingConfig::default(),
            registry_url: std::env::var("REGISTRY_URL").ok(),
            base_url: std::env::var("BASE_URL").ok(),
            dev_mode: std::env::var("DEV_MODE").map(|v| v == "1" || v == "true").unwrap_or(false),
        }
    }
}

impl Config {
    /// Loads `ling-core.toml` from the current directory, falling back to
    /// defaults when absent. Returns the path it loaded from, if any.
    pub fn load_with_path() -> Result<(Self, Option<PathBuf>)> {
        let path = Path::new("ling-core.toml");
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| CoreError::DbError(format!("failed to read {path:?}: {e}")))?;
            let mut config: Config = toml::from_str(&content)
                .map_err(|e| CoreError::DbError(format!("failed to parse {path:?}: {e}")))?;
            if config.registry_url.is_none() {
                config.registry_url = std::env::var("REGISTRY_URL").ok();
            }
            if config.base_url.is_none() {
                config.base_url = std::env::var("BASE_URL").ok();
            }
            Ok((config, Some(path.to_path_buf())))
        } else {
            Ok((Config::default(), None))
        }
    }

    /// Fatal-at-startup check: §5 "Encryption key: read once at process
    /// start; absence is fatal."
    pub fn require_encryption_key(&self) -> Result<[u8; 32]> {
        crate::crypto::load_key_from_env()
    }
}
