use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::Deserialize;
use tracing::info;

use crate::engine::flow::PollingConfig;
use crate::storage::StateStore;
use crate::storage::json_store::JsonStateStore;
use crate::storage::memory_store::MemoryStateStore;
use crate::storage::sql_store::SqlStateStore;

/// Engine behaviour that does not depend on the store.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Environment name used to pick the state store from the registry.
    pub env: String,
    /// Persist flows that are not marked durable. On in "dev" by default so
    /// every run can be inspected.
    pub persist_non_durable: bool,
    /// Default polling for `wait_for`; its interval also paces `wait_flow_to_complete`.
    pub polling: PollingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            env: "dev".to_string(),
            persist_non_durable: true,
            polling: PollingConfig::default(),
        }
    }
}

/// Which state store implementation to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    Json,
    Sql,
}

impl std::str::FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "memory" => Ok(StoreKind::Memory),
            "json" => Ok(StoreKind::Json),
            "sql" => Ok(StoreKind::Sql),
            _ => anyhow::bail!("Invalid store '{}'. Use: memory, json, sql", s),
        }
    }
}

/// Configuration loaded from `durableflow.yaml`.
/// All fields are optional; missing fields fall back to env/defaults.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DurableFlowConfig {
    pub env: Option<String>,
    pub store: Option<StoreKind>,
    pub store_dir: Option<String>,
    pub database_url: Option<String>,
    pub persist_non_durable: Option<bool>,
    pub poll_interval_ms: Option<u64>,
    pub poll_max_attempts: Option<u32>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_body: Option<usize>,
}

impl DurableFlowConfig {
    /// Load configuration from a YAML file.
    ///
    /// - If `path` is `Some`, load that specific file (error if missing).
    /// - If `path` is `None`, auto-detect `durableflow.yaml` in cwd; return defaults if absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let default_path = Path::new("durableflow.yaml");
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path.to_path_buf()
            }
        };

        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config file: {}", file_path.display()))?;

        let config: DurableFlowConfig = serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", file_path.display()))?;

        Ok(config)
    }

    /// Load the file, then let `DURABLEFLOW_*` environment variables override it.
    pub fn load_with_env(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Override fields from an environment lookup.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = var("DURABLEFLOW_ENV") {
            self.env = Some(v);
        }
        if let Some(v) = var("DURABLEFLOW_STORE") {
            self.store = Some(v.parse()?);
        }
        if let Some(v) = var("DURABLEFLOW_STORE_DIR") {
            self.store_dir = Some(v);
        }
        if let Some(v) = var("DURABLEFLOW_DATABASE_URL") {
            self.database_url = Some(v);
        }
        if let Some(v) = var("DURABLEFLOW_PERSIST_NON_DURABLE") {
            self.persist_non_durable = Some(
                v.parse()
                    .with_context(|| format!("Invalid DURABLEFLOW_PERSIST_NON_DURABLE: {}", v))?,
            );
        }
        if let Some(v) = var("DURABLEFLOW_POLL_INTERVAL_MS") {
            self.poll_interval_ms = Some(
                v.parse()
                    .with_context(|| format!("Invalid DURABLEFLOW_POLL_INTERVAL_MS: {}", v))?,
            );
        }
        if let Some(v) = var("DURABLEFLOW_POLL_MAX_ATTEMPTS") {
            self.poll_max_attempts = Some(
                v.parse()
                    .with_context(|| format!("Invalid DURABLEFLOW_POLL_MAX_ATTEMPTS: {}", v))?,
            );
        }
        if let Some(v) = var("HOST") {
            self.host = Some(v);
        }
        if let Some(v) = var("PORT") {
            self.port = Some(v.parse().with_context(|| format!("Invalid PORT: {}", v))?);
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        let env = self.env.clone().unwrap_or(defaults.env);
        let persist_non_durable = self.persist_non_durable.unwrap_or(env == "dev");
        EngineConfig {
            env,
            persist_non_durable,
            polling: PollingConfig {
                interval: self
                    .poll_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.polling.interval),
                max_attempts: self
                    .poll_max_attempts
                    .unwrap_or(defaults.polling.max_attempts),
            },
        }
    }

    /// Directory of the JSON store.
    pub fn store_dir(&self) -> PathBuf {
        PathBuf::from(self.store_dir.as_deref().unwrap_or("data/flows"))
    }

    /// Open the configured state store. Defaults to the JSON store.
    pub async fn open_store(&self) -> Result<Arc<dyn StateStore>> {
        let store: Arc<dyn StateStore> = match self.store.unwrap_or(StoreKind::Json) {
            StoreKind::Memory => Arc::new(MemoryStateStore::new()),
            StoreKind::Json => Arc::new(JsonStateStore::new(self.store_dir())),
            StoreKind::Sql => {
                let url = self
                    .database_url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("store 'sql' requires database_url"))?;
                Arc::new(SqlStateStore::connect(url).await?)
            }
        };
        Ok(store)
    }

    pub fn bind_addr(&self) -> String {
        format!(
            "{}:{}",
            self.host.as_deref().unwrap_or("0.0.0.0"),
            self.port.unwrap_or(3000)
        )
    }

    pub fn max_body(&self) -> usize {
        self.max_body.unwrap_or(1_048_576)
    }
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (error if missing).
/// Otherwise, auto-detect .env in the current working directory (silently skip if absent).
pub fn load_dotenv(explicit_path: Option<&Path>) -> Result<()> {
    match explicit_path {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("Failed to load dotenv file '{}'", path.display()))?;
            info!("Loaded env from {}", path.display());
        }
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {
                // No .env file, nothing to load
            }
            Err(e) => return Err(e).context("Failed to parse .env file"),
        },
    }
    Ok(())
}
