use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use aideon_tempo_core::{TempoError, TempoResult};

const DEFAULT_CONFIG_NAME: &str = "tempo.json";
const DEFAULT_DB_NAME: &str = "tempo.sqlite";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Memory,
    Sqlite { path: Option<String> },
    Postgres { url: String },
    Mysql { url: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
    pub acquire_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
}

/// How `preload` treats associations whose scope depends on the owning record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreloadPolicy {
    /// Evaluate the scope once per owner, as lazy traversal would.
    #[default]
    PerOwner,
    /// Reject them, as eager loading does.
    Disallow,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempoConfig {
    pub database: DatabaseConfig,
    pub pool: Option<PoolConfig>,
    pub preload_policy: Option<PreloadPolicy>,
    pub model_manifest: Option<String>,
}

impl TempoConfig {
    pub fn default_sqlite(path: impl Into<String>) -> Self {
        Self {
            database: DatabaseConfig::Sqlite {
                path: Some(path.into()),
            },
            pool: None,
            preload_policy: Some(PreloadPolicy::PerOwner),
            model_manifest: None,
        }
    }

    pub fn memory() -> Self {
        Self {
            database: DatabaseConfig::Memory,
            pool: None,
            preload_policy: None,
            model_manifest: None,
        }
    }

    pub fn load_or_init(base_dir: &Path, default_sqlite_path: &Path) -> TempoResult<Self> {
        fs::create_dir_all(base_dir)
            .map_err(|err| TempoError::config(format!("create config dir: {err}")))?;
        let config_path = base_dir.join(DEFAULT_CONFIG_NAME);
        if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .map_err(|err| TempoError::config(format!("read config: {err}")))?;
            let config: TempoConfig = serde_json::from_str(&raw)
                .map_err(|err| TempoError::config(format!("parse config: {err}")))?;
            return Ok(config);
        }
        let default = TempoConfig::default_sqlite(default_sqlite_path.to_string_lossy());
        let payload = serde_json::to_string_pretty(&default)
            .map_err(|err| TempoError::config(format!("serialize config: {err}")))?;
        fs::write(&config_path, payload)
            .map_err(|err| TempoError::config(format!("write config: {err}")))?;
        log::info!("tempo: wrote default config to {}", config_path.display());
        Ok(default)
    }

    pub fn sqlite_path(&self, base_dir: &Path) -> TempoResult<PathBuf> {
        match &self.database {
            DatabaseConfig::Sqlite { path } => {
                let path = path.clone().unwrap_or_else(|| DEFAULT_DB_NAME.to_string());
                Ok(resolve(base_dir, &path))
            }
            _ => Err(TempoError::config("config is not sqlite backend")),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self.database {
            DatabaseConfig::Memory => "memory",
            DatabaseConfig::Sqlite { .. } => "sqlite",
            DatabaseConfig::Postgres { .. } => "postgres",
            DatabaseConfig::Mysql { .. } => "mysql",
        }
    }

    pub fn connection_url(&self) -> Option<&str> {
        match &self.database {
            DatabaseConfig::Memory | DatabaseConfig::Sqlite { .. } => None,
            DatabaseConfig::Postgres { url } | DatabaseConfig::Mysql { url } => Some(url.as_str()),
        }
    }

    pub fn preload_policy(&self) -> PreloadPolicy {
        self.preload_policy.unwrap_or_default()
    }

    pub fn model_manifest_path(&self, base_dir: &Path) -> Option<PathBuf> {
        self.model_manifest
            .as_deref()
            .map(|path| resolve(base_dir, path))
    }
}

fn resolve(base_dir: &Path, path: &str) -> PathBuf {
    let candidate = PathBuf::from(path);
    if candidate.is_absolute() {
        candidate
    } else {
        base_dir.join(candidate)
    }
}

pub(crate) fn default_db_name() -> &'static str {
    DEFAULT_DB_NAME
}
