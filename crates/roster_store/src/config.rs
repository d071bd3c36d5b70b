use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use roster_core::{RosterError, RosterResult};

const DEFAULT_CONFIG_NAME: &str = "roster.json";
const DEFAULT_ORIGIN: &str = "import-identities";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Sqlite { path: Option<String> },
    Postgres { url: String },
    Mysql { url: String },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
    pub acquire_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub database: DatabaseConfig,
    pub pool: Option<PoolConfig>,
    /// Log every SQL statement through the `log` facade.
    pub sql_trace: Option<bool>,
    /// Value of the MySQL `@origin` session variable set around affiliation writes.
    pub origin: Option<String>,
}

impl StoreConfig {
    pub fn default_sqlite(path: impl Into<String>) -> Self {
        Self {
            database: DatabaseConfig::Sqlite {
                path: Some(path.into()),
            },
            pool: None,
            sql_trace: None,
            origin: None,
        }
    }

    pub fn from_url(url: impl Into<String>) -> RosterResult<Self> {
        let url = url.into();
        let database = if url.starts_with("mysql://") || url.starts_with("mariadb://") {
            DatabaseConfig::Mysql { url }
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            DatabaseConfig::Postgres { url }
        } else if let Some(path) = url.strip_prefix("sqlite://") {
            let path = PathBuf::from(path.split('?').next().unwrap_or(path));
            // URL paths are relative to the working directory, not the datastore.
            let path = if path.is_absolute() {
                path
            } else {
                std::env::current_dir()
                    .map_err(|err| RosterError::config(format!("resolve sqlite path: {err}")))?
                    .join(path)
            };
            DatabaseConfig::Sqlite {
                path: Some(path.to_string_lossy().into_owned()),
            }
        } else {
            return Err(RosterError::config(format!(
                "unsupported database url scheme: {url}"
            )));
        };
        Ok(Self {
            database,
            pool: None,
            sql_trace: None,
            origin: None,
        })
    }

    pub fn load_or_init(base_dir: &Path, default_sqlite_path: &Path) -> RosterResult<Self> {
        fs::create_dir_all(base_dir)
            .map_err(|err| RosterError::config(format!("create config dir: {err}")))?;
        let config_path = base_dir.join(DEFAULT_CONFIG_NAME);
        if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .map_err(|err| RosterError::config(format!("read config: {err}")))?;
            let config: StoreConfig = serde_json::from_str(&raw)
                .map_err(|err| RosterError::config(format!("parse config: {err}")))?;
            return Ok(config);
        }
        let default = StoreConfig::default_sqlite(default_sqlite_path.to_string_lossy());
        let payload = serde_json::to_string_pretty(&default)
            .map_err(|err| RosterError::config(format!("serialize config: {err}")))?;
        fs::write(&config_path, payload)
            .map_err(|err| RosterError::config(format!("write config: {err}")))?;
        Ok(default)
    }

    pub fn sqlite_path(&self, base_dir: &Path) -> RosterResult<PathBuf> {
        match &self.database {
            DatabaseConfig::Sqlite { path } => {
                let path = path.clone().unwrap_or_else(|| "roster.sqlite".to_string());
                let candidate = PathBuf::from(path);
                if candidate.is_absolute() {
                    Ok(candidate)
                } else {
                    Ok(base_dir.join(candidate))
                }
            }
            _ => Err(RosterError::config("config is not sqlite backend")),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self.database {
            DatabaseConfig::Sqlite { .. } => "sqlite",
            DatabaseConfig::Postgres { .. } => "postgres",
            DatabaseConfig::Mysql { .. } => "mysql",
        }
    }

    pub fn sql_trace(&self) -> bool {
        self.sql_trace.unwrap_or(false)
    }

    pub fn origin(&self) -> &str {
        self.origin.as_deref().unwrap_or(DEFAULT_ORIGIN)
    }
}
