use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use clap::builder::FalseyValueParser;
use log::info;
use roster_store::{IdentityDb, StoreConfig, load_or_init_config};

#[derive(Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// Full database URL; takes precedence over the individual settings below.
    #[arg(long, env = "SH_DSN", hide_env_values = true)]
    pub database_url: Option<String>,
    #[arg(long, env = "SH_USER")]
    pub db_user: Option<String>,
    /// Short form of `SH_USER`; checked first when both are set.
    #[arg(long = "db-usr", env = "SH_USR", hide = true)]
    pub db_usr: Option<String>,
    #[arg(long, env = "SH_PASS", hide_env_values = true)]
    pub db_password: Option<String>,
    #[arg(long, env = "SH_HOST", default_value = "localhost")]
    pub db_host: String,
    #[arg(long, env = "SH_PORT", default_value_t = 3306)]
    pub db_port: u16,
    /// MySQL database name; enables the SH_* connection settings.
    #[arg(long, env = "SH_DB")]
    pub db_name: Option<String>,
    /// Extra URL query parameters, e.g. `ssl-mode=disabled`.
    #[arg(long, env = "SH_PARAMS")]
    pub db_params: Option<String>,
    /// Log every SQL statement.
    #[arg(
        long,
        env = "DEBUG_SQL",
        action = clap::ArgAction::SetTrue,
        value_parser = FalseyValueParser::new()
    )]
    pub sql_trace: bool,
    /// Directory holding `roster.json`, used when no database is given.
    #[arg(long, default_value = ".roster")]
    pub datastore: PathBuf,
}

impl ConnectionArgs {
    /// MySQL URL assembled from the SH_* settings, if a database name is set.
    pub fn mysql_url(&self) -> Option<String> {
        let db = self.db_name.as_deref().filter(|db| !db.is_empty())?;
        let user = self
            .db_usr
            .as_deref()
            .filter(|user| !user.is_empty())
            .or(self.db_user.as_deref())
            .unwrap_or_default();
        let credentials = match self.db_password.as_deref() {
            Some(pass) if !pass.is_empty() => format!("{user}:{pass}@"),
            _ if !user.is_empty() => format!("{user}@"),
            _ => String::new(),
        };
        let params = match self.db_params.as_deref() {
            Some(params) if !params.is_empty() && params != "-" => {
                format!("?{}", params.trim_start_matches('?'))
            }
            _ => String::new(),
        };
        Some(format!(
            "mysql://{credentials}{}:{}/{db}{params}",
            self.db_host, self.db_port
        ))
    }

    pub fn store_config(&self) -> Result<StoreConfig> {
        let url = self
            .database_url
            .clone()
            .filter(|url| !url.is_empty())
            .or_else(|| self.mysql_url());
        let mut config = match url {
            Some(url) => StoreConfig::from_url(url)?,
            None => load_or_init_config(&self.datastore)
                .with_context(|| format!("load config in {}", self.datastore.display()))?,
        };
        if self.sql_trace {
            config.sql_trace = Some(true);
        }
        Ok(config)
    }

    pub async fn open(&self) -> Result<IdentityDb> {
        let config = self.store_config()?;
        info!("opening {} identity store", config.backend_name());
        let store = IdentityDb::connect(&config, &self.datastore)
            .await
            .context("connect to identity store")?;
        Ok(store)
    }
}
