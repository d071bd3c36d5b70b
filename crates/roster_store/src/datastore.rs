use std::path::{Path, PathBuf};

use roster_core::RosterResult;

use crate::{IdentityDb, StoreConfig};

const DEFAULT_DB_NAME: &str = "roster.sqlite";

pub fn load_or_init_config(base: &Path) -> RosterResult<StoreConfig> {
    let default_sqlite = base.join(DEFAULT_DB_NAME);
    StoreConfig::load_or_init(base, &default_sqlite)
}

/// Open the store described by `base/roster.json`, writing a SQLite default if absent.
pub async fn open_store(base: &Path) -> RosterResult<IdentityDb> {
    let config = load_or_init_config(base)?;
    IdentityDb::connect(&config, base).await
}

pub fn default_sqlite_path(base: &Path) -> PathBuf {
    base.join(DEFAULT_DB_NAME)
}

#[cfg(test)]
mod tests {
    use super::{default_sqlite_path, load_or_init_config, open_store};
    use tempfile::tempdir;

    #[tokio::test]
    async fn opens_store_with_default_config() {
        let dir = tempdir().expect("tempdir");
        let base = dir.path();
        let config = load_or_init_config(base).expect("config");
        assert_eq!(config.backend_name(), "sqlite");
        assert!(base.join("roster.json").exists());
        let store = open_store(base).await.expect("open store");
        store.provision().await.expect("provision");
        assert!(default_sqlite_path(base).exists());
    }
}
