pub mod config;
pub mod datastore;
mod db;
pub mod migration;
pub mod store;

pub use config::{DatabaseConfig, PoolConfig, StoreConfig};
pub use datastore::{default_sqlite_path, load_or_init_config, open_store};
pub use roster_core::{RosterError, RosterResult};
pub use store::IdentityDb;
