//! Identity and affiliation reconciliation engine.

pub mod api;
pub mod coordinator;
pub mod error;
pub mod import;
pub mod ingest;
pub mod memory;
pub mod normalize;
pub mod orgs;
pub mod preprocess;
pub mod reconcile;
pub mod record;
pub mod resolver;

pub use api::*;
pub use coordinator::{Parallelism, fan_out};
pub use error::{RosterError, RosterResult};
pub use import::{DEFAULT_IGNORED_ORGANIZATION, ImportOptions, ImportReport, Importer};
pub use memory::MemoryIdentityStore;
pub use orgs::{Canonicalized, OrgCanonicalizer, OrgMappingSource, OrgNameMapping, OrganizationIndex};
pub use record::*;
