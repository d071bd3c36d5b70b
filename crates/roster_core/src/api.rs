use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::Date;

use crate::{IdentityId, OrgId, Profile, RosterResult};

/// Point lookup keys understood by the identity store, most general first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentityLookup<'a> {
    Name {
        name: &'a str,
    },
    SourceUsername {
        source: &'a str,
        username: &'a str,
    },
    Email {
        email: &'a str,
    },
    NameSourceUsername {
        name: &'a str,
        source: &'a str,
        username: &'a str,
    },
    NameEmail {
        name: &'a str,
        email: &'a str,
    },
    SourceUsernameEmail {
        source: &'a str,
        username: &'a str,
        email: &'a str,
    },
    Full {
        name: &'a str,
        source: &'a str,
        username: &'a str,
        email: &'a str,
    },
}

impl fmt::Display for IdentityLookup<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name { name } => write!(f, "name '{name}'"),
            Self::SourceUsername { source, username } => {
                write!(f, "source/username '{source}/{username}'")
            }
            Self::Email { email } => write!(f, "email '{email}'"),
            Self::NameSourceUsername {
                name,
                source,
                username,
            } => write!(f, "name/source/username '{name}/{source}/{username}'"),
            Self::NameEmail { name, email } => write!(f, "name/email '{name}/{email}'"),
            Self::SourceUsernameEmail {
                source,
                username,
                email,
            } => write!(f, "email/source/username '{email}/{source}/{username}'"),
            Self::Full {
                name,
                source,
                username,
                email,
            } => write!(
                f,
                "name/email/source/username '{name}/{email}/{source}/{username}'"
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrgId,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAffiliation {
    pub org_id: OrgId,
    pub start: Date,
    pub end: Date,
    pub project_scope: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAffiliation {
    pub org_id: OrgId,
    pub start: Date,
    pub end: Date,
}

/// Writes applied to one identity's affiliations inside a single transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffiliationChanges {
    pub identity: IdentityId,
    pub project_scope: Option<String>,
    pub delete_existing: bool,
    pub inserts: Vec<NewAffiliation>,
}

impl AffiliationChanges {
    pub fn is_empty(&self) -> bool {
        !self.delete_existing && self.inserts.is_empty()
    }
}

#[async_trait]
pub trait IdentityLookupApi {
    /// Distinct identity ids matching `lookup`. Implementations may stop after
    /// two ids since callers only distinguish none, one and many.
    async fn find_identities(&self, lookup: &IdentityLookup<'_>)
    -> RosterResult<Vec<IdentityId>>;
}

#[async_trait]
pub trait OrganizationApi {
    async fn list_organizations(&self) -> RosterResult<Vec<Organization>>;

    /// Evaluate `value REGEXP pattern` with the store's own regex engine.
    async fn matches_pattern(&self, value: &str, pattern: &str) -> RosterResult<bool>;
}

#[async_trait]
pub trait AffiliationApi {
    async fn identity_exists(&self, identity: &IdentityId) -> RosterResult<bool>;

    async fn fetch_profile(&self, identity: &IdentityId) -> RosterResult<Option<Profile>>;

    /// Stored non-null email for the (identity, source, username) alias.
    async fn fetch_alias_email(
        &self,
        identity: &IdentityId,
        source: &str,
        username: &str,
    ) -> RosterResult<Option<String>>;

    /// Affiliations in exactly one scope partition; `None` selects the unscoped rows.
    async fn list_affiliations(
        &self,
        identity: &IdentityId,
        project_scope: Option<&str>,
    ) -> RosterResult<Vec<StoredAffiliation>>;

    async fn apply_affiliation_changes(&self, changes: &AffiliationChanges) -> RosterResult<()>;
}

/// Everything an import run needs from the identity store.
pub trait IdentityStore: IdentityLookupApi + OrganizationApi + AffiliationApi + Send + Sync {}

impl<T> IdentityStore for T where T: IdentityLookupApi + OrganizationApi + AffiliationApi + Send + Sync
{}
