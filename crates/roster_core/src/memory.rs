//! In-process identity store used for tests and dry experiments.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use time::Date;

use crate::{
    AffiliationApi, AffiliationChanges, IdentityId, IdentityLookup, IdentityLookupApi, OrgId,
    Organization, OrganizationApi, Profile, RosterError, RosterResult, StoredAffiliation,
};

#[derive(Clone, Debug)]
struct AliasRow {
    identity: String,
    source: String,
    username: String,
    email: Option<String>,
    name: Option<String>,
}

#[derive(Default)]
struct Tables {
    identities: BTreeSet<String>,
    profiles: BTreeMap<String, Profile>,
    aliases: Vec<AliasRow>,
    organizations: BTreeMap<i64, String>,
    affiliations: Vec<(String, StoredAffiliation)>,
}

#[derive(Clone, Default)]
pub struct MemoryIdentityStore {
    tables: Arc<Mutex<Tables>>,
    failpoints: Arc<Mutex<HashSet<String>>>,
    calls: Arc<AtomicUsize>,
    pattern_evaluations: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
    latency: Option<Duration>,
}

/// Marks one store call as in flight until dropped.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every call sleeps for `latency` before touching the tables.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    async fn enter(&self, operation: &str) -> RosterResult<InFlight> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = InFlight(self.in_flight.clone());
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let failing = self
            .failpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(operation);
        if failing {
            return Err(RosterError::storage(format!("failpoint {operation}")));
        }
        Ok(guard)
    }

    /// Make every later call of `operation` fail with a storage error.
    pub fn fail_on(&self, operation: &str) {
        self.failpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(operation.to_string());
    }

    /// Number of store calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls that were in flight at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn pattern_evaluations(&self) -> usize {
        self.pattern_evaluations.load(Ordering::SeqCst)
    }

    pub fn add_identity(&self, identity: &str) {
        self.tables().identities.insert(identity.to_string());
    }

    pub fn add_profile(&self, identity: &str, name: &str, is_bot: Option<bool>) {
        let mut tables = self.tables();
        tables.identities.insert(identity.to_string());
        tables.profiles.insert(
            identity.to_string(),
            Profile {
                name: name.to_string(),
                is_bot,
            },
        );
    }

    pub fn add_alias(
        &self,
        identity: &str,
        source: &str,
        username: &str,
        email: Option<&str>,
        name: Option<&str>,
    ) {
        let mut tables = self.tables();
        tables.identities.insert(identity.to_string());
        tables.aliases.push(AliasRow {
            identity: identity.to_string(),
            source: source.to_string(),
            username: username.to_string(),
            email: email.map(str::to_string),
            name: name.map(str::to_string),
        });
    }

    pub fn add_organization(&self, id: i64, name: &str) {
        self.tables().organizations.insert(id, name.to_string());
    }

    pub fn add_affiliation(
        &self,
        identity: &str,
        org_id: i64,
        start: Date,
        end: Date,
        project_scope: Option<&str>,
    ) {
        self.tables().affiliations.push((
            identity.to_string(),
            StoredAffiliation {
                org_id: OrgId(org_id),
                start,
                end,
                project_scope: project_scope.map(str::to_string),
            },
        ));
    }

    /// Snapshot of the stored affiliations of one identity in one scope.
    pub fn affiliations_of(
        &self,
        identity: &str,
        project_scope: Option<&str>,
    ) -> Vec<StoredAffiliation> {
        self.tables()
            .affiliations
            .iter()
            .filter(|(owner, row)| {
                owner == identity && row.project_scope.as_deref() == project_scope
            })
            .map(|(_, row)| row.clone())
            .collect()
    }
}

fn alias_matches(row: &AliasRow, lookup: &IdentityLookup<'_>) -> bool {
    let name = row.name.as_deref();
    let email = row.email.as_deref();
    match *lookup {
        IdentityLookup::Name { .. } => false,
        IdentityLookup::SourceUsername { source, username } => {
            row.source == source && row.username == username
        }
        IdentityLookup::Email { email: wanted } => email == Some(wanted),
        IdentityLookup::NameSourceUsername {
            name: wanted,
            source,
            username,
        } => name == Some(wanted) && row.source == source && row.username == username,
        IdentityLookup::NameEmail {
            name: wanted_name,
            email: wanted_email,
        } => name == Some(wanted_name) && email == Some(wanted_email),
        IdentityLookup::SourceUsernameEmail {
            source,
            username,
            email: wanted,
        } => row.source == source && row.username == username && email == Some(wanted),
        IdentityLookup::Full {
            name: wanted_name,
            source,
            username,
            email: wanted_email,
        } => {
            name == Some(wanted_name)
                && row.source == source
                && row.username == username
                && email == Some(wanted_email)
        }
    }
}

#[async_trait]
impl IdentityLookupApi for MemoryIdentityStore {
    async fn find_identities(
        &self,
        lookup: &IdentityLookup<'_>,
    ) -> RosterResult<Vec<IdentityId>> {
        let _call = self.enter("find_identities").await?;
        let tables = self.tables();
        let ids: BTreeSet<&String> = match lookup {
            IdentityLookup::Name { name } => tables
                .profiles
                .iter()
                .filter(|(_, profile)| profile.name == *name)
                .map(|(identity, _)| identity)
                .collect(),
            _ => tables
                .aliases
                .iter()
                .filter(|row| alias_matches(row, lookup))
                .map(|row| &row.identity)
                .collect(),
        };
        Ok(ids.into_iter().map(|id| IdentityId::new(id.clone())).collect())
    }
}

#[async_trait]
impl OrganizationApi for MemoryIdentityStore {
    async fn list_organizations(&self) -> RosterResult<Vec<Organization>> {
        let _call = self.enter("list_organizations").await?;
        Ok(self
            .tables()
            .organizations
            .iter()
            .map(|(id, name)| Organization {
                id: OrgId(*id),
                name: name.clone(),
            })
            .collect())
    }

    async fn matches_pattern(&self, value: &str, pattern: &str) -> RosterResult<bool> {
        let _call = self.enter("matches_pattern").await?;
        self.pattern_evaluations.fetch_add(1, Ordering::SeqCst);
        let regex = Regex::new(pattern)
            .map_err(|err| RosterError::storage(format!("invalid pattern '{pattern}': {err}")))?;
        Ok(regex.is_match(value))
    }
}

#[async_trait]
impl AffiliationApi for MemoryIdentityStore {
    async fn identity_exists(&self, identity: &IdentityId) -> RosterResult<bool> {
        let _call = self.enter("identity_exists").await?;
        Ok(self.tables().identities.contains(identity.as_str()))
    }

    async fn fetch_profile(&self, identity: &IdentityId) -> RosterResult<Option<Profile>> {
        let _call = self.enter("fetch_profile").await?;
        Ok(self.tables().profiles.get(identity.as_str()).cloned())
    }

    async fn fetch_alias_email(
        &self,
        identity: &IdentityId,
        source: &str,
        username: &str,
    ) -> RosterResult<Option<String>> {
        let _call = self.enter("fetch_alias_email").await?;
        Ok(self
            .tables()
            .aliases
            .iter()
            .find(|row| {
                row.identity == identity.as_str()
                    && row.source == source
                    && row.username == username
                    && row.email.is_some()
            })
            .and_then(|row| row.email.clone()))
    }

    async fn list_affiliations(
        &self,
        identity: &IdentityId,
        project_scope: Option<&str>,
    ) -> RosterResult<Vec<StoredAffiliation>> {
        let _call = self.enter("list_affiliations").await?;
        Ok(self.affiliations_of(identity.as_str(), project_scope))
    }

    async fn apply_affiliation_changes(&self, changes: &AffiliationChanges) -> RosterResult<()> {
        let _call = self.enter("apply_affiliation_changes").await?;
        let mut tables = self.tables();
        let scope = changes.project_scope.as_deref();
        if changes.delete_existing {
            tables.affiliations.retain(|(owner, row)| {
                owner != changes.identity.as_str() || row.project_scope.as_deref() != scope
            });
        }
        for insert in &changes.inserts {
            tables.affiliations.push((
                changes.identity.as_str().to_string(),
                StoredAffiliation {
                    org_id: insert.org_id,
                    start: insert.start,
                    end: insert.end,
                    project_scope: changes.project_scope.clone(),
                },
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use time::macros::date;

    use super::MemoryIdentityStore;
    use crate::{
        AffiliationApi, AffiliationChanges, IdentityId, IdentityLookup, IdentityLookupApi,
        NewAffiliation, OrgId, OrganizationApi,
    };

    #[tokio::test]
    async fn latency_lets_calls_overlap() {
        let store = MemoryIdentityStore::new().with_latency(Duration::from_millis(5));
        store.add_identity("u1");
        let id = IdentityId::new("u1");
        let (first, second) =
            tokio::join!(store.identity_exists(&id), store.identity_exists(&id));
        assert!(first.expect("first") && second.expect("second"));
        assert_eq!(store.peak_in_flight(), 2);
        assert_eq!(store.calls(), 2);

        let plain = MemoryIdentityStore::new();
        let _ = tokio::join!(plain.identity_exists(&id), plain.identity_exists(&id));
        assert_eq!(plain.peak_in_flight(), 1);
    }

    #[tokio::test]
    async fn scope_partitions_are_disjoint() {
        let store = MemoryIdentityStore::new();
        store.add_identity("u1");
        store.add_affiliation("u1", 1, date!(2010 - 01 - 01), date!(2100 - 01 - 01), None);
        store.add_affiliation(
            "u1",
            2,
            date!(2010 - 01 - 01),
            date!(2100 - 01 - 01),
            Some("finos"),
        );
        let id = IdentityId::new("u1");
        let unscoped = store.list_affiliations(&id, None).await.expect("list");
        let scoped = store.list_affiliations(&id, Some("finos")).await.expect("list");
        assert_eq!(unscoped.len(), 1);
        assert_eq!(unscoped[0].org_id, OrgId(1));
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].org_id, OrgId(2));
    }

    #[tokio::test]
    async fn delete_only_touches_requested_scope() {
        let store = MemoryIdentityStore::new();
        store.add_affiliation("u1", 1, date!(2010 - 01 - 01), date!(2100 - 01 - 01), None);
        store.add_affiliation(
            "u1",
            2,
            date!(2010 - 01 - 01),
            date!(2100 - 01 - 01),
            Some("finos"),
        );
        store
            .apply_affiliation_changes(&AffiliationChanges {
                identity: IdentityId::new("u1"),
                project_scope: Some("finos".to_string()),
                delete_existing: true,
                inserts: vec![NewAffiliation {
                    org_id: OrgId(3),
                    start: date!(2012 - 01 - 01),
                    end: date!(2100 - 01 - 01),
                }],
            })
            .await
            .expect("apply");
        assert_eq!(store.affiliations_of("u1", None).len(), 1);
        let scoped = store.affiliations_of("u1", Some("finos"));
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].org_id, OrgId(3));
    }

    #[tokio::test]
    async fn lookups_return_distinct_ids() {
        let store = MemoryIdentityStore::new();
        store.add_alias("u1", "github", "jdoe", Some("j@a.io"), None);
        store.add_alias("u1", "gerrit", "jdoe", Some("j@a.io"), None);
        let ids = store
            .find_identities(&IdentityLookup::Email { email: "j@a.io" })
            .await
            .expect("lookup");
        assert_eq!(ids, vec![IdentityId::new("u1")]);
    }

    #[tokio::test]
    async fn invalid_pattern_is_a_storage_error() {
        let store = MemoryIdentityStore::new();
        let err = store
            .matches_pattern("Acme", "(unclosed")
            .await
            .expect_err("invalid regex");
        assert!(matches!(err, crate::RosterError::Storage { .. }));
        assert_eq!(store.pattern_evaluations(), 1);
    }
}
