//! Compare-and-apply of a resolved identity's affiliations.

use std::collections::BTreeSet;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use time::Date;

use crate::normalize::strip_unicode;
use crate::orgs::OrganizationIndex;
use crate::{
    Affiliation, AffiliationApi, AffiliationChanges, NewAffiliation, OrgId, Profile,
    ReconciliationStats, ResolvedIdentity, RosterError, RosterResult, StoredAffiliation,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileMode {
    pub verbose: bool,
    pub compare: bool,
    pub replace: bool,
}

/// Names compare after normalization; a bot flag only counts when both sides set it.
pub fn profiles_differ(incoming: &Profile, stored: &Profile) -> bool {
    if strip_unicode(&incoming.name) != strip_unicode(&stored.name) {
        return true;
    }
    matches!((incoming.is_bot, stored.is_bot), (Some(a), Some(b)) if a != b)
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OrgKey {
    Id(OrgId),
    Unresolved(String),
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct AffiliationKey {
    org: OrgKey,
    start: Date,
    end: Date,
    project_scope: Option<String>,
}

impl From<&Affiliation> for AffiliationKey {
    fn from(affiliation: &Affiliation) -> Self {
        Self {
            org: match affiliation.org_id {
                Some(id) => OrgKey::Id(id),
                None => OrgKey::Unresolved(affiliation.organization.clone()),
            },
            start: affiliation.start,
            end: affiliation.end,
            project_scope: affiliation.project_scope.clone(),
        }
    }
}

impl From<&StoredAffiliation> for AffiliationKey {
    fn from(stored: &StoredAffiliation) -> Self {
        Self {
            org: OrgKey::Id(stored.org_id),
            start: stored.start,
            end: stored.end,
            project_scope: stored.project_scope.clone(),
        }
    }
}

/// True when either side holds an affiliation the other lacks.
pub fn affiliations_differ(incoming: &[Affiliation], stored: &[StoredAffiliation]) -> bool {
    let incoming: BTreeSet<AffiliationKey> = incoming.iter().map(AffiliationKey::from).collect();
    let stored: BTreeSet<AffiliationKey> = stored.iter().map(AffiliationKey::from).collect();
    incoming != stored
}

pub struct AffiliationReconciler<'a, S: ?Sized> {
    store: &'a S,
    index: &'a OrganizationIndex,
    mode: ReconcileMode,
    project_scope: Option<String>,
}

impl<'a, S> AffiliationReconciler<'a, S>
where
    S: AffiliationApi + Sync + ?Sized,
{
    pub fn new(
        store: &'a S,
        index: &'a OrganizationIndex,
        mode: ReconcileMode,
        project_scope: Option<String>,
    ) -> Self {
        Self {
            store,
            index,
            mode,
            project_scope,
        }
    }

    /// Reconcile one identity and return its counter delta.
    pub async fn reconcile(&self, identity: &ResolvedIdentity) -> RosterResult<ReconciliationStats> {
        let mut stats = ReconciliationStats::default();
        let id = &identity.id;
        let storage = |what: &str| format!("{what} of identity {id}");

        if !self
            .store
            .identity_exists(id)
            .await
            .map_err(|err| err.context(storage("existence check")))?
        {
            info!("cannot find identity '{id}'");
            stats.identities_not_found += 1;
            return Ok(stats);
        }
        stats.identities_found += 1;

        let profile = self
            .store
            .fetch_profile(id)
            .await
            .map_err(|err| err.context(storage("profile fetch")))?;
        if let Some(stored) = profile {
            stats.profiles_found += 1;
            if self.mode.compare {
                if !profiles_differ(&identity.record.profile, &stored) {
                    stats.profiles_identical += 1;
                } else if self.mode.verbose {
                    debug!("profiles differ: {} != {stored}", identity.record.profile);
                }
            }
        }

        self.compare_aliases(identity, &mut stats).await?;

        let existing = self
            .store
            .list_affiliations(id, self.project_scope.as_deref())
            .await
            .map_err(|err| err.context(storage("affiliation fetch")))?;
        let fetched = !existing.is_empty();
        if self.mode.compare {
            for stored in &existing {
                if self.index.name_of(stored.org_id).is_none() {
                    return Err(RosterError::conflict(format!(
                        "organization id {} of identity {id} not found",
                        stored.org_id
                    )));
                }
            }
        }
        if fetched {
            stats.affiliations_found += 1;
        }

        let mut same = false;
        if fetched && self.mode.compare {
            same = !affiliations_differ(identity.affiliations(), &existing);
            if same {
                stats.affiliations_identical += 1;
            } else if self.mode.verbose {
                debug!(
                    "affiliations of {id} differ: {} incoming vs {} stored",
                    identity.affiliations().len(),
                    existing.len()
                );
            }
        }

        let mut changes = AffiliationChanges {
            identity: id.clone(),
            project_scope: self.project_scope.clone(),
            delete_existing: fetched && !same && self.mode.replace,
            inserts: Vec::new(),
        };
        if changes.delete_existing {
            stats.affiliations_deleted += 1;
        }
        if !same && (!fetched || self.mode.replace) {
            for affiliation in identity.affiliations() {
                let Some(org_id) = affiliation.org_id else {
                    stats.affiliations_skipped += 1;
                    continue;
                };
                if self.mode.verbose {
                    debug!("adding affiliation for {id}: {affiliation}");
                }
                changes.inserts.push(NewAffiliation {
                    org_id,
                    start: affiliation.start,
                    end: affiliation.end,
                });
                stats.affiliations_added += 1;
            }
        }

        if !changes.is_empty() {
            self.store
                .apply_affiliation_changes(&changes)
                .await
                .map_err(|err| err.context(storage("affiliation update")))?;
        }
        Ok(stats)
    }

    async fn compare_aliases(
        &self,
        identity: &ResolvedIdentity,
        stats: &mut ReconciliationStats,
    ) -> RosterResult<()> {
        if !self.mode.compare || identity.record.emails.is_empty() {
            return Ok(());
        }
        let emails: BTreeSet<String> = identity
            .record
            .emails
            .iter()
            .map(|email| strip_unicode(email))
            .collect();
        for (source, usernames) in &identity.record.aliases {
            for username in usernames {
                let username = strip_unicode(username);
                let stored = self
                    .store
                    .fetch_alias_email(&identity.id, source, &username)
                    .await
                    .map_err(|err| {
                        err.context(format!(
                            "alias fetch {source}/{username} of identity {}",
                            identity.id
                        ))
                    })?;
                let Some(stored) = stored else {
                    continue;
                };
                stats.aliases_found += 1;
                let stored = strip_unicode(&stored);
                if emails.contains(&stored) {
                    stats.aliases_identical += 1;
                } else if self.mode.verbose {
                    debug!(
                        "alias {source}/{username} of {} differs: {stored} not in {emails:?}",
                        identity.id
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use time::macros::date;

    use super::{AffiliationReconciler, ReconcileMode, profiles_differ};
    use crate::memory::MemoryIdentityStore;
    use crate::orgs::OrganizationIndex;
    use crate::{
        Affiliation, DEFAULT_END, IdentityId, IncomingRecord, OrgId, OrganizationApi, Profile,
        RawAffiliation, ResolvedIdentity,
    };

    const COMPARE_REPLACE: ReconcileMode = ReconcileMode {
        verbose: true,
        compare: true,
        replace: true,
    };

    fn store() -> MemoryIdentityStore {
        let store = MemoryIdentityStore::new();
        store.add_organization(1, "OrgA");
        store.add_organization(2, "OrgB");
        store.add_profile("u1", "Jane Doe", Some(false));
        store
    }

    async fn index_of(store: &MemoryIdentityStore) -> OrganizationIndex {
        OrganizationIndex::from_organizations(store.list_organizations().await.expect("orgs"))
    }

    fn incoming(
        index: &OrganizationIndex,
        orgs: &[&str],
        emails: &[&str],
        aliases: &[(&str, &str)],
        scope: Option<&str>,
    ) -> ResolvedIdentity {
        let mut affiliations: Vec<Affiliation> = orgs
            .iter()
            .map(|org| {
                Affiliation::bounded(RawAffiliation {
                    organization: org.to_string(),
                    start: Some(date!(2010 - 01 - 01)),
                    end: None,
                })
            })
            .collect();
        index.annotate(&mut affiliations);
        let mut alias_map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (source, username) in aliases {
            alias_map
                .entry(source.to_string())
                .or_default()
                .push(username.to_string());
        }
        let record = IncomingRecord {
            profile: Profile {
                name: "Jane Doe".to_string(),
                is_bot: None,
            },
            emails: emails.iter().map(|email| email.to_string()).collect(),
            aliases: alias_map,
            affiliations,
        };
        ResolvedIdentity::new(IdentityId::new("u1"), record, scope)
    }

    #[tokio::test]
    async fn replace_swaps_organization_then_settles() {
        let store = store();
        store.add_affiliation("u1", 1, date!(2010 - 01 - 01), DEFAULT_END, None);
        let index = index_of(&store).await;
        let identity = incoming(&index, &["OrgB"], &[], &[], None);
        let reconciler = AffiliationReconciler::new(&store, &index, COMPARE_REPLACE, None);

        let first = reconciler.reconcile(&identity).await.expect("first");
        assert_eq!(first.affiliations_found, 1);
        assert_eq!(first.affiliations_deleted, 1);
        assert_eq!(first.affiliations_added, 1);
        let stored = store.affiliations_of("u1", None);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].org_id, OrgId(2));

        let second = reconciler.reconcile(&identity).await.expect("second");
        assert_eq!(second.affiliations_identical, 1);
        assert_eq!(second.affiliations_deleted, 0);
        assert_eq!(second.affiliations_added, 0);
        assert_eq!(store.affiliations_of("u1", None), stored);
    }

    #[tokio::test]
    async fn unresolved_organization_is_skipped_in_every_mode() {
        for compare in [false, true] {
            for replace in [false, true] {
                let store = store();
                let index = index_of(&store).await;
                let identity = incoming(&index, &["Hooli", "OrgA"], &[], &[], None);
                let mode = ReconcileMode {
                    verbose: false,
                    compare,
                    replace,
                };
                let stats = AffiliationReconciler::new(&store, &index, mode, None)
                    .reconcile(&identity)
                    .await
                    .expect("reconcile");
                assert_eq!(stats.affiliations_skipped, 1);
                assert_eq!(stats.affiliations_added, 1);
                let stored = store.affiliations_of("u1", None);
                assert_eq!(stored.len(), 1);
                assert_eq!(stored[0].org_id, OrgId(1));
            }
        }
    }

    #[tokio::test]
    async fn existing_set_is_kept_without_replace() {
        let store = store();
        store.add_affiliation("u1", 1, date!(2000 - 01 - 01), DEFAULT_END, None);
        let index = index_of(&store).await;
        let identity = incoming(&index, &["OrgB"], &[], &[], None);
        let mode = ReconcileMode::default();
        let stats = AffiliationReconciler::new(&store, &index, mode, None)
            .reconcile(&identity)
            .await
            .expect("reconcile");
        assert_eq!(stats.affiliations_found, 1);
        assert_eq!(stats.affiliations_added, 0);
        assert_eq!(store.affiliations_of("u1", None)[0].org_id, OrgId(1));
    }

    #[tokio::test]
    async fn replace_without_compare_rewrites_identical_sets() {
        let store = store();
        store.add_affiliation("u1", 1, date!(2010 - 01 - 01), DEFAULT_END, None);
        let index = index_of(&store).await;
        let identity = incoming(&index, &["OrgA"], &[], &[], None);
        let mode = ReconcileMode {
            replace: true,
            ..ReconcileMode::default()
        };
        let stats = AffiliationReconciler::new(&store, &index, mode, None)
            .reconcile(&identity)
            .await
            .expect("reconcile");
        assert_eq!(stats.affiliations_deleted, 1);
        assert_eq!(stats.affiliations_added, 1);
        assert_eq!(store.affiliations_of("u1", None).len(), 1);
    }

    #[tokio::test]
    async fn missing_identity_is_counted_not_found() {
        let store = MemoryIdentityStore::new();
        let index = OrganizationIndex::default();
        let identity = incoming(&index, &["OrgA"], &[], &[], None);
        let stats = AffiliationReconciler::new(&store, &index, COMPARE_REPLACE, None)
            .reconcile(&identity)
            .await
            .expect("reconcile");
        assert_eq!(stats.identities_not_found, 1);
        assert_eq!(stats.identities_found, 0);
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test]
    async fn stored_unknown_organization_is_fatal_when_comparing() {
        let store = store();
        store.add_affiliation("u1", 99, date!(2010 - 01 - 01), DEFAULT_END, None);
        let index = index_of(&store).await;
        let identity = incoming(&index, &["OrgA"], &[], &[], None);
        let err = AffiliationReconciler::new(&store, &index, COMPARE_REPLACE, None)
            .reconcile(&identity)
            .await
            .expect_err("unknown org");
        assert!(err.to_string().contains("organization id 99"));
    }

    #[tokio::test]
    async fn profile_and_alias_comparisons_are_counted() {
        let store = store();
        store.add_alias("u1", "github", "jdoe", Some("jane@acme.io"), None);
        store.add_alias("u1", "gerrit", "jdoe", Some("old@acme.io"), None);
        let index = index_of(&store).await;
        let identity = incoming(
            &index,
            &["OrgA"],
            &["jane@acme.io"],
            &[("github", "jdoe"), ("gerrit", "jdoe"), ("slack", "jane")],
            None,
        );
        let stats = AffiliationReconciler::new(&store, &index, COMPARE_REPLACE, None)
            .reconcile(&identity)
            .await
            .expect("reconcile");
        assert_eq!(stats.profiles_found, 1);
        assert_eq!(stats.profiles_identical, 1);
        assert_eq!(stats.aliases_found, 2);
        assert_eq!(stats.aliases_identical, 1);
    }

    #[tokio::test]
    async fn scoped_run_leaves_unscoped_rows_alone() {
        let store = store();
        store.add_affiliation("u1", 1, date!(2010 - 01 - 01), DEFAULT_END, None);
        let index = index_of(&store).await;
        let identity = incoming(&index, &["OrgB"], &[], &[], Some("finos"));
        let reconciler =
            AffiliationReconciler::new(&store, &index, COMPARE_REPLACE, Some("finos".to_string()));
        let stats = reconciler.reconcile(&identity).await.expect("reconcile");
        assert_eq!(stats.affiliations_found, 0);
        assert_eq!(stats.affiliations_added, 1);
        assert_eq!(store.affiliations_of("u1", None)[0].org_id, OrgId(1));
        assert_eq!(store.affiliations_of("u1", Some("finos"))[0].org_id, OrgId(2));
    }

    #[test]
    fn bot_flag_only_differs_when_both_sides_set_it() {
        let named = |is_bot| Profile {
            name: "José".to_string(),
            is_bot,
        };
        assert!(!profiles_differ(&named(None), &named(Some(true))));
        assert!(profiles_differ(&named(Some(false)), &named(Some(true))));
        let plain = Profile {
            name: "Jose".to_string(),
            is_bot: None,
        };
        assert!(!profiles_differ(&named(None), &plain));
    }
}
