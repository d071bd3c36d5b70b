//! Cascading identity resolution.
//!
//! Lookups run from the coarsest signal (profile name) to the most specific
//! combination of name, alias and email. The first lookup that yields exactly
//! one distinct identity wins; zero or several candidates move the cascade on.

use log::debug;

use crate::{IdentityId, IdentityLookup, IdentityLookupApi, IncomingRecord, RosterResult};

/// The full lookup order for `record`.
pub fn cascade(record: &IncomingRecord) -> Vec<IdentityLookup<'_>> {
    let name = record.profile.name.as_str();
    let aliases = || {
        record.aliases.iter().flat_map(|(source, usernames)| {
            usernames
                .iter()
                .map(move |username| (source.as_str(), username.as_str()))
        })
    };
    let emails = || record.emails.iter().map(String::as_str);

    let mut lookups = vec![IdentityLookup::Name { name }];
    lookups.extend(aliases().map(|(source, username)| IdentityLookup::SourceUsername {
        source,
        username,
    }));
    lookups.extend(emails().map(|email| IdentityLookup::Email { email }));
    lookups.extend(
        aliases().map(|(source, username)| IdentityLookup::NameSourceUsername {
            name,
            source,
            username,
        }),
    );
    lookups.extend(emails().map(|email| IdentityLookup::NameEmail { name, email }));
    for (source, usernames) in &record.aliases {
        for email in emails() {
            for username in usernames {
                lookups.push(IdentityLookup::SourceUsernameEmail {
                    source,
                    username,
                    email,
                });
            }
        }
    }
    for (source, usernames) in &record.aliases {
        for email in emails() {
            for username in usernames {
                lookups.push(IdentityLookup::Full {
                    name,
                    source,
                    username,
                    email,
                });
            }
        }
    }
    lookups
}

pub struct IdentityResolver<'a, S: ?Sized> {
    store: &'a S,
    verbose: bool,
}

impl<'a, S> IdentityResolver<'a, S>
where
    S: IdentityLookupApi + Sync + ?Sized,
{
    pub fn new(store: &'a S, verbose: bool) -> Self {
        Self { store, verbose }
    }

    pub async fn resolve(&self, record: &IncomingRecord) -> RosterResult<Option<IdentityId>> {
        for lookup in cascade(record) {
            let mut candidates = self.store.find_identities(&lookup).await.map_err(|err| {
                err.context(format!(
                    "identity lookup by {lookup} for '{}'",
                    record.profile.name
                ))
            })?;
            candidates.dedup();
            if candidates.len() == 1 {
                if self.verbose {
                    debug!("found by {lookup} -> {}", candidates[0]);
                }
                return Ok(candidates.pop());
            }
            if self.verbose {
                debug!("not found by {lookup} ({} candidates)", candidates.len());
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{IdentityResolver, cascade};
    use crate::memory::MemoryIdentityStore;
    use crate::{IdentityId, IdentityLookup, IncomingRecord, Profile};

    fn record(name: &str, emails: &[&str], aliases: &[(&str, &[&str])]) -> IncomingRecord {
        IncomingRecord {
            profile: Profile {
                name: name.to_string(),
                is_bot: None,
            },
            emails: emails.iter().map(|email| email.to_string()).collect(),
            aliases: aliases
                .iter()
                .map(|(source, usernames)| {
                    (
                        source.to_string(),
                        usernames.iter().map(|u| u.to_string()).collect(),
                    )
                })
                .collect::<BTreeMap<_, _>>(),
            affiliations: vec![],
        }
    }

    #[test]
    fn cascade_orders_general_before_specific() {
        let incoming = record("Jane", &["j@a.io"], &[("github", &["jdoe"])]);
        let lookups = cascade(&incoming);
        assert_eq!(
            lookups,
            vec![
                IdentityLookup::Name { name: "Jane" },
                IdentityLookup::SourceUsername {
                    source: "github",
                    username: "jdoe"
                },
                IdentityLookup::Email { email: "j@a.io" },
                IdentityLookup::NameSourceUsername {
                    name: "Jane",
                    source: "github",
                    username: "jdoe"
                },
                IdentityLookup::NameEmail {
                    name: "Jane",
                    email: "j@a.io"
                },
                IdentityLookup::SourceUsernameEmail {
                    source: "github",
                    username: "jdoe",
                    email: "j@a.io"
                },
                IdentityLookup::Full {
                    name: "Jane",
                    source: "github",
                    username: "jdoe",
                    email: "j@a.io"
                },
            ]
        );
    }

    #[test]
    fn cascade_without_aliases_or_emails_is_name_only() {
        let incoming = record("Jane", &[], &[]);
        assert_eq!(cascade(&incoming).len(), 1);
    }

    #[tokio::test]
    async fn resolves_by_unique_name() {
        let store = MemoryIdentityStore::new();
        store.add_profile("u1", "Jane Doe", None);
        let resolver = IdentityResolver::new(&store, false);
        let found = resolver
            .resolve(&record("Jane Doe", &[], &[]))
            .await
            .expect("resolve");
        assert_eq!(found, Some(IdentityId::new("u1")));
    }

    #[tokio::test]
    async fn ambiguous_name_without_aliases_is_unresolved() {
        let store = MemoryIdentityStore::new();
        store.add_profile("u1", "Jane Doe", None);
        store.add_profile("u2", "Jane Doe", None);
        let resolver = IdentityResolver::new(&store, false);
        let found = resolver
            .resolve(&record("Jane Doe", &[], &[]))
            .await
            .expect("resolve");
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn ambiguous_name_falls_through_to_alias() {
        let store = MemoryIdentityStore::new();
        store.add_profile("u1", "Jane Doe", None);
        store.add_profile("u2", "Jane Doe", None);
        store.add_alias("u2", "github", "jdoe", Some("jane@acme.io"), Some("Jane Doe"));
        let resolver = IdentityResolver::new(&store, false);
        let found = resolver
            .resolve(&record("Jane Doe", &[], &[("github", &["jdoe"])]))
            .await
            .expect("resolve");
        assert_eq!(found, Some(IdentityId::new("u2")));
    }

    #[tokio::test]
    async fn ambiguous_email_is_skipped_in_favor_of_combined_key() {
        let store = MemoryIdentityStore::new();
        store.add_alias("u1", "git", "jd", Some("shared@acme.io"), Some("Jane"));
        store.add_alias("u2", "git", "jd", Some("shared@acme.io"), Some("John"));
        let resolver = IdentityResolver::new(&store, false);
        let found = resolver
            .resolve(&record("Jane", &["shared@acme.io"], &[]))
            .await
            .expect("resolve");
        assert_eq!(found, Some(IdentityId::new("u1")));
    }

    #[tokio::test]
    async fn nothing_matching_is_unresolved() {
        let store = MemoryIdentityStore::new();
        store.add_profile("u1", "Someone Else", None);
        let resolver = IdentityResolver::new(&store, true);
        let found = resolver
            .resolve(&record("Jane", &["j@a.io"], &[("github", &["jdoe"])]))
            .await
            .expect("resolve");
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn store_failure_is_reported_with_lookup_context() {
        let store = MemoryIdentityStore::new();
        store.fail_on("find_identities");
        let resolver = IdentityResolver::new(&store, false);
        let err = resolver
            .resolve(&record("Jane", &[], &[]))
            .await
            .expect_err("failpoint");
        assert!(err.to_string().contains("identity lookup by name 'Jane'"));
    }
}
