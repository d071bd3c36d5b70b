//! Identity records flowing through an import run.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::Date;
use time::macros::date;

/// Lower sentinel bound of an affiliation with no start date.
pub const DEFAULT_START: Date = date!(1900 - 01 - 01);
/// Upper sentinel bound of an affiliation with no end date.
pub const DEFAULT_END: Date = date!(2100 - 01 - 01);

/// Canonical identity key in the identity store.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct IdentityId(pub String);

impl IdentityId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical organization key in the identity store.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct OrgId(pub i64);

impl fmt::Display for OrgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub is_bot: Option<bool>,
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.is_bot {
            Some(is_bot) => write!(f, "{{name:{},is_bot:{is_bot}}}", self.name),
            None => write!(f, "{{name:{},is_bot:(nil)}}", self.name),
        }
    }
}

/// Affiliation as decoded from a source document, bounds not yet defaulted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawAffiliation {
    pub organization: String,
    pub start: Option<Date>,
    pub end: Option<Date>,
}

/// One identity document straight out of the data source.
///
/// `side_channel` is the loosely-typed view of the same document; the alias
/// map is recovered from it during preprocessing because its keys are the
/// names of source systems and are not known up front.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceRecord {
    pub profile: Profile,
    pub emails: Vec<String>,
    pub affiliations: Vec<RawAffiliation>,
    pub side_channel: serde_yaml::Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Affiliation {
    pub organization: String,
    pub start: Date,
    pub end: Date,
    pub org_id: Option<OrgId>,
    pub project_scope: Option<String>,
}

impl Affiliation {
    pub fn bounded(raw: RawAffiliation) -> Self {
        Self {
            organization: raw.organization,
            start: raw.start.unwrap_or(DEFAULT_START),
            end: raw.end.unwrap_or(DEFAULT_END),
            org_id: None,
            project_scope: None,
        }
    }
}

impl fmt::Display for Affiliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{organization:{},org_id:", self.organization)?;
        match self.org_id {
            Some(id) => write!(f, "{id}")?,
            None => f.write_str("(nil)")?,
        }
        write!(
            f,
            ",start:{},end:{},project:{}}}",
            self.start,
            self.end,
            self.project_scope.as_deref().unwrap_or("(nil)")
        )
    }
}

/// A validated record with defaulted bounds and its alias map extracted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingRecord {
    pub profile: Profile,
    pub emails: Vec<String>,
    pub aliases: BTreeMap<String, Vec<String>>,
    pub affiliations: Vec<Affiliation>,
}

impl fmt::Display for IncomingRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{profile:{},emails:{:?},aliases:{:?},affiliations:[",
            self.profile, self.emails, self.aliases
        )?;
        for (idx, affiliation) in self.affiliations.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write!(f, "{affiliation}")?;
        }
        f.write_str("]}")
    }
}

/// An incoming record bound to exactly one identity in the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    pub id: IdentityId,
    pub record: IncomingRecord,
}

impl ResolvedIdentity {
    /// Bind `record` to `id` and tag every affiliation with the run's project scope.
    pub fn new(id: IdentityId, mut record: IncomingRecord, project_scope: Option<&str>) -> Self {
        for affiliation in &mut record.affiliations {
            affiliation.project_scope = project_scope.map(str::to_string);
        }
        Self { id, record }
    }

    pub fn affiliations(&self) -> &[Affiliation] {
        &self.record.affiliations
    }
}

/// Counters accumulated while reconciling resolved identities.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationStats {
    pub identities_found: u64,
    pub identities_not_found: u64,
    pub profiles_found: u64,
    pub profiles_identical: u64,
    pub aliases_found: u64,
    pub aliases_identical: u64,
    pub affiliations_found: u64,
    pub affiliations_identical: u64,
    pub affiliations_added: u64,
    pub affiliations_skipped: u64,
    pub affiliations_deleted: u64,
}

impl ReconciliationStats {
    pub fn merge(&mut self, other: &ReconciliationStats) {
        self.identities_found += other.identities_found;
        self.identities_not_found += other.identities_not_found;
        self.profiles_found += other.profiles_found;
        self.profiles_identical += other.profiles_identical;
        self.aliases_found += other.aliases_found;
        self.aliases_identical += other.aliases_identical;
        self.affiliations_found += other.affiliations_found;
        self.affiliations_identical += other.affiliations_identical;
        self.affiliations_added += other.affiliations_added;
        self.affiliations_skipped += other.affiliations_skipped;
        self.affiliations_deleted += other.affiliations_deleted;
    }
}

impl fmt::Display for ReconciliationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "identities found={} not_found={}; profiles found={} identical={}; \
             aliases found={} identical={}; affiliations found={} identical={} \
             added={} skipped={} deleted={}",
            self.identities_found,
            self.identities_not_found,
            self.profiles_found,
            self.profiles_identical,
            self.aliases_found,
            self.aliases_identical,
            self.affiliations_found,
            self.affiliations_identical,
            self.affiliations_added,
            self.affiliations_skipped,
            self.affiliations_deleted,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_fills_sentinel_dates() {
        let affiliation = Affiliation::bounded(RawAffiliation {
            organization: "Acme".to_string(),
            start: None,
            end: None,
        });
        assert_eq!(affiliation.start, date!(1900 - 01 - 01));
        assert_eq!(affiliation.end, date!(2100 - 01 - 01));
        assert!(affiliation.org_id.is_none());
    }

    #[test]
    fn bounded_keeps_explicit_dates() {
        let affiliation = Affiliation::bounded(RawAffiliation {
            organization: "Acme".to_string(),
            start: Some(date!(2015 - 03 - 01)),
            end: None,
        });
        assert_eq!(affiliation.start, date!(2015 - 03 - 01));
        assert_eq!(affiliation.end, DEFAULT_END);
    }

    #[test]
    fn resolved_identity_tags_project_scope() {
        let record = IncomingRecord {
            profile: Profile {
                name: "Jane".to_string(),
                is_bot: None,
            },
            emails: vec![],
            aliases: BTreeMap::new(),
            affiliations: vec![Affiliation::bounded(RawAffiliation {
                organization: "Acme".to_string(),
                start: None,
                end: None,
            })],
        };
        let resolved = ResolvedIdentity::new(IdentityId::new("abc"), record, Some("finos"));
        assert_eq!(
            resolved.affiliations()[0].project_scope.as_deref(),
            Some("finos")
        );
    }

    #[test]
    fn merge_sums_every_counter() {
        let mut total = ReconciliationStats {
            identities_found: 1,
            affiliations_added: 2,
            ..Default::default()
        };
        total.merge(&ReconciliationStats {
            identities_found: 1,
            identities_not_found: 1,
            affiliations_added: 3,
            affiliations_deleted: 1,
            ..Default::default()
        });
        assert_eq!(total.identities_found, 2);
        assert_eq!(total.identities_not_found, 1);
        assert_eq!(total.affiliations_added, 5);
        assert_eq!(total.affiliations_deleted, 1);
    }
}
