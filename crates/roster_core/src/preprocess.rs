//! Validation of source records ahead of identity resolution.

use std::collections::BTreeMap;

use log::debug;
use serde::Deserialize;
use serde::de::IgnoredAny;

use crate::resolver::IdentityResolver;
use crate::{
    Affiliation, IdentityLookupApi, IncomingRecord, ResolvedIdentity, RosterError, RosterResult,
    SourceRecord,
};

/// Outcome of preprocessing one source record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Preprocessed {
    /// The record carries no affiliations and is not processed further.
    Skipped,
    Resolved(ResolvedIdentity),
    Unresolved(IncomingRecord),
}

/// Second decode pass over the side channel: every key other than the strict
/// fields names a source system and maps to its usernames.
#[derive(Deserialize)]
struct AliasDocument {
    #[serde(default, rename = "profile")]
    _profile: Option<IgnoredAny>,
    #[serde(default, rename = "enrollments")]
    _enrollments: Option<IgnoredAny>,
    #[serde(default, rename = "email")]
    _email: Option<IgnoredAny>,
    #[serde(flatten)]
    aliases: BTreeMap<String, Vec<String>>,
}

pub fn extract_aliases(side_channel: &serde_yaml::Value) -> RosterResult<BTreeMap<String, Vec<String>>> {
    let document: AliasDocument = serde_yaml::from_value(side_channel.clone())
        .map_err(|err| RosterError::malformed(format!("alias fields: {err}")))?;
    Ok(document.aliases)
}

/// Drop affiliations with an ignored organization name.
pub fn drop_ignored(record: &mut SourceRecord, ignored: &[String]) {
    let before = record.affiliations.len();
    record
        .affiliations
        .retain(|affiliation| !ignored.contains(&affiliation.organization));
    let dropped = before - record.affiliations.len();
    if dropped > 0 {
        debug!(
            "dropped {dropped} ignored affiliations of '{}'",
            record.profile.name
        );
    }
}

/// Check mandatory fields, extract aliases and default the date bounds.
///
/// Returns `None` for records without affiliations. Never touches the store.
pub fn validate(record: SourceRecord) -> RosterResult<Option<IncomingRecord>> {
    if record.profile.name.is_empty() {
        return Err(RosterError::malformed(format!(
            "profile without name (emails {:?})",
            record.emails
        )));
    }
    if record.affiliations.is_empty() {
        return Ok(None);
    }
    let aliases = extract_aliases(&record.side_channel)
        .map_err(|err| err.context(format!("record '{}'", record.profile.name)))?;
    let mut affiliations = Vec::with_capacity(record.affiliations.len());
    for raw in record.affiliations {
        if raw.organization.is_empty() {
            return Err(RosterError::malformed(format!(
                "affiliation without organization name in record '{}'",
                record.profile.name
            )));
        }
        affiliations.push(Affiliation::bounded(raw));
    }
    Ok(Some(IncomingRecord {
        profile: record.profile,
        emails: record.emails,
        aliases,
        affiliations,
    }))
}

pub struct RecordPreprocessor<'a, S: ?Sized> {
    resolver: IdentityResolver<'a, S>,
    project_scope: Option<String>,
}

impl<'a, S> RecordPreprocessor<'a, S>
where
    S: IdentityLookupApi + Sync + ?Sized,
{
    pub fn new(store: &'a S, project_scope: Option<String>, verbose: bool) -> Self {
        Self {
            resolver: IdentityResolver::new(store, verbose),
            project_scope,
        }
    }

    /// Resolve an already validated record.
    pub async fn resolve(&self, record: IncomingRecord) -> RosterResult<Preprocessed> {
        match self.resolver.resolve(&record).await? {
            Some(id) => Ok(Preprocessed::Resolved(ResolvedIdentity::new(
                id,
                record,
                self.project_scope.as_deref(),
            ))),
            None => Ok(Preprocessed::Unresolved(record)),
        }
    }

    pub async fn process(&self, record: SourceRecord) -> RosterResult<Preprocessed> {
        match validate(record)? {
            Some(incoming) => self.resolve(incoming).await,
            None => Ok(Preprocessed::Skipped),
        }
    }
}
