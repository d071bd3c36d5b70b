//! Batch run driver: validate, resolve, canonicalize, reconcile.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::coordinator::{Parallelism, fan_out};
use crate::orgs::{OrgCanonicalizer, OrgMappingSource, OrganizationIndex};
use crate::preprocess::{Preprocessed, RecordPreprocessor, drop_ignored, validate};
use crate::reconcile::{AffiliationReconciler, ReconcileMode};
use crate::{
    IdentityId, IdentityStore, IncomingRecord, ReconciliationStats, ResolvedIdentity,
    RosterResult, SourceRecord,
};

pub const DEFAULT_IGNORED_ORGANIZATION: &str = "Unaffiliated";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportOptions {
    pub parallelism: Parallelism,
    pub verbose: bool,
    pub compare: bool,
    pub replace: bool,
    /// Stop after resolution and the organization table load; write nothing.
    pub dry_run: bool,
    pub project_scope: Option<String>,
    pub org_mapping: OrgMappingSource,
    pub ignored_organizations: Vec<String>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            parallelism: Parallelism::default(),
            verbose: false,
            compare: false,
            replace: false,
            dry_run: false,
            project_scope: None,
            org_mapping: OrgMappingSource::None,
            ignored_organizations: vec![DEFAULT_IGNORED_ORGANIZATION.to_string()],
        }
    }
}

impl ImportOptions {
    pub fn mode(&self) -> ReconcileMode {
        ReconcileMode {
            verbose: self.verbose,
            compare: self.compare,
            replace: self.replace,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub stats: ReconciliationStats,
    /// Distinct identities the batch resolved to.
    pub resolved: usize,
    /// Records dropped for having no affiliations.
    pub skipped: usize,
    /// Records no lookup could bind, in input order.
    pub unresolved: Vec<IncomingRecord>,
    pub missing_organizations: BTreeSet<String>,
    /// Organizations in the store when the run started.
    pub organizations_known: usize,
}

pub struct Importer<'a, S: ?Sized> {
    store: &'a S,
    options: ImportOptions,
}

impl<'a, S> Importer<'a, S>
where
    S: IdentityStore + ?Sized,
{
    pub fn new(store: &'a S, options: ImportOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &ImportOptions {
        &self.options
    }

    pub async fn run(&self, records: Vec<SourceRecord>) -> RosterResult<ImportReport> {
        let options = &self.options;
        let mut report = ImportReport::default();

        // Validation happens up front so malformed input aborts before any store call.
        let mut incoming = Vec::with_capacity(records.len());
        for mut record in records {
            drop_ignored(&mut record, &options.ignored_organizations);
            match validate(record)? {
                Some(valid) => incoming.push(valid),
                None => report.skipped += 1,
            }
        }
        info!(
            "resolving {} records ({} skipped) with {} workers",
            incoming.len(),
            report.skipped,
            options.parallelism.worker_count()
        );

        let preprocessor =
            RecordPreprocessor::new(self.store, options.project_scope.clone(), options.verbose);
        let outcomes = fan_out(incoming, options.parallelism, |record| {
            preprocessor.resolve(record)
        })
        .await?;
        let mut identities: BTreeMap<IdentityId, ResolvedIdentity> = BTreeMap::new();
        for outcome in outcomes {
            match outcome {
                Preprocessed::Resolved(identity) => {
                    identities.insert(identity.id.clone(), identity);
                }
                Preprocessed::Unresolved(record) => report.unresolved.push(record),
                Preprocessed::Skipped => report.skipped += 1,
            }
        }
        report.resolved = identities.len();
        info!(
            "resolved {} identities, {} records unresolved",
            report.resolved,
            report.unresolved.len()
        );

        let names: BTreeSet<String> = identities
            .values()
            .flat_map(|identity| identity.affiliations())
            .map(|affiliation| affiliation.organization.clone())
            .collect();
        let index = OrganizationIndex::from_organizations(self.store.list_organizations().await?);
        report.organizations_known = index.len();
        debug!(
            "{} organizations in store, {} distinct names to canonicalize",
            report.organizations_known,
            names.len()
        );
        if options.dry_run {
            info!("dry run, stopping before canonicalization");
            return Ok(report);
        }

        let canonicalizer = OrgCanonicalizer::new(
            self.store,
            index,
            options.org_mapping.clone(),
            options.verbose,
        );
        canonicalizer
            .canonicalize_all(&names, options.parallelism)
            .await?;
        let (index, missing) = canonicalizer.into_parts();
        report.missing_organizations = missing;
        for identity in identities.values_mut() {
            index.annotate(&mut identity.record.affiliations);
        }

        let reconciler = AffiliationReconciler::new(
            self.store,
            &index,
            options.mode(),
            options.project_scope.clone(),
        );
        let deltas = fan_out(identities.values(), options.parallelism, |identity| {
            reconciler.reconcile(identity)
        })
        .await?;
        for delta in &deltas {
            report.stats.merge(delta);
        }
        info!("{}", report.stats);
        Ok(report)
    }
}
