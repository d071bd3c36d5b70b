//! Organization name canonicalization.
//!
//! Names resolve through three tiers: the exact-name index, the lowercase
//! index, and finally an ordered list of regex aliases evaluated by the store.
//! Every successful fallback is written back into the exact-name index so a
//! repeated name hits the first tier.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{OnceCell, RwLock};

use crate::coordinator::{Parallelism, fan_out};
use crate::{Affiliation, OrgId, Organization, OrganizationApi, RosterError, RosterResult};

#[derive(Clone, Debug, Default)]
pub struct OrganizationIndex {
    by_name: HashMap<String, OrgId>,
    by_id: HashMap<OrgId, String>,
    by_lower_name: HashMap<String, OrgId>,
    lower_by_id: HashMap<OrgId, String>,
}

impl OrganizationIndex {
    pub fn from_organizations(organizations: impl IntoIterator<Item = Organization>) -> Self {
        let mut index = Self::default();
        for organization in organizations {
            let lower = organization.name.to_lowercase();
            index.by_name.insert(organization.name.clone(), organization.id);
            index.by_id.insert(organization.id, organization.name);
            index.by_lower_name.insert(lower.clone(), organization.id);
            index.lower_by_id.insert(organization.id, lower);
        }
        index
    }

    pub fn get(&self, name: &str) -> Option<OrgId> {
        self.by_name.get(name).copied()
    }

    pub fn get_lowercase(&self, lower_name: &str) -> Option<OrgId> {
        self.by_lower_name.get(lower_name).copied()
    }

    /// Store name of `id`; aliases learned during the run never replace it.
    pub fn name_of(&self, id: OrgId) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    pub fn lowercase_name_of(&self, id: OrgId) -> Option<&str> {
        self.lower_by_id.get(&id).map(String::as_str)
    }

    /// Cache `name` as a direct alias of `id`.
    pub fn learn_alias(&mut self, name: &str, id: OrgId) {
        self.by_name.insert(name.to_string(), id);
    }

    /// Number of names (store names plus learned aliases) in the direct index.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Fill `org_id` on every affiliation whose name is in the direct index.
    pub fn annotate(&self, affiliations: &mut [Affiliation]) {
        for affiliation in affiliations {
            affiliation.org_id = self.get(&affiliation.organization);
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgNameMapping {
    pub pattern: String,
    pub canonical_name: String,
}

impl OrgNameMapping {
    pub fn new(pattern: impl Into<String>, canonical_name: impl Into<String>) -> Self {
        Self {
            pattern: collapse_escapes(&pattern.into()),
            canonical_name: canonical_name.into(),
        }
    }
}

/// Mapping files double their backslashes; the store expects single ones.
fn collapse_escapes(pattern: &str) -> String {
    pattern.replace("\\\\", "\\")
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OrgMappingSource {
    #[default]
    None,
    File {
        path: PathBuf,
    },
    Inline {
        mappings: Vec<OrgNameMapping>,
    },
}

#[derive(Deserialize)]
struct MappingFile {
    #[serde(default)]
    mappings: Vec<(String, String)>,
}

pub fn parse_mappings(contents: &str) -> RosterResult<Vec<OrgNameMapping>> {
    let file: MappingFile = serde_yaml::from_str(contents)
        .map_err(|err| RosterError::malformed(format!("organization mappings: {err}")))?;
    Ok(file
        .mappings
        .into_iter()
        .map(|(pattern, canonical_name)| OrgNameMapping::new(pattern, canonical_name))
        .collect())
}

pub async fn load_mappings(source: &OrgMappingSource) -> RosterResult<Vec<OrgNameMapping>> {
    match source {
        OrgMappingSource::None => Ok(Vec::new()),
        OrgMappingSource::Inline { mappings } => Ok(mappings
            .iter()
            .map(|mapping| OrgNameMapping::new(&mapping.pattern, &mapping.canonical_name))
            .collect()),
        OrgMappingSource::File { path } => {
            let contents = fs::read_to_string(path).await.map_err(|err| {
                RosterError::config(format!("read mapping file {}: {err}", path.display()))
            })?;
            parse_mappings(&contents).map_err(|err| err.context(path.display().to_string()))
        }
    }
}

/// How a name was canonicalized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Canonicalized {
    Direct(OrgId),
    CaseInsensitive(OrgId),
    Pattern { id: OrgId, pattern: String },
    Missing,
}

impl Canonicalized {
    pub fn org_id(&self) -> Option<OrgId> {
        match self {
            Self::Direct(id) | Self::CaseInsensitive(id) => Some(*id),
            Self::Pattern { id, .. } => Some(*id),
            Self::Missing => None,
        }
    }
}

#[derive(Default)]
struct CanonicalState {
    index: OrganizationIndex,
    missing: BTreeSet<String>,
}

pub struct OrgCanonicalizer<'a, S: ?Sized> {
    store: &'a S,
    state: RwLock<CanonicalState>,
    source: OrgMappingSource,
    mappings: OnceCell<Vec<OrgNameMapping>>,
    mapping_loads: AtomicUsize,
    verbose: bool,
}

impl<'a, S> OrgCanonicalizer<'a, S>
where
    S: OrganizationApi + Sync + ?Sized,
{
    pub fn new(
        store: &'a S,
        index: OrganizationIndex,
        source: OrgMappingSource,
        verbose: bool,
    ) -> Self {
        Self {
            store,
            state: RwLock::new(CanonicalState {
                index,
                missing: BTreeSet::new(),
            }),
            source,
            mappings: OnceCell::new(),
            mapping_loads: AtomicUsize::new(0),
            verbose,
        }
    }

    /// Load the mapping list on first use; concurrent callers share one load.
    pub async fn ensure_loaded(&self) -> RosterResult<&[OrgNameMapping]> {
        let mappings = self
            .mappings
            .get_or_try_init(|| async {
                self.mapping_loads.fetch_add(1, Ordering::SeqCst);
                let mappings = load_mappings(&self.source).await?;
                debug!("loaded {} organization name mappings", mappings.len());
                Ok::<_, RosterError>(mappings)
            })
            .await?;
        Ok(mappings.as_slice())
    }

    pub fn mapping_loads(&self) -> usize {
        self.mapping_loads.load(Ordering::SeqCst)
    }

    pub async fn canonicalize(&self, name: &str) -> RosterResult<Canonicalized> {
        let lower = name.to_lowercase();
        let (direct, case_insensitive) = {
            let state = self.state.read().await;
            (state.index.get(name), state.index.get_lowercase(&lower))
        };
        if let Some(id) = direct {
            return Ok(Canonicalized::Direct(id));
        }
        if let Some(id) = case_insensitive {
            self.state.write().await.index.learn_alias(name, id);
            return Ok(Canonicalized::CaseInsensitive(id));
        }

        let mappings = self.ensure_loaded().await?;
        if self.verbose {
            debug!("missing '{name}', trying {} mappings", mappings.len());
        }
        if let Some(found) = self.match_mappings(name, name, mappings, false).await? {
            return Ok(found);
        }
        if self.verbose {
            debug!("missing '{name}' (trying lower case '{lower}')");
        }
        if let Some(found) = self.match_mappings(name, &lower, mappings, true).await? {
            return Ok(found);
        }

        info!("nothing found for '{name}'");
        self.state.write().await.missing.insert(name.to_string());
        Ok(Canonicalized::Missing)
    }

    async fn match_mappings(
        &self,
        name: &str,
        candidate: &str,
        mappings: &[OrgNameMapping],
        lowercase: bool,
    ) -> RosterResult<Option<Canonicalized>> {
        for mapping in mappings {
            let matched = self
                .store
                .matches_pattern(candidate, &mapping.pattern)
                .await
                .map_err(|err| {
                    err.context(format!(
                        "match organization '{candidate}' against '{}'",
                        mapping.pattern
                    ))
                })?;
            if !matched {
                if self.verbose {
                    debug!("'{candidate}' is not matching '{}'", mapping.pattern);
                }
                continue;
            }
            let target = {
                let state = self.state.read().await;
                if lowercase {
                    state
                        .index
                        .get_lowercase(&mapping.canonical_name.to_lowercase())
                } else {
                    state.index.get(&mapping.canonical_name)
                }
            };
            let Some(id) = target else {
                warn!(
                    "'{candidate}' maps to '{}' which cannot be found",
                    mapping.canonical_name
                );
                continue;
            };
            if self.verbose {
                debug!(
                    "added mapping '{name}' -> '{}' -> {id}",
                    mapping.canonical_name
                );
            }
            self.state.write().await.index.learn_alias(name, id);
            return Ok(Some(Canonicalized::Pattern {
                id,
                pattern: mapping.pattern.clone(),
            }));
        }
        Ok(None)
    }

    /// Canonicalize every distinct name with the given parallelism.
    pub async fn canonicalize_all(
        &self,
        names: &BTreeSet<String>,
        parallelism: Parallelism,
    ) -> RosterResult<Vec<(String, Canonicalized)>> {
        fan_out(names.iter(), parallelism, |name| async move {
            let outcome = self.canonicalize(name).await?;
            Ok((name.clone(), outcome))
        })
        .await
    }

    pub async fn missing(&self) -> BTreeSet<String> {
        self.state.read().await.missing.clone()
    }

    pub fn into_parts(self) -> (OrganizationIndex, BTreeSet<String>) {
        let state = self.state.into_inner();
        (state.index, state.missing)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use super::{
        Canonicalized, OrgCanonicalizer, OrgMappingSource, OrgNameMapping, OrganizationIndex,
        load_mappings, parse_mappings,
    };
    use crate::coordinator::Parallelism;
    use crate::memory::MemoryIdentityStore;
    use crate::{OrgId, OrganizationApi};

    async fn index_of(store: &MemoryIdentityStore) -> OrganizationIndex {
        OrganizationIndex::from_organizations(store.list_organizations().await.expect("orgs"))
    }

    fn store_with_orgs() -> MemoryIdentityStore {
        let store = MemoryIdentityStore::new();
        store.add_organization(1, "Acme Corp");
        store.add_organization(2, "Initech");
        store.add_organization(3, "Globex Corporation");
        store
    }

    fn inline(mappings: &[(&str, &str)]) -> OrgMappingSource {
        OrgMappingSource::Inline {
            mappings: mappings
                .iter()
                .map(|(pattern, target)| OrgNameMapping::new(*pattern, *target))
                .collect(),
        }
    }

    #[tokio::test]
    async fn exact_and_case_insensitive_resolve_to_same_id() {
        let store = store_with_orgs();
        let canonicalizer =
            OrgCanonicalizer::new(&store, index_of(&store).await, OrgMappingSource::None, false);
        let exact = canonicalizer.canonicalize("Acme Corp").await.expect("exact");
        let folded = canonicalizer.canonicalize("acme corp").await.expect("folded");
        assert_eq!(exact, Canonicalized::Direct(OrgId(1)));
        assert_eq!(folded, Canonicalized::CaseInsensitive(OrgId(1)));
        let again = canonicalizer.canonicalize("acme corp").await.expect("again");
        assert_eq!(again, Canonicalized::Direct(OrgId(1)));
        assert_eq!(canonicalizer.mapping_loads(), 0);
    }

    #[tokio::test]
    async fn pattern_alias_is_learned_and_not_reevaluated() {
        let store = store_with_orgs();
        let canonicalizer = OrgCanonicalizer::new(
            &store,
            index_of(&store).await,
            inline(&[("^Globex( Inc\\.?)?$", "Globex Corporation")]),
            false,
        );
        let first = canonicalizer.canonicalize("Globex Inc.").await.expect("first");
        assert_eq!(first.org_id(), Some(OrgId(3)));
        assert!(matches!(first, Canonicalized::Pattern { .. }));
        let evaluations = store.pattern_evaluations();
        assert_eq!(evaluations, 1);
        let second = canonicalizer.canonicalize("Globex Inc.").await.expect("second");
        assert_eq!(second, Canonicalized::Direct(OrgId(3)));
        assert_eq!(store.pattern_evaluations(), evaluations);
    }

    #[tokio::test]
    async fn lowercase_pass_runs_after_original_case_pass() {
        let store = store_with_orgs();
        let canonicalizer = OrgCanonicalizer::new(
            &store,
            index_of(&store).await,
            inline(&[("^initech ltd$", "Initech")]),
            false,
        );
        let outcome = canonicalizer.canonicalize("INITECH Ltd").await.expect("lower");
        assert_eq!(outcome.org_id(), Some(OrgId(2)));
        assert_eq!(store.pattern_evaluations(), 2);
    }

    #[tokio::test]
    async fn unknown_target_is_skipped_and_next_pattern_wins() {
        let store = store_with_orgs();
        let canonicalizer = OrgCanonicalizer::new(
            &store,
            index_of(&store).await,
            inline(&[("^Acme", "Acme Holdings"), ("^Acme", "Acme Corp")]),
            false,
        );
        let outcome = canonicalizer
            .canonicalize("Acme Corporation")
            .await
            .expect("pattern");
        assert_eq!(
            outcome,
            Canonicalized::Pattern {
                id: OrgId(1),
                pattern: "^Acme".to_string()
            }
        );
    }

    #[tokio::test]
    async fn unmatched_name_is_recorded_missing() {
        let store = store_with_orgs();
        let canonicalizer = OrgCanonicalizer::new(
            &store,
            index_of(&store).await,
            inline(&[("^Globex", "Globex Corporation")]),
            false,
        );
        let outcome = canonicalizer.canonicalize("Hooli").await.expect("missing");
        assert_eq!(outcome, Canonicalized::Missing);
        let (_, missing) = canonicalizer.into_parts();
        assert_eq!(missing, BTreeSet::from(["Hooli".to_string()]));
    }

    #[tokio::test]
    async fn mappings_load_once_under_concurrency() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("orgs.yaml");
        std::fs::write(&path, "mappings:\n  - ['^Globex', 'Globex Corporation']\n")
            .expect("write mappings");
        let store = store_with_orgs().with_latency(Duration::from_millis(2));
        let canonicalizer = OrgCanonicalizer::new(
            &store,
            index_of(&store).await,
            OrgMappingSource::File { path },
            false,
        );
        let names: BTreeSet<String> = ["Hooli", "Globex AG", "Vandelay", "Globex SA", "Pied Piper"]
            .iter()
            .map(|name| name.to_string())
            .collect();
        let outcomes = canonicalizer
            .canonicalize_all(&names, Parallelism::workers(4))
            .await
            .expect("all");
        assert_eq!(outcomes.len(), 5);
        assert_eq!(canonicalizer.mapping_loads(), 1);
        assert!(store.peak_in_flight() > 1);
        let (index, missing) = canonicalizer.into_parts();
        assert_eq!(index.get("Globex AG"), Some(OrgId(3)));
        assert_eq!(index.get("Globex SA"), Some(OrgId(3)));
        assert_eq!(index.name_of(OrgId(3)), Some("Globex Corporation"));
        assert_eq!(missing.len(), 3);
    }

    #[tokio::test]
    async fn inline_mappings_collapse_doubled_backslashes() {
        let source: OrgMappingSource = serde_yaml::from_str(
            "kind: inline\nmappings:\n  - pattern: '^Acme\\\\s+Corp$'\n    canonical_name: Acme Corp\n",
        )
        .expect("source");
        let mappings = load_mappings(&source).await.expect("mappings");
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].pattern, "^Acme\\s+Corp$");
    }

    #[test]
    fn mapping_file_collapses_doubled_backslashes() {
        let mappings = parse_mappings("mappings:\n  - ['^Acme\\\\s+Corp$', 'Acme Corp']\n")
            .expect("mappings");
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].pattern, "^Acme\\s+Corp$");
        assert_eq!(mappings[0].canonical_name, "Acme Corp");
    }
}
