//! Build order: prioritized groups of buildpacks
//!
//! An [`OrderSpec`] is the unresolved form (raw identifiers) that comes from the
//! builder's default order and from user overrides. [`merge_order`] combines them
//! without touching anything external; [`resolve_order`] then resolves every entry
//! and produces the immutable [`Order`] handed to the lifecycle.

pub mod detect;

use crate::buildpack::{BuildpackRef, BuildpackResolver, ResolveError};
use serde::Serialize;
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

pub use detect::{select_group, DetectOutcome, DetectResults};

const OPTIONAL_SUFFIX: char = '?';

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("Cannot resolve buildpack '{reference}': {source}")]
    Unresolvable {
        reference: String,
        #[source]
        source: ResolveError,
    },

    #[error("Build order has no groups")]
    EmptyOrder,

    #[error("Group {0} of the build order has no buildpacks")]
    EmptyGroup(usize),

    #[error("Buildpack {id} appears more than once in group {group}")]
    DuplicateBuildpack { group: usize, id: String },

    #[error("At most one replacement order may be given")]
    ConflictingOverrides,

    #[error("Invalid order entry '{0}'")]
    InvalidEntry(String),
}

/// One unresolved entry; a trailing `?` marks it optional
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySpec {
    pub reference: String,
    pub optional: bool,
}

impl EntrySpec {
    pub fn required(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            optional: false,
        }
    }

    pub fn optional(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            optional: true,
        }
    }

    /// Parses `reference` or `reference?`
    pub fn parse(raw: &str) -> Result<Self, OrderError> {
        let raw = raw.trim();
        let (reference, optional) = match raw.strip_suffix(OPTIONAL_SUFFIX) {
            Some(rest) => (rest.trim(), true),
            None => (raw, false),
        };
        if reference.is_empty() {
            return Err(OrderError::InvalidEntry(raw.to_string()));
        }
        Ok(Self {
            reference: reference.to_string(),
            optional,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupSpec {
    pub entries: Vec<EntrySpec>,
}

impl GroupSpec {
    pub fn new(entries: Vec<EntrySpec>) -> Self {
        Self { entries }
    }

    /// Parses a comma-separated list such as `bp1,bp2?`
    pub fn parse(raw: &str) -> Result<Self, OrderError> {
        let entries = raw
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(EntrySpec::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrderSpec {
    pub groups: Vec<GroupSpec>,
}

impl OrderSpec {
    pub fn new(groups: Vec<GroupSpec>) -> Self {
        Self { groups }
    }
}

/// A user-supplied change to the builder's default order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum OrderOverride {
    /// Try this group before the base order
    Prepend(GroupSpec),
    /// Use this order instead of the builder default
    Replace(OrderSpec),
}

/// Combines the builder default with user overrides.
///
/// A replacement order (at most one) becomes the base instead of the default.
/// Prepended groups then go in front of the base, first given first tried.
pub fn merge_order(default: &OrderSpec, overrides: &[OrderOverride]) -> Result<OrderSpec, OrderError> {
    let mut replacement: Option<&OrderSpec> = None;
    let mut prepended = Vec::new();

    for item in overrides {
        match item {
            OrderOverride::Replace(order) => {
                if replacement.replace(order).is_some() {
                    return Err(OrderError::ConflictingOverrides);
                }
            }
            OrderOverride::Prepend(group) => prepended.push(group.clone()),
        }
    }

    let base = replacement.unwrap_or(default);
    let mut groups = prepended;
    groups.extend(base.groups.iter().cloned());
    Ok(OrderSpec { groups })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupEntry {
    pub buildpack: BuildpackRef,
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Group {
    pub entries: Vec<GroupEntry>,
}

impl Group {
    pub fn buildpacks(&self) -> impl Iterator<Item = &BuildpackRef> {
        self.entries.iter().map(|e| &e.buildpack)
    }

    /// Whether any member asked for network access
    pub fn wants_network(&self) -> bool {
        self.buildpacks().any(|bp| bp.network)
    }

    pub fn display_names(&self) -> Vec<String> {
        self.buildpacks().map(BuildpackRef::display_name).collect()
    }
}

/// Resolved, validated build order; immutable once produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Order {
    groups: Vec<Group>,
}

impl Order {
    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn buildpacks(&self) -> impl Iterator<Item = &BuildpackRef> {
        self.groups.iter().flat_map(Group::buildpacks)
    }

    pub fn wants_network(&self) -> bool {
        self.groups.iter().any(Group::wants_network)
    }

    /// Renders `order.toml` as read by the lifecycle detector
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        #[derive(Serialize)]
        struct OrderToml<'a> {
            order: Vec<GroupToml<'a>>,
        }
        #[derive(Serialize)]
        struct GroupToml<'a> {
            group: Vec<EntryToml<'a>>,
        }
        #[derive(Serialize)]
        struct EntryToml<'a> {
            id: &'a str,
            #[serde(skip_serializing_if = "str::is_empty")]
            version: &'a str,
            #[serde(skip_serializing_if = "std::ops::Not::not")]
            optional: bool,
        }

        let doc = OrderToml {
            order: self
                .groups
                .iter()
                .map(|group| GroupToml {
                    group: group
                        .entries
                        .iter()
                        .map(|entry| EntryToml {
                            id: &entry.buildpack.id,
                            version: &entry.buildpack.version,
                            optional: entry.optional,
                        })
                        .collect(),
                })
                .collect(),
        };
        toml::to_string(&doc)
    }

    /// Validates structure; every group non-empty with no repeated buildpack id
    fn validate(groups: Vec<Group>) -> Result<Self, OrderError> {
        if groups.is_empty() {
            return Err(OrderError::EmptyOrder);
        }
        for (index, group) in groups.iter().enumerate() {
            if group.entries.is_empty() {
                return Err(OrderError::EmptyGroup(index + 1));
            }
            let mut seen = HashSet::new();
            for bp in group.buildpacks() {
                if !seen.insert(bp.id.as_str()) {
                    return Err(OrderError::DuplicateBuildpack {
                        group: index + 1,
                        id: bp.id.clone(),
                    });
                }
            }
        }
        Ok(Self { groups })
    }
}

/// Resolves every entry of `spec`, failing on the first unresolvable one
pub async fn resolve_order(
    spec: &OrderSpec,
    resolver: &BuildpackResolver,
) -> Result<Order, OrderError> {
    if spec.groups.is_empty() {
        return Err(OrderError::EmptyOrder);
    }

    let mut groups = Vec::with_capacity(spec.groups.len());
    for group in &spec.groups {
        let mut entries = Vec::with_capacity(group.entries.len());
        for entry in &group.entries {
            let buildpack = resolver.resolve(&entry.reference).await.map_err(|source| {
                OrderError::Unresolvable {
                    reference: entry.reference.clone(),
                    source,
                }
            })?;
            entries.push(GroupEntry {
                buildpack,
                optional: entry.optional,
            });
        }
        groups.push(Group { entries });
    }

    let order = Order::validate(groups)?;
    debug!(groups = order.groups.len(), "Resolved build order");
    Ok(order)
}

#[cfg(test)]
pub(crate) fn order_of(groups: Vec<Vec<(BuildpackRef, bool)>>) -> Order {
    Order {
        groups: groups
            .into_iter()
            .map(|entries| Group {
                entries: entries
                    .into_iter()
                    .map(|(buildpack, optional)| GroupEntry { buildpack, optional })
                    .collect(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buildpack::{LocalStore, SourceKind};
    use crate::engine::{MockEngine, PullOptions};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn spec(groups: &[&str]) -> OrderSpec {
        OrderSpec::new(groups.iter().map(|g| GroupSpec::parse(g).unwrap()).collect())
    }

    fn resolver(store: &TempDir) -> BuildpackResolver {
        BuildpackResolver::new(
            Arc::new(MockEngine::new()),
            LocalStore::new(store.path()),
            PullOptions::default(),
        )
        .with_bundled(vec![
            BuildpackRef::new("bp1", "0.0.1", SourceKind::Builder),
            BuildpackRef::new("bp2", "0.0.2", SourceKind::Builder).with_network(true),
            BuildpackRef::new("bp3", "0.0.3", SourceKind::Builder),
        ])
    }

    #[test]
    fn test_entry_parse() {
        assert_eq!(EntrySpec::parse("bp1").unwrap(), EntrySpec::required("bp1"));
        assert_eq!(EntrySpec::parse(" bp2? ").unwrap(), EntrySpec::optional("bp2"));
        assert!(EntrySpec::parse("?").is_err());
        assert_eq!(GroupSpec::parse("bp1, bp2?").unwrap().entries.len(), 2);
    }

    #[test]
    fn test_no_overrides_keeps_default() {
        let default = spec(&["bp1,bp2", "bp3"]);
        assert_eq!(merge_order(&default, &[]).unwrap(), default);
    }

    #[test]
    fn test_replacement_discards_default() {
        let default = spec(&["bp1,bp2"]);
        let replacement = spec(&["bp3"]);
        let merged = merge_order(&default, &[OrderOverride::Replace(replacement.clone())]).unwrap();
        assert_eq!(merged, replacement);
    }

    #[test]
    fn test_prepend_goes_first() {
        let default = spec(&["bp1,bp2", "bp3"]);
        let merged = merge_order(
            &default,
            &[OrderOverride::Prepend(GroupSpec::parse("bp3,bp1?").unwrap())],
        )
        .unwrap();

        assert_eq!(merged.groups.len(), 3);
        assert_eq!(merged.groups[0], GroupSpec::parse("bp3,bp1?").unwrap());
        assert_eq!(merged.groups[1..], default.groups[..]);
    }

    #[test]
    fn test_prepend_onto_replacement() {
        let merged = merge_order(
            &spec(&["bp1"]),
            &[
                OrderOverride::Prepend(GroupSpec::parse("bp2").unwrap()),
                OrderOverride::Replace(spec(&["bp3"])),
            ],
        )
        .unwrap();
        assert_eq!(merged, spec(&["bp2", "bp3"]));
    }

    #[test]
    fn test_two_replacements_rejected() {
        let result = merge_order(
            &spec(&["bp1"]),
            &[
                OrderOverride::Replace(spec(&["bp2"])),
                OrderOverride::Replace(spec(&["bp3"])),
            ],
        );
        assert!(matches!(result, Err(OrderError::ConflictingOverrides)));
    }

    #[tokio::test]
    async fn test_resolve_order() {
        let store = TempDir::new().unwrap();
        let order = resolve_order(&spec(&["bp1,bp2?", "bp3"]), &resolver(&store))
            .await
            .unwrap();

        assert_eq!(order.groups().len(), 2);
        assert!(order.groups()[0].entries[1].optional);
        assert!(order.groups()[0].wants_network());
        assert!(!order.groups()[1].wants_network());
        assert_eq!(order.buildpacks().count(), 3);
    }

    #[tokio::test]
    async fn test_unresolvable_entry_named() {
        let store = TempDir::new().unwrap();
        let err = resolve_order(&spec(&["bp1,missing/bp"]), &resolver(&store))
            .await
            .unwrap_err();
        match err {
            OrderError::Unresolvable { reference, .. } => assert_eq!(reference, "missing/bp"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_structural_validation() {
        let store = TempDir::new().unwrap();
        let resolver = resolver(&store);

        assert!(matches!(
            resolve_order(&OrderSpec::default(), &resolver).await,
            Err(OrderError::EmptyOrder)
        ));
        assert!(matches!(
            resolve_order(&OrderSpec::new(vec![GroupSpec::default()]), &resolver).await,
            Err(OrderError::EmptyGroup(1))
        ));
        assert!(matches!(
            resolve_order(&spec(&["bp1", "bp2,bp2@0.0.2"]), &resolver).await,
            Err(OrderError::DuplicateBuildpack { group: 2, .. })
        ));
    }

    #[test]
    fn test_order_toml() {
        let order = order_of(vec![vec![
            (BuildpackRef::new("bp1", "0.0.1", SourceKind::Builder), false),
            (BuildpackRef::new("bp2", "0.0.2", SourceKind::Builder), true),
        ]]);
        let rendered = order.to_toml().unwrap();

        let parsed: toml::Value = toml::from_str(&rendered).unwrap();
        let group = &parsed["order"][0]["group"];
        assert_eq!(group[0]["id"].as_str(), Some("bp1"));
        assert_eq!(group[0].get("optional"), None);
        assert_eq!(group[1]["optional"].as_bool(), Some(true));
    }
}
