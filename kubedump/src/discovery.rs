//! Discovery of the resource kinds served by the API server

use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube_client::Client;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

/// A resource kind served by the API server at its group's preferred version
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceKind {
    /// The API group, empty for the core group
    pub group: String,

    /// The API version
    pub version: String,

    /// The plural resource name, e.g. `secrets`
    pub plural: String,

    /// The kind, e.g. `Secret`
    pub kind: String,

    /// Whether objects of this kind live in a namespace
    pub namespaced: bool,

    /// The verbs supported by the resource
    pub verbs: Vec<String>,
}

/// A unit of resource-dump work: one kind, listed in one namespace (or
/// cluster-wide for cluster-scoped kinds)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KindScope {
    /// The kind to list
    pub kind: ResourceKind,

    /// The namespace to list, or `None` for cluster-scoped kinds
    pub namespace: Option<String>,
}

/// Indicates that discovery did not fully succeed
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// Some API groups could not be discovered; the kinds from the remaining
    /// groups are still available
    #[error("failed to discover {} API group(s)", failed.len())]
    Partial {
        /// Kinds from the groups that were discovered
        kinds: Vec<ResourceKind>,
        /// Failures, keyed by group-version
        failed: BTreeMap<String, kube_client::Error>,
    },

    /// No groups could be discovered
    #[error("failed to discover API groups: {0}")]
    Failed(#[source] kube_client::Error),
}

/// Resources that are never dumped unless overridden
pub const DEFAULT_IGNORED_RESOURCES: [&str; 4] = [
    "componentstatuses",
    "podtemplates",
    "replicationcontrollers",
    "controllerrevisions",
];

// === impl ResourceKind ===

impl ResourceKind {
    /// Returns the group-version string, e.g. `v1` or `apps/v1`
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Returns true iff the resource supports the `list` verb
    pub fn is_listable(&self) -> bool {
        self.verbs.iter().any(|v| v == "list")
    }

    /// Returns true iff the kind should be dumped: it must be listable and not
    /// named in `ignored`
    pub fn is_eligible(&self, ignored: &BTreeSet<String>) -> bool {
        self.is_listable() && !ignored.contains(&self.plural)
    }

    /// Returns true iff this is the core `v1` `Secret` kind
    pub fn is_secret(&self) -> bool {
        self.group.is_empty() && self.version == "v1" && self.plural == "secrets"
    }

    pub(crate) fn api_resource(&self) -> kube_core::ApiResource {
        let gvk = kube_core::GroupVersionKind::gvk(&self.group, &self.version, &self.kind);
        kube_core::ApiResource::from_gvk_with_plural(&gvk, &self.plural)
    }
}

// === impl KindScope ===

impl KindScope {
    /// Expands eligible `kinds` into one scope per namespace for namespaced
    /// kinds and one cluster-wide scope for cluster-scoped kinds
    pub fn expand(
        kinds: &[ResourceKind],
        namespaces: &[String],
        ignored: &BTreeSet<String>,
    ) -> Vec<Self> {
        let mut scopes = Vec::new();
        for kind in kinds.iter().filter(|k| k.is_eligible(ignored)) {
            if kind.namespaced {
                scopes.extend(namespaces.iter().map(|ns| KindScope {
                    kind: kind.clone(),
                    namespace: Some(ns.clone()),
                }));
            } else {
                scopes.push(KindScope {
                    kind: kind.clone(),
                    namespace: None,
                });
            }
        }
        scopes
    }
}

impl fmt::Display for KindScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.api_version(), self.kind.plural)?;
        if let Some(ns) = &self.namespace {
            write!(f, " in namespace {ns}")?;
        }
        Ok(())
    }
}

/// Discovers the resources served at each API group's preferred version
///
/// Subresources (e.g. `pods/log`) are omitted. Failing to discover an
/// individual group yields [`DiscoveryError::Partial`]; failing to enumerate
/// the groups at all yields [`DiscoveryError::Failed`].
pub async fn preferred_resources(client: &Client) -> Result<Vec<ResourceKind>, DiscoveryError> {
    let mut group_versions = Vec::new();

    let core = client
        .list_core_api_versions()
        .await
        .map_err(DiscoveryError::Failed)?;
    if let Some(version) = core.versions.first() {
        group_versions.push((String::new(), version.clone()));
    }

    let groups = client
        .list_api_groups()
        .await
        .map_err(DiscoveryError::Failed)?;
    for group in groups.groups {
        if let Some(version) = preferred_version(&group) {
            group_versions.push((group.name.clone(), version));
        }
    }

    let mut kinds = Vec::new();
    let mut failed = BTreeMap::new();
    for (group, version) in group_versions {
        let res = if group.is_empty() {
            client.list_core_api_resources(&version).await
        } else {
            client
                .list_api_group_resources(&format!("{group}/{version}"))
                .await
        };
        match res {
            Ok(list) => {
                tracing::debug!(
                    group = %list.group_version,
                    resources = list.resources.len(),
                    "Discovered"
                );
                kinds.extend(
                    list.resources
                        .into_iter()
                        .filter(|r| !r.name.contains('/'))
                        .map(|r| ResourceKind {
                            group: group.clone(),
                            version: version.clone(),
                            plural: r.name,
                            kind: r.kind,
                            namespaced: r.namespaced,
                            verbs: r.verbs,
                        }),
                );
            }
            Err(error) => {
                let gv = if group.is_empty() {
                    version
                } else {
                    format!("{group}/{version}")
                };
                failed.insert(gv, error);
            }
        }
    }

    if failed.is_empty() {
        Ok(kinds)
    } else {
        Err(DiscoveryError::Partial { kinds, failed })
    }
}

fn preferred_version(group: &metav1::APIGroup) -> Option<String> {
    group
        .preferred_version
        .as_ref()
        .or_else(|| group.versions.first())
        .map(|gv| gv.version.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind(group: &str, plural: &str, namespaced: bool, verbs: &[&str]) -> ResourceKind {
        ResourceKind {
            group: group.to_string(),
            version: "v1".to_string(),
            plural: plural.to_string(),
            kind: plural.trim_end_matches('s').to_string(),
            namespaced,
            verbs: verbs.iter().map(|v| v.to_string()).collect(),
        }
    }

    fn default_ignored() -> BTreeSet<String> {
        DEFAULT_IGNORED_RESOURCES
            .iter()
            .map(|r| r.to_string())
            .collect()
    }

    #[test]
    fn eligibility() {
        let ignored = default_ignored();
        assert!(kind("", "pods", true, &["get", "list", "watch"]).is_eligible(&ignored));
        assert!(!kind("", "bindings", true, &["create"]).is_eligible(&ignored));
        assert!(!kind("", "componentstatuses", false, &["get", "list"]).is_eligible(&ignored));
        assert!(!kind("apps", "controllerrevisions", true, &["list"]).is_eligible(&ignored));
    }

    #[test]
    fn expands_scopes() {
        let kinds = vec![
            kind("", "secrets", true, &["list"]),
            kind("", "nodes", false, &["list"]),
            kind("", "bindings", true, &["create"]),
            kind("", "podtemplates", true, &["list"]),
        ];
        let namespaces = vec!["a".to_string(), "b".to_string()];
        let scopes = KindScope::expand(&kinds, &namespaces, &default_ignored());

        let rendered = scopes.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(
            rendered,
            vec![
                "v1/secrets in namespace a",
                "v1/secrets in namespace b",
                "v1/nodes",
            ]
        );
    }

    #[test]
    fn no_namespaces_leaves_cluster_scopes() {
        let kinds = vec![
            kind("", "secrets", true, &["list"]),
            kind("rbac.authorization.k8s.io", "clusterroles", false, &["list"]),
        ];
        let scopes = KindScope::expand(&kinds, &[], &BTreeSet::new());
        assert_eq!(scopes.len(), 1);
        assert_eq!(scopes[0].namespace, None);
        assert_eq!(scopes[0].kind.api_version(), "rbac.authorization.k8s.io/v1");
    }

    #[test]
    fn secrets_are_core_v1_only() {
        assert!(kind("", "secrets", true, &["list"]).is_secret());
        assert!(!kind("example.com", "secrets", true, &["list"]).is_secret());
    }

    #[test]
    fn prefers_advertised_version() {
        let gv = |v: &str| metav1::GroupVersionForDiscovery {
            group_version: format!("batch/{v}"),
            version: v.to_string(),
        };
        let mut group = metav1::APIGroup {
            name: "batch".to_string(),
            preferred_version: Some(gv("v1")),
            versions: vec![gv("v1beta1"), gv("v1")],
            ..Default::default()
        };
        assert_eq!(preferred_version(&group).as_deref(), Some("v1"));

        group.preferred_version = None;
        assert_eq!(preferred_version(&group).as_deref(), Some("v1beta1"));
    }
}
