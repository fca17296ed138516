use std::collections::BTreeMap;
use std::fmt;

use flotilla_core::{BundleSummary, ResourceCounts, ResourceKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// State of a deployed resource, as shown on the parent's status.
///
/// Serialized as its plain name. Names outside the known set (agent summary
/// states such as `in-progress`) are carried through as [`ResourceState::Other`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourceState {
    Ready,
    WaitApplied,
    ErrApplied,
    Modified,
    Orphaned,
    Missing,
    Unknown,
    NotReady,
    Other(String),
}

impl ResourceState {
    pub fn as_str(&self) -> &str {
        match self {
            ResourceState::Ready => "Ready",
            ResourceState::WaitApplied => "WaitApplied",
            ResourceState::ErrApplied => "ErrApplied",
            ResourceState::Modified => "Modified",
            ResourceState::Orphaned => "Orphaned",
            ResourceState::Missing => "Missing",
            ResourceState::Unknown => "Unknown",
            ResourceState::NotReady => "NotReady",
            ResourceState::Other(s) => s,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.as_str().is_empty()
    }

    /// Count this state into its bucket. Every resource counts towards
    /// `desired_ready`; unrecognised states land in `not_ready`.
    pub fn tally(&self, counts: &mut ResourceCounts) {
        counts.desired_ready += 1;
        match self {
            ResourceState::Ready => counts.ready += 1,
            ResourceState::WaitApplied => counts.wait_applied += 1,
            ResourceState::Modified => counts.modified += 1,
            ResourceState::Orphaned => counts.orphaned += 1,
            ResourceState::Missing => counts.missing += 1,
            ResourceState::Unknown => counts.unknown += 1,
            _ => counts.not_ready += 1,
        }
    }
}

impl From<&str> for ResourceState {
    fn from(s: &str) -> Self {
        match s {
            "Ready" => ResourceState::Ready,
            "WaitApplied" => ResourceState::WaitApplied,
            "ErrApplied" => ResourceState::ErrApplied,
            "Modified" => ResourceState::Modified,
            "Orphaned" => ResourceState::Orphaned,
            "Missing" => ResourceState::Missing,
            "Unknown" => ResourceState::Unknown,
            "NotReady" => ResourceState::NotReady,
            other => ResourceState::Other(other.to_string()),
        }
    }
}

impl From<String> for ResourceState {
    fn from(s: String) -> Self {
        ResourceState::from(s.as_str())
    }
}

impl From<ResourceState> for String {
    fn from(s: ResourceState) -> Self {
        s.as_str().to_string()
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one resource on one downstream cluster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerClusterState {
    /// `clusterNamespace/clusterName`.
    pub cluster_id: String,
    pub state: ResourceState,
    #[serde(default, skip_serializing_if = "is_false")]
    pub error: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub transitioning: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Parsed merge patch of a modified resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<Map<String, Value>>,
}

impl PerClusterState {
    pub fn new(cluster_id: impl Into<String>, state: ResourceState) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            state,
            error: false,
            transitioning: false,
            message: String::new(),
            patch: None,
        }
    }

    fn patch_text(&self) -> String {
        self.patch.as_ref().map(|p| Value::Object(p.clone()).to_string()).unwrap_or_default()
    }

    /// Total order used to sort a resource's per-cluster list: cluster id
    /// first, the remaining fields break ties.
    pub(crate) fn sort_cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.cluster_id
            .cmp(&other.cluster_id)
            .then_with(|| self.state.as_str().cmp(other.state.as_str()))
            .then_with(|| self.error.cmp(&other.error))
            .then_with(|| self.transitioning.cmp(&other.transitioning))
            .then_with(|| self.message.cmp(&other.message))
            .then_with(|| self.patch_text().cmp(&other.patch_text()))
    }
}

/// Summary of one distinct deployed resource across all reporting clusters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
    /// Lowercased kind prefixed with `group.`; no prefix for the core group.
    #[serde(rename = "type")]
    pub type_: String,
    /// `name`, or `namespace/name` for namespaced resources.
    pub id: String,
    pub state: ResourceState,
    #[serde(default, skip_serializing_if = "is_false")]
    pub error: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub transitioning: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default)]
    pub per_cluster_state: Vec<PerClusterState>,
    /// Some reporting deployment truncated or failed to report its states.
    #[serde(default, skip_serializing_if = "is_false")]
    pub incomplete_state: bool,
}

impl Resource {
    pub fn new(key: ResourceKey, incomplete_state: bool) -> Self {
        let (type_, id) = type_and_id(&key);
        Self {
            api_version: key.api_version,
            kind: key.kind,
            namespace: key.namespace,
            name: key.name,
            type_,
            id,
            state: ResourceState::Other(String::new()),
            error: false,
            transitioning: false,
            message: String::new(),
            per_cluster_state: Vec::new(),
            incomplete_state,
        }
    }

    /// `type/id`, the display sort key.
    pub fn sort_key(&self) -> String {
        format!("{}/{}", self.type_, self.id)
    }
}

/// Derive the display `(type, id)` pair for a resource key.
pub fn type_and_id(key: &ResourceKey) -> (String, String) {
    let group = key.api_version.split('/').next().unwrap_or_default();
    let prefix = match group {
        "v1" | "" => String::new(),
        g => format!("{g}."),
    };
    let type_ = prefix + &key.kind.to_lowercase();
    if key.namespace.is_empty() {
        (type_, key.name.clone())
    } else {
        (type_, format!("{}/{}", key.namespace, key.name))
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Resource-related status fields shared by the parent kinds (bundles,
/// GitRepos) that aggregate deployments.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBase {
    #[serde(default)]
    pub summary: BundleSummary,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Resource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_errors: Vec<String>,
    #[serde(default)]
    pub resource_counts: ResourceCounts,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub per_cluster_resource_counts: BTreeMap<String, ResourceCounts>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_and_id_follow_group_rules() {
        let core = ResourceKey::new("v1", "ConfigMap", "ns", "cm");
        assert_eq!(type_and_id(&core), ("configmap".to_string(), "ns/cm".to_string()));
        let apps = ResourceKey::new("apps/v1", "Deployment", "web", "api");
        assert_eq!(type_and_id(&apps), ("apps.deployment".to_string(), "web/api".to_string()));
        let cluster = ResourceKey::new("rbac.authorization.k8s.io/v1", "ClusterRole", "", "admin");
        assert_eq!(type_and_id(&cluster), ("rbac.authorization.k8s.io.clusterrole".to_string(), "admin".to_string()));
    }

    #[test]
    fn unknown_states_survive_serde_and_count_as_not_ready() {
        let s: ResourceState = serde_json::from_str("\"in-progress\"").unwrap();
        assert_eq!(s, ResourceState::Other("in-progress".into()));
        assert_eq!(serde_json::to_string(&s).unwrap(), "\"in-progress\"");
        assert_eq!(serde_json::to_string(&ResourceState::Orphaned).unwrap(), "\"Orphaned\"");

        let mut counts = ResourceCounts::default();
        s.tally(&mut counts);
        ResourceState::ErrApplied.tally(&mut counts);
        ResourceState::Orphaned.tally(&mut counts);
        assert_eq!(counts.not_ready, 2);
        assert_eq!(counts.orphaned, 1);
        assert_eq!(counts.desired_ready, 3);
    }
}
