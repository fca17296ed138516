//! Resource keys and per-state counts shared by the store and the merger.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::types::{
    BundleDeployment, BundleDeploymentResource, ModifiedStatus, NonReadyStatus, CLUSTER_LABEL,
    CLUSTER_NAMESPACE_LABEL,
};

/// Identity of a deployed downstream object: `(apiVersion, kind, namespace, name)`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Same key with the namespace replaced.
    pub fn with_namespace(&self, namespace: &str) -> Self {
        Self { namespace: namespace.to_string(), ..self.clone() }
    }

    /// API group, empty for the core group (`v1`).
    pub fn group(&self) -> &str {
        match self.api_version.split_once('/') {
            Some((group, _)) => group,
            None => "",
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{} {}", self.api_version, self.kind, self.name)
        } else {
            write!(f, "{}/{} {}/{}", self.api_version, self.kind, self.namespace, self.name)
        }
    }
}

impl From<&BundleDeploymentResource> for ResourceKey {
    fn from(r: &BundleDeploymentResource) -> Self {
        Self::new(&r.api_version, &r.kind, &r.namespace, &r.name)
    }
}

impl From<&NonReadyStatus> for ResourceKey {
    fn from(r: &NonReadyStatus) -> Self {
        Self::new(&r.api_version, &r.kind, &r.namespace, &r.name)
    }
}

impl From<&ModifiedStatus> for ResourceKey {
    fn from(r: &ModifiedStatus) -> Self {
        Self::new(&r.api_version, &r.kind, &r.namespace, &r.name)
    }
}

/// Number of resources in each state bucket.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCounts {
    #[serde(default)]
    pub ready: u32,
    #[serde(default)]
    pub desired_ready: u32,
    #[serde(default)]
    pub wait_applied: u32,
    #[serde(default)]
    pub modified: u32,
    #[serde(default)]
    pub orphaned: u32,
    #[serde(default)]
    pub missing: u32,
    #[serde(default)]
    pub unknown: u32,
    #[serde(default)]
    pub not_ready: u32,
}

impl ResourceCounts {
    /// Field-wise sum. Commutative and associative.
    pub fn add(&mut self, other: &ResourceCounts) {
        self.ready += other.ready;
        self.desired_ready += other.desired_ready;
        self.wait_applied += other.wait_applied;
        self.modified += other.modified;
        self.orphaned += other.orphaned;
        self.missing += other.missing;
        self.unknown += other.unknown;
        self.not_ready += other.not_ready;
    }

    pub fn total(&self) -> u32 {
        self.ready
            + self.wait_applied
            + self.modified
            + self.orphaned
            + self.missing
            + self.unknown
            + self.not_ready
    }
}

impl std::ops::Add for ResourceCounts {
    type Output = ResourceCounts;

    fn add(mut self, rhs: ResourceCounts) -> ResourceCounts {
        ResourceCounts::add(&mut self, &rhs);
        self
    }
}

/// Identifier of the downstream cluster a deployment targets, `namespace/name`
/// built from its cluster labels. Missing labels yield empty segments.
pub fn cluster_id(bd: &BundleDeployment) -> String {
    let labels = bd.metadata.labels.as_ref();
    let get = |k: &str| labels.and_then(|l| l.get(k)).map(String::as_str).unwrap_or("");
    format!("{}/{}", get(CLUSTER_NAMESPACE_LABEL), get(CLUSTER_LABEL))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    #[test]
    fn counts_add_is_fieldwise() {
        let a = ResourceCounts { ready: 2, desired_ready: 3, missing: 1, ..Default::default() };
        let b = ResourceCounts { ready: 1, desired_ready: 1, orphaned: 4, ..Default::default() };
        let sum = a + b;
        assert_eq!(sum.ready, 3);
        assert_eq!(sum.desired_ready, 4);
        assert_eq!(sum.missing, 1);
        assert_eq!(sum.orphaned, 4);
        assert_eq!(sum, b + a);
    }

    #[test]
    fn key_group_for_core_and_named_groups() {
        assert_eq!(ResourceKey::new("v1", "ConfigMap", "ns", "a").group(), "");
        assert_eq!(ResourceKey::new("apps/v1", "Deployment", "ns", "a").group(), "apps");
    }

    #[test]
    fn cluster_id_from_labels() {
        let mut labels = BTreeMap::new();
        labels.insert(CLUSTER_NAMESPACE_LABEL.to_string(), "fleet-default".to_string());
        labels.insert(CLUSTER_LABEL.to_string(), "downstream-1".to_string());
        let bd = BundleDeployment {
            metadata: ObjectMeta { labels: Some(labels), ..Default::default() },
            spec: Default::default(),
            status: None,
        };
        assert_eq!(cluster_id(&bd), "fleet-default/downstream-1");
    }
}
