//! BundleDeployment custom resource.
//!
//! A BundleDeployment is the per-cluster instance of a bundle: the desired
//! deployment in `spec` and the agent's observations in `status`. Field names
//! follow the `fleet.cattle.io/v1alpha1` wire format.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ListMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::resources::ResourceCounts;

/// Label carrying the namespace of the downstream cluster object.
pub const CLUSTER_NAMESPACE_LABEL: &str = "fleet.cattle.io/cluster-namespace";
/// Label carrying the name of the downstream cluster object.
pub const CLUSTER_LABEL: &str = "fleet.cattle.io/cluster";
/// Label linking a bundle to the GitRepo it was rendered from.
pub const REPO_LABEL: &str = "fleet.cattle.io/repo-name";

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "fleet.cattle.io",
    version = "v1alpha1",
    kind = "BundleDeployment",
    plural = "bundledeployments",
    namespaced,
    status = "BundleDeploymentStatus",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentSpec {
    /// Identifier of the rendered bundle content that should be deployed.
    #[serde(default, rename = "deploymentID", skip_serializing_if = "String::is_empty")]
    pub deployment_id: String,
    #[serde(default, rename = "stagedDeploymentID", skip_serializing_if = "String::is_empty")]
    pub staged_deployment_id: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub paused: bool,
    #[serde(default)]
    pub options: BundleDeploymentOptions,
    #[serde(default)]
    pub staged_options: BundleDeploymentOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_drift: Option<CorrectDrift>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<DiffOptions>,
}

/// Per-bundle rules for suppressing known differences during drift detection.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiffOptions {
    #[serde(default)]
    pub compare_patches: Vec<ComparePatch>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComparePatch {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub json_pointers: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Operation {
    #[serde(default)]
    pub op: String,
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CorrectDrift {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub force: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub keep_fail_history: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<GenericCondition>,
    #[serde(default, rename = "appliedDeploymentID", skip_serializing_if = "String::is_empty")]
    pub applied_deployment_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub release: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub non_modified: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_ready_status: Vec<NonReadyStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modified_status: Vec<ModifiedStatus>,
    /// Every object deployed by this bundle deployment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<BundleDeploymentResource>,
    #[serde(default)]
    pub resource_counts: ResourceCounts,
    #[serde(default)]
    pub display: BundleDeploymentDisplay,
}

/// Condition shape kept local so the schema has no external references.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenericCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_update_time: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_transition_time: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentDisplay {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deployed: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub monitored: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentResource {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NonReadyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub summary: Summary,
}

/// Readiness summary reported by the agent's status monitor.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Summary {
    #[serde(default)]
    pub state: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub error: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub transitioning: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub message: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModifiedStatus {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    /// The object is declared but absent from the cluster.
    #[serde(default, rename = "missing", skip_serializing_if = "is_false")]
    pub create: bool,
    /// The object exists on the cluster but is no longer declared.
    #[serde(default, rename = "delete", skip_serializing_if = "is_false")]
    pub delete: bool,
    /// Serialized JSON merge patch from live to desired state.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub patch: String,
}

/// Aggregate state of a parent (bundle or GitRepo) over its deployments.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleSummary {
    #[serde(default)]
    pub not_ready: u32,
    #[serde(default)]
    pub wait_applied: u32,
    #[serde(default)]
    pub err_applied: u32,
    #[serde(default)]
    pub out_of_sync: u32,
    #[serde(default)]
    pub modified: u32,
    #[serde(default)]
    pub ready: u32,
    #[serde(default)]
    pub pending: u32,
    #[serde(default)]
    pub desired_ready: u32,
}

/// List shape returned by the storage facade.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentList {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ListMeta,
    pub items: Vec<BundleDeployment>,
}

impl BundleDeploymentList {
    pub fn new(items: Vec<BundleDeployment>, resource_version: i64) -> Self {
        Self {
            api_version: "fleet.cattle.io/v1alpha1".to_string(),
            kind: "BundleDeploymentList".to_string(),
            metadata: ListMeta { resource_version: Some(resource_version.to_string()), ..ListMeta::default() },
            items,
        }
    }

    /// The store version the list was read at, if set.
    pub fn resource_version(&self) -> Option<i64> {
        self.metadata.resource_version.as_deref().and_then(|s| s.parse().ok())
    }
}

impl BundleDeployment {
    /// Labels as an owned map, empty when unset.
    pub fn label_map(&self) -> BTreeMap<String, String> {
        self.metadata.labels.clone().unwrap_or_default()
    }

    /// Status or its default when the object has never been reported on.
    pub fn status_or_default(&self) -> BundleDeploymentStatus {
        self.status.clone().unwrap_or_default()
    }
}
