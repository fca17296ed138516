use std::collections::BTreeMap;

use flotilla_core::{BundleDeploymentOptions, ComparePatch};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::NormalizeResult;

/// Fields to ignore on objects matching `group`/`kind` globs and, when set,
/// an exact name and namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IgnoreRule {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default)]
    pub json_pointers: Vec<String>,
}

impl IgnoreRule {
    pub fn new(group: &str, kind: &str, json_pointers: &[&str]) -> Self {
        Self {
            group: group.to_string(),
            kind: kind.to_string(),
            json_pointers: json_pointers.iter().map(|p| p.to_string()).collect(),
            ..Self::default()
        }
    }

    /// Rule for one `comparePatches` entry of a bundle's diff options.
    /// `remove` operations contribute their paths; other operations are not
    /// supported by the ignore normalizer and are skipped.
    pub fn from_compare_patch(cp: &ComparePatch) -> Self {
        let group = match cp.api_version.split_once('/') {
            Some((group, _)) => group.to_string(),
            None => String::new(),
        };
        let mut json_pointers = cp.json_pointers.clone();
        for op in &cp.operations {
            if op.op == "remove" {
                json_pointers.push(op.path.clone());
            } else {
                warn!(op = %op.op, path = %op.path, kind = %cp.kind, name = %cp.name, "skipping unsupported compare patch operation");
            }
        }
        Self {
            group,
            kind: cp.kind.clone(),
            name: cp.name.clone(),
            namespace: cp.namespace.clone(),
            json_pointers,
        }
    }

    /// Rules from `options.diff.comparePatches`.
    pub fn from_options(options: &BundleDeploymentOptions) -> Vec<Self> {
        options
            .diff
            .iter()
            .flat_map(|d| &d.compare_patches)
            .map(Self::from_compare_patch)
            .collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideIgnoreDiff {
    #[serde(default)]
    pub json_pointers: Vec<String>,
}

/// A field of a resource that holds a value of a known Kubernetes type, as a
/// dotted path (`spec.template.spec`) and a type name (`core/v1/PodSpec`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownTypeField {
    pub field: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

/// Per resource-type settings, keyed `group/Kind` (or `Kind` for the core
/// group) in [`RuleSet::overrides`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOverride {
    #[serde(default)]
    pub ignore_differences: OverrideIgnoreDiff,
    #[serde(default)]
    pub known_type_fields: Vec<KnownTypeField>,
}

/// User-supplied normalization settings, usually loaded from YAML:
///
/// ```yaml
/// ignoreDifferences:
///   - group: apps
///     kind: Deployment
///     jsonPointers: ["/spec/replicas"]
/// overrides:
///   apps/Deployment:
///     knownTypeFields:
///       - field: spec.template.spec
///         type: core/v1/PodSpec
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSet {
    #[serde(default)]
    pub ignore_differences: Vec<IgnoreRule>,
    #[serde(default)]
    pub overrides: BTreeMap<String, ResourceOverride>,
}

impl RuleSet {
    pub fn from_yaml(yaml: &str) -> NormalizeResult<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }
}

/// Split an override key into `(group, kind)`. `None` for keys with more
/// than one `/`.
pub(crate) fn override_group_kind(key: &str) -> Option<(&str, &str)> {
    let mut parts = key.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(kind), None, None) => Some(("", kind)),
        (Some(group), Some(kind), None) => Some((group, kind)),
        _ => None,
    }
}
