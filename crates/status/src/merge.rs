use std::collections::BTreeMap;
use std::time::Instant;

use flotilla_core::{cluster_id, BundleDeployment, BundleSummary, ResourceCounts, ResourceKey};
use metrics::{counter, histogram};
use serde_json::{Map, Value};
use tracing::debug;

use crate::state::{PerClusterState, Resource, ResourceState, StatusBase};

/// Deployments reporting this many not-ready or modified entries have had
/// their lists truncated by the agent.
pub const MAX_REPORTED: usize = 10;

/// Output of [`merge_resources`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergedResources {
    /// One entry per distinct resource key, sorted by `type/id`.
    pub resources: Vec<Resource>,
    /// Tally of `resources` by state.
    pub counts: ResourceCounts,
    /// Lexically sorted report errors (malformed patches).
    pub errors: Vec<String>,
}

#[derive(Default)]
struct Entry {
    declared: bool,
    incomplete: bool,
    states: Vec<PerClusterState>,
}

/// State every resource of a parent falls back to while the parent itself
/// still has deployments waiting for, or failing, their apply.
pub fn summary_state(summary: &BundleSummary) -> Option<ResourceState> {
    if summary.wait_applied > 0 {
        Some(ResourceState::WaitApplied)
    } else if summary.err_applied > 0 {
        Some(ResourceState::ErrApplied)
    } else {
        None
    }
}

/// Fold the status reports of `deployments` into one summary per resource.
///
/// The result is the same for every ordering of `deployments`: all declared
/// keys are collected before any per-cluster state is attached, and every
/// list in the output is fully sorted.
pub fn merge_resources(deployments: &[BundleDeployment], parent: Option<&ResourceState>) -> MergedResources {
    let started = Instant::now();
    let mut entries: BTreeMap<ResourceKey, Entry> = BTreeMap::new();
    for bd in deployments {
        for r in bd.status.iter().flat_map(|s| &s.resources) {
            entries.entry(ResourceKey::from(r)).or_default().declared = true;
        }
    }

    let mut errors = Vec::new();
    for bd in deployments {
        let Some(status) = bd.status.as_ref() else { continue };
        let cluster = cluster_id(bd);
        let mut incomplete =
            status.non_ready_status.len() >= MAX_REPORTED || status.modified_status.len() >= MAX_REPORTED;

        for nr in &status.non_ready_status {
            let state = PerClusterState {
                error: nr.summary.error,
                transitioning: nr.summary.transitioning,
                message: nr.summary.message.join("; "),
                ..PerClusterState::new(&cluster, ResourceState::from(nr.summary.state.as_str()))
            };
            attach(&mut entries, ResourceKey::from(nr), state);
        }

        for m in &status.modified_status {
            let key = ResourceKey::from(m);
            let mut state = PerClusterState::new(&cluster, ResourceState::Modified);
            if m.delete {
                state.state = ResourceState::Orphaned;
            } else if m.create {
                state.state = ResourceState::Missing;
            } else if !m.patch.is_empty() {
                match parse_patch(&m.patch) {
                    Ok(patch) => state.patch = Some(patch),
                    Err(e) => {
                        incomplete = true;
                        errors.push(format!("{cluster}: {key}: invalid patch: {e}"));
                    }
                }
            }
            attach(&mut entries, key, state);
        }

        if incomplete {
            for r in bd.status.iter().flat_map(|s| &s.resources) {
                if let Some(entry) = entries.get_mut(&ResourceKey::from(r)) {
                    entry.incomplete = true;
                }
            }
        }
    }

    let mut counts = ResourceCounts::default();
    let mut resources = Vec::with_capacity(entries.len());
    for (key, mut entry) in entries {
        entry.states.sort_by(PerClusterState::sort_cmp);
        let mut resource = Resource::new(key, entry.incomplete);
        match entry.states.first().filter(|s| !s.state.is_empty()) {
            Some(first) => {
                resource.state = first.state.clone();
                resource.error = first.error;
                resource.transitioning = first.transitioning;
                resource.message = first.message.clone();
            }
            None => resource.state = fallback_state(entry.incomplete, parent),
        }
        resource.per_cluster_state = entry.states;
        resource.state.tally(&mut counts);
        resources.push(resource);
    }
    resources.sort_by(|a, b| {
        a.sort_key()
            .cmp(&b.sort_key())
            .then_with(|| a.api_version.cmp(&b.api_version))
            .then_with(|| a.kind.cmp(&b.kind))
    });
    errors.sort();

    histogram!("merge_resources_ms", started.elapsed().as_secs_f64() * 1000.0);
    counter!("merge_resources_total", 1u64);
    if !errors.is_empty() {
        counter!("merge_resource_errors_total", errors.len() as u64);
    }
    debug!(deployments = deployments.len(), resources = resources.len(), errors = errors.len(), "merged resource states");
    MergedResources { resources, counts, errors }
}

fn fallback_state(incomplete: bool, parent: Option<&ResourceState>) -> ResourceState {
    match parent {
        Some(s) => s.clone(),
        None if incomplete => ResourceState::Unknown,
        None => ResourceState::Ready,
    }
}

/// Add `state` to the entry for `key`. A report without a namespace attaches
/// to a declared resource with the same apiVersion, kind and name: agents
/// omit the namespace for objects placed in the default namespace.
fn attach(entries: &mut BTreeMap<ResourceKey, Entry>, key: ResourceKey, state: PerClusterState) {
    let key = if key.namespace.is_empty() && !entries.contains_key(&key) {
        entries
            .iter()
            .find(|(k, e)| e.declared && k.api_version == key.api_version && k.kind == key.kind && k.name == key.name)
            .map(|(k, _)| k.clone())
            .unwrap_or(key)
    } else {
        key
    };
    entries.entry(key).or_default().states.push(state);
}

fn parse_patch(raw: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("expected a JSON object, got {other}")),
        Err(e) => Err(e.to_string()),
    }
}

/// Sum of the counts each deployment computed for itself.
pub fn sum_resource_counts(deployments: &[BundleDeployment]) -> ResourceCounts {
    deployments
        .iter()
        .filter_map(|bd| bd.status.as_ref())
        .fold(ResourceCounts::default(), |acc, s| acc + s.resource_counts)
}

/// [`sum_resource_counts`] grouped by cluster id.
pub fn resource_counts_per_cluster(deployments: &[BundleDeployment]) -> BTreeMap<String, ResourceCounts> {
    let mut out: BTreeMap<String, ResourceCounts> = BTreeMap::new();
    for bd in deployments {
        let counts = bd.status.as_ref().map(|s| s.resource_counts).unwrap_or_default();
        out.entry(cluster_id(bd)).or_default().add(&counts);
    }
    out
}

/// Recompute the resource fields of a parent status from its deployments.
/// `status.summary` selects the fallback state.
pub fn set_resources(deployments: &[BundleDeployment], status: &mut StatusBase) {
    let parent = summary_state(&status.summary);
    let merged = merge_resources(deployments, parent.as_ref());
    status.resources = merged.resources;
    status.resource_errors = merged.errors;
    status.resource_counts = sum_resource_counts(deployments);
    status.per_cluster_resource_counts = resource_counts_per_cluster(deployments);
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::{
        BundleDeploymentResource, BundleDeploymentSpec, BundleDeploymentStatus, ModifiedStatus, NonReadyStatus,
        Summary, CLUSTER_LABEL, CLUSTER_NAMESPACE_LABEL,
    };

    fn bd(cluster: &str, status: BundleDeploymentStatus) -> BundleDeployment {
        let mut bd = BundleDeployment::new(&format!("bd-{cluster}"), BundleDeploymentSpec::default());
        bd.metadata.labels = Some(
            [
                (CLUSTER_NAMESPACE_LABEL.to_string(), "fleet-default".to_string()),
                (CLUSTER_LABEL.to_string(), cluster.to_string()),
            ]
            .into(),
        );
        bd.status = Some(status);
        bd
    }

    fn declared(ns: &str, name: &str) -> BundleDeploymentResource {
        BundleDeploymentResource {
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            namespace: ns.into(),
            name: name.into(),
        }
    }

    fn not_ready(ns: &str, name: &str, state: &str) -> NonReadyStatus {
        NonReadyStatus {
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            namespace: ns.into(),
            name: name.into(),
            summary: Summary { state: state.into(), message: vec!["a".into(), "b".into()], ..Default::default() },
            ..Default::default()
        }
    }

    fn modified(name: &str, patch: &str) -> ModifiedStatus {
        ModifiedStatus {
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            namespace: "app".into(),
            name: name.into(),
            patch: patch.into(),
            ..Default::default()
        }
    }

    #[test]
    fn explicit_states_win_and_are_sorted_by_cluster() {
        let list = vec![
            bd("c2", BundleDeploymentStatus {
                resources: vec![declared("app", "web")],
                non_ready_status: vec![not_ready("app", "web", "in-progress")],
                ..Default::default()
            }),
            bd("c1", BundleDeploymentStatus {
                resources: vec![declared("app", "web")],
                modified_status: vec![ModifiedStatus { delete: true, ..modified("web", "") }],
                ..Default::default()
            }),
        ];
        let merged = merge_resources(&list, None);
        assert_eq!(merged.resources.len(), 1);
        let web = &merged.resources[0];
        assert_eq!(web.type_, "apps.deployment");
        assert_eq!(web.id, "app/web");
        let clusters: Vec<_> = web.per_cluster_state.iter().map(|s| s.cluster_id.as_str()).collect();
        assert_eq!(clusters, vec!["fleet-default/c1", "fleet-default/c2"]);
        assert_eq!(web.state, ResourceState::Orphaned);
        assert_eq!(web.per_cluster_state[1].message, "a; b");
        assert_eq!(merged.counts.orphaned, 1);
        assert_eq!(merged.counts.desired_ready, 1);
    }

    #[test]
    fn fallback_precedence() {
        let clean = vec![bd("c1", BundleDeploymentStatus { resources: vec![declared("app", "web")], ..Default::default() })];
        assert_eq!(merge_resources(&clean, None).resources[0].state, ResourceState::Ready);
        assert_eq!(
            merge_resources(&clean, Some(&ResourceState::WaitApplied)).resources[0].state,
            ResourceState::WaitApplied
        );

        let truncated: Vec<_> = (0..MAX_REPORTED).map(|i| not_ready("other", &format!("x{i}"), "")).collect();
        let incomplete = vec![bd("c1", BundleDeploymentStatus {
            resources: vec![declared("app", "web")],
            non_ready_status: truncated,
            ..Default::default()
        })];
        let merged = merge_resources(&incomplete, None);
        let web = merged.resources.iter().find(|r| r.name == "web").unwrap();
        assert!(web.incomplete_state);
        assert_eq!(web.state, ResourceState::Unknown);
        let merged = merge_resources(&incomplete, Some(&ResourceState::ErrApplied));
        let web = merged.resources.iter().find(|r| r.name == "web").unwrap();
        assert_eq!(web.state, ResourceState::ErrApplied);
    }

    #[test]
    fn report_without_namespace_attaches_to_declared_resource() {
        let list = vec![bd("c1", BundleDeploymentStatus {
            resources: vec![declared("app", "web")],
            non_ready_status: vec![not_ready("", "web", "NotReady")],
            ..Default::default()
        })];
        let merged = merge_resources(&list, None);
        assert_eq!(merged.resources.len(), 1);
        assert_eq!(merged.resources[0].namespace, "app");
        assert_eq!(merged.resources[0].state, ResourceState::NotReady);
    }

    #[test]
    fn bad_patch_is_collected_and_still_marks_modified() {
        let list = vec![bd("c1", BundleDeploymentStatus {
            resources: vec![declared("app", "web"), declared("app", "db")],
            modified_status: vec![modified("web", "{not json"), modified("db", r#"{"spec":{"replicas":3}}"#)],
            ..Default::default()
        })];
        let merged = merge_resources(&list, None);
        assert_eq!(merged.errors.len(), 1);
        assert!(merged.errors[0].contains("fleet-default/c1"), "{:?}", merged.errors);
        let web = merged.resources.iter().find(|r| r.name == "web").unwrap();
        assert_eq!(web.state, ResourceState::Modified);
        assert!(web.per_cluster_state[0].patch.is_none());
        assert!(web.incomplete_state);
        let db = merged.resources.iter().find(|r| r.name == "db").unwrap();
        assert_eq!(db.per_cluster_state[0].patch.as_ref().unwrap()["spec"]["replicas"], 3);
        assert_eq!(merged.counts.modified, 2);
    }

    #[test]
    fn set_resources_sums_counts_per_cluster() {
        let counts = ResourceCounts { ready: 2, desired_ready: 3, not_ready: 1, ..Default::default() };
        let list = vec![
            bd("c1", BundleDeploymentStatus { resource_counts: counts, ..Default::default() }),
            bd("c1", BundleDeploymentStatus { resource_counts: counts, ..Default::default() }),
            bd("c2", BundleDeploymentStatus { resource_counts: counts, ..Default::default() }),
        ];
        let mut status = StatusBase::default();
        set_resources(&list, &mut status);
        assert_eq!(status.resource_counts.ready, 6);
        assert_eq!(status.resource_counts.desired_ready, 9);
        assert_eq!(status.per_cluster_resource_counts.len(), 2);
        assert_eq!(status.per_cluster_resource_counts["fleet-default/c1"].not_ready, 2);
        assert_eq!(status.per_cluster_resource_counts["fleet-default/c2"], counts);
    }

    #[test]
    fn summary_state_prefers_wait_applied() {
        let both = BundleSummary { wait_applied: 1, err_applied: 1, ..Default::default() };
        assert_eq!(summary_state(&both), Some(ResourceState::WaitApplied));
        let err = BundleSummary { err_applied: 2, ..Default::default() };
        assert_eq!(summary_state(&err), Some(ResourceState::ErrApplied));
        assert_eq!(summary_state(&BundleSummary::default()), None);
    }
}
