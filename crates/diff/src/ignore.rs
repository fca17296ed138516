use std::collections::BTreeMap;

use glob::Pattern;
use metrics::counter;
use serde_json::Value;
use tracing::{debug, warn};

use crate::manifest::group_kind;
use crate::pointer;
use crate::rules::{override_group_kind, IgnoreRule, ResourceOverride};
use crate::{NormalizeError, NormalizeResult, Normalizer};

struct Removal {
    group: Pattern,
    kind: Pattern,
    name: String,
    namespace: String,
    pointer: String,
    tokens: Vec<String>,
}

impl Removal {
    fn matches(&self, group: &str, kind: &str, name: &str, namespace: &str) -> bool {
        self.group.matches(group)
            && self.kind.matches(kind)
            && (self.name.is_empty() || self.name == name)
            && (self.namespace.is_empty() || self.namespace == namespace)
    }
}

fn pattern(p: &str) -> NormalizeResult<Pattern> {
    Pattern::new(p).map_err(|source| NormalizeError::Glob { pattern: p.to_string(), source })
}

/// Removes ignored fields from objects matching its rules.
pub struct IgnoreNormalizer {
    removals: Vec<Removal>,
}

impl IgnoreNormalizer {
    /// Compile `ignore`, the built-in [`default_ignore_rules`] and the
    /// `ignoreDifferences` pointers of `overrides`. Malformed pointers and
    /// override keys are logged and skipped; malformed globs are an error.
    pub fn new(ignore: Vec<IgnoreRule>, overrides: &BTreeMap<String, ResourceOverride>) -> NormalizeResult<Self> {
        let mut rules = ignore;
        rules.extend(default_ignore_rules());
        for (key, o) in overrides {
            if o.ignore_differences.json_pointers.is_empty() {
                continue;
            }
            let Some((group, kind)) = override_group_kind(key) else {
                warn!(key = %key, "ignoring malformed override key");
                continue;
            };
            rules.push(IgnoreRule {
                group: group.to_string(),
                kind: kind.to_string(),
                json_pointers: o.ignore_differences.json_pointers.clone(),
                ..IgnoreRule::default()
            });
        }

        let mut removals = Vec::new();
        for rule in rules {
            let group = pattern(&rule.group)?;
            let kind = pattern(&rule.kind)?;
            for p in &rule.json_pointers {
                let Some(tokens) = pointer::parse(p) else {
                    warn!(pointer = %p, group = %rule.group, kind = %rule.kind, "skipping malformed json pointer");
                    continue;
                };
                removals.push(Removal {
                    group: group.clone(),
                    kind: kind.clone(),
                    name: rule.name.clone(),
                    namespace: rule.namespace.clone(),
                    pointer: p.clone(),
                    tokens,
                });
            }
        }
        Ok(Self { removals })
    }

    /// Only the built-in rules.
    pub fn defaults() -> NormalizeResult<Self> {
        Self::new(Vec::new(), &BTreeMap::new())
    }

    pub fn rule_count(&self) -> usize {
        self.removals.len()
    }
}

impl Normalizer for IgnoreNormalizer {
    fn normalize(&self, obj: &mut Value) -> NormalizeResult<()> {
        let (group, kind) = group_kind(obj);
        let meta = |k: &str| obj.pointer(&format!("/metadata/{k}")).and_then(Value::as_str).unwrap_or("").to_string();
        let (name, namespace) = (meta("name"), meta("namespace"));
        let matched: Vec<&Removal> =
            self.removals.iter().filter(|r| r.matches(&group, &kind, &name, &namespace)).collect();
        if matched.is_empty() {
            return Ok(());
        }
        let mut removed = 0u64;
        for r in matched {
            if pointer::remove(obj, &r.tokens) {
                removed += 1;
            } else {
                debug!(pointer = %r.pointer, kind = %kind, name = %name, "ignored path not present");
            }
        }
        if removed > 0 {
            counter!("normalize_removed_total", removed);
        }
        Ok(())
    }
}

/// Fields that external controllers always rewrite and that never indicate
/// drift on their own.
pub fn default_ignore_rules() -> Vec<IgnoreRule> {
    const WORKLOADS: [&str; 2] = ["Deployment", "StatefulSet"];
    let mut rules = Vec::new();
    for kind in WORKLOADS {
        // Istio and Linkerd sidecar injection.
        rules.push(IgnoreRule::new("apps", kind, &["/spec/template/metadata/annotations/sidecar.istio.io~1status"]));
        rules.push(IgnoreRule::new("apps", kind, &["/spec/template/metadata/annotations/linkerd.io~1proxy-version"]));
        // Vertical pod autoscaler in Auto mode.
        rules.push(IgnoreRule::new(
            "apps",
            kind,
            &["/spec/template/metadata/annotations/vpaUpdates", "/spec/template/metadata/annotations/vpaObservedContainers"],
        ));
    }
    rules.push(IgnoreRule::new("cert-manager.io", "Certificate", &["/status"]));
    rules.push(IgnoreRule::new(
        "apps",
        "Deployment",
        &[
            "/metadata/annotations/cluster-autoscaler.kubernetes.io~1safe-to-evict",
            "/metadata/annotations/cluster-autoscaler.kubernetes.io~1safe-to-evict-local-volumes",
        ],
    ));
    rules.push(IgnoreRule::new("apps", "StatefulSet", &["/metadata/annotations/cluster-autoscaler.kubernetes.io~1safe-to-evict"]));
    for kind in WORKLOADS {
        rules.push(IgnoreRule::new("apps", kind, &["/metadata/annotations/autoscaling.keda.sh~1paused-replicas"]));
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment() -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "web",
                "namespace": "app",
                "annotations": {
                    "autoscaling.keda.sh/paused-replicas": "0",
                    "cluster-autoscaler.kubernetes.io/safe-to-evict": "true",
                    "team": "payments"
                }
            },
            "spec": {
                "replicas": 3,
                "template": {"metadata": {"annotations": {
                    "sidecar.istio.io/status": "{\"version\":\"abc\"}",
                    "linkerd.io/proxy-version": "stable-2.11.0",
                    "vpaUpdates": "cpu"
                }}}
            }
        })
    }

    #[test]
    fn default_rules_strip_controller_fields() {
        let n = IgnoreNormalizer::defaults().unwrap();
        let mut obj = deployment();
        n.normalize(&mut obj).unwrap();
        assert_eq!(obj["metadata"]["annotations"], json!({"team": "payments"}));
        assert_eq!(obj["spec"]["template"]["metadata"]["annotations"], json!({}));
        assert_eq!(obj["spec"]["replicas"], 3);
    }

    #[test]
    fn certificate_status_is_ignored() {
        let n = IgnoreNormalizer::defaults().unwrap();
        let mut cert = json!({"apiVersion": "cert-manager.io/v1", "kind": "Certificate", "metadata": {"name": "tls"}, "status": {"ready": true}});
        n.normalize(&mut cert).unwrap();
        assert!(cert.get("status").is_none());
    }

    #[test]
    fn applying_twice_is_the_same_as_once() {
        let n = IgnoreNormalizer::defaults().unwrap();
        let mut once = deployment();
        n.normalize(&mut once).unwrap();
        let mut twice = once.clone();
        n.normalize(&mut twice).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn unmatched_objects_are_untouched() {
        let n = IgnoreNormalizer::defaults().unwrap();
        let mut cm = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c"}, "status": {"x": 1}});
        let before = cm.clone();
        n.normalize(&mut cm).unwrap();
        assert_eq!(cm, before);
    }

    #[test]
    fn globs_and_name_constraints() {
        let rules = vec![
            IgnoreRule { group: "*".into(), kind: "Deploy*".into(), name: "web".into(), ..IgnoreRule::new("", "", &["/spec/replicas"]) },
            IgnoreRule { namespace: "elsewhere".into(), ..IgnoreRule::new("apps", "Deployment", &["/metadata/annotations/team"]) },
            IgnoreRule::new("apps", "Deployment", &["not-a-pointer"]),
        ];
        let n = IgnoreNormalizer::new(rules, &BTreeMap::new()).unwrap();
        let mut obj = deployment();
        n.normalize(&mut obj).unwrap();
        assert!(obj["spec"].get("replicas").is_none());
        assert_eq!(obj["metadata"]["annotations"]["team"], "payments");

        let mut other = deployment();
        other["metadata"]["name"] = json!("api");
        n.normalize(&mut other).unwrap();
        assert_eq!(other["spec"]["replicas"], 3);
    }

    #[test]
    fn override_pointers_apply_by_group_kind() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "ConfigMap".to_string(),
            ResourceOverride {
                ignore_differences: crate::OverrideIgnoreDiff { json_pointers: vec!["/data/generated".into()] },
                ..Default::default()
            },
        );
        overrides.insert("too/many/parts".to_string(), ResourceOverride {
            ignore_differences: crate::OverrideIgnoreDiff { json_pointers: vec!["/x".into()] },
            ..Default::default()
        });
        let n = IgnoreNormalizer::new(Vec::new(), &overrides).unwrap();
        let mut cm = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c"}, "data": {"generated": "1", "kept": "2"}});
        n.normalize(&mut cm).unwrap();
        assert_eq!(cm["data"], json!({"kept": "2"}));
    }

    #[test]
    fn bad_glob_is_an_error() {
        let err = IgnoreNormalizer::new(vec![IgnoreRule::new("[", "Deployment", &["/a"])], &BTreeMap::new());
        assert!(matches!(err, Err(NormalizeError::Glob { .. })));
    }
}
