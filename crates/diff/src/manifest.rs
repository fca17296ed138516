use serde_json::Value as Json;

use crate::{NormalizeError, NormalizeResult};

fn max_yaml_bytes() -> usize {
    std::env::var("FLOTILLA_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000)
}

fn max_yaml_nodes() -> usize {
    std::env::var("FLOTILLA_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Parse one Kubernetes object from YAML (or JSON) into its unstructured
/// form. The object must carry `apiVersion`, `kind` and `metadata.name`.
pub fn parse_manifest(yaml: &str) -> NormalizeResult<Json> {
    if yaml.len() > max_yaml_bytes() {
        return Err(NormalizeError::Manifest(format!("YAML payload too large (>{} bytes)", max_yaml_bytes())));
    }
    let val: serde_yaml::Value = serde_yaml::from_str(yaml)?;
    let json = serde_json::to_value(val)?;
    if json_node_budget_exceeded(&json, max_yaml_nodes()) {
        return Err(NormalizeError::Manifest(format!("YAML document too complex (>{} nodes)", max_yaml_nodes())));
    }
    let missing = |what: &str| NormalizeError::Manifest(format!("YAML missing {what}"));
    json.get("apiVersion").and_then(Json::as_str).ok_or_else(|| missing("apiVersion"))?;
    json.get("kind").and_then(Json::as_str).ok_or_else(|| missing("kind"))?;
    json.pointer("/metadata/name").and_then(Json::as_str).ok_or_else(|| missing("metadata.name"))?;
    Ok(json)
}

/// `(group, kind)` of an unstructured object; the core group is empty.
pub fn group_kind(obj: &Json) -> (String, String) {
    let api_version = obj.get("apiVersion").and_then(Json::as_str).unwrap_or("");
    let group = match api_version.split_once('/') {
        Some((g, _)) => g,
        None => "",
    };
    let kind = obj.get("kind").and_then(Json::as_str).unwrap_or("");
    (group.to_string(), kind.to_string())
}
