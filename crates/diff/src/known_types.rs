use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSetSpec, DeploymentSpec, StatefulSetSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, ResourceRequirements, ServiceSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::manifest::group_kind;
use crate::pointer;
use crate::rules::{override_group_kind, ResourceOverride};
use crate::{NormalizeError, NormalizeResult, Normalizer};

type Convert = fn(Value) -> Result<Value, serde_json::Error>;

/// Type names accepted in `knownTypeFields`.
pub const KNOWN_TYPES: &[&str] = &[
    "core/v1/PodSpec",
    "core/v1/PodTemplateSpec",
    "core/v1/Container",
    "core/v1/ResourceRequirements",
    "core/v1/ServiceSpec",
    "apps/v1/DeploymentSpec",
    "apps/v1/StatefulSetSpec",
    "apps/v1/DaemonSetSpec",
    "resource/Quantity",
];

fn round_trip<T: DeserializeOwned + Serialize>(v: Value) -> Result<Value, serde_json::Error> {
    let typed: T = serde_json::from_value(v)?;
    serde_json::to_value(typed)
}

fn quantity(v: Value) -> Result<Value, serde_json::Error> {
    let raw = match v {
        Value::Number(n) => n.to_string(),
        other => serde_json::from_value::<Quantity>(other)?.0,
    };
    Ok(Value::String(canonical_quantity(&raw).unwrap_or(raw)))
}

fn converter(type_name: &str) -> Option<Convert> {
    let f: Convert = match type_name {
        "core/v1/PodSpec" => round_trip::<PodSpec>,
        "core/v1/PodTemplateSpec" => round_trip::<PodTemplateSpec>,
        "core/v1/Container" => round_trip::<Container>,
        "core/v1/ResourceRequirements" => round_trip::<ResourceRequirements>,
        "core/v1/ServiceSpec" => round_trip::<ServiceSpec>,
        "apps/v1/DeploymentSpec" => round_trip::<DeploymentSpec>,
        "apps/v1/StatefulSetSpec" => round_trip::<StatefulSetSpec>,
        "apps/v1/DaemonSetSpec" => round_trip::<DaemonSetSpec>,
        "resource/Quantity" => quantity,
        _ => return None,
    };
    Some(f)
}

struct FieldRule {
    group: String,
    kind: String,
    field: String,
    tokens: Vec<String>,
    type_name: String,
    convert: Convert,
}

/// Rewrites fields holding known Kubernetes types into their canonical
/// serialization, so semantically equal values compare equal: unknown keys
/// are dropped and resource quantities are written in canonical form
/// (`1000m` becomes `1`, `0.5` becomes `500m`).
pub struct KnownTypesNormalizer {
    fields: Vec<FieldRule>,
}

impl KnownTypesNormalizer {
    /// Fields come from the `knownTypeFields` of each override. An unknown
    /// type name is an error; a malformed override key is logged and skipped.
    pub fn new(overrides: &BTreeMap<String, ResourceOverride>) -> NormalizeResult<Self> {
        let mut fields = Vec::new();
        for (key, o) in overrides {
            if o.known_type_fields.is_empty() {
                continue;
            }
            let Some((group, kind)) = override_group_kind(key) else {
                warn!(key = %key, "ignoring malformed override key");
                continue;
            };
            for f in &o.known_type_fields {
                let convert = converter(&f.type_name).ok_or_else(|| NormalizeError::UnknownType {
                    field: f.field.clone(),
                    type_name: f.type_name.clone(),
                })?;
                fields.push(FieldRule {
                    group: group.to_string(),
                    kind: kind.to_string(),
                    field: f.field.clone(),
                    tokens: f.field.split('.').map(str::to_string).collect(),
                    type_name: f.type_name.clone(),
                    convert,
                });
            }
        }
        Ok(Self { fields })
    }
}

impl Normalizer for KnownTypesNormalizer {
    fn normalize(&self, obj: &mut Value) -> NormalizeResult<()> {
        if self.fields.is_empty() {
            return Ok(());
        }
        let (group, kind) = group_kind(obj);
        for rule in self.fields.iter().filter(|r| r.group == group && r.kind == kind) {
            let Some(v) = pointer::get_mut(obj, &rule.tokens) else { continue };
            canonicalize_quantities(v);
            let converted = (rule.convert)(v.clone()).map_err(|source| NormalizeError::Decode {
                field: rule.field.clone(),
                type_name: rule.type_name.clone(),
                source,
            })?;
            *v = converted;
        }
        Ok(())
    }
}

/// Rewrite every entry of `requests`/`limits` maps below `v` in canonical
/// quantity form. Numbers become strings.
fn canonicalize_quantities(v: &mut Value) {
    match v {
        Value::Object(map) => {
            for (k, child) in map.iter_mut() {
                match (k.as_str(), child) {
                    ("requests" | "limits", Value::Object(list)) => {
                        for q in list.values_mut() {
                            let raw = match q {
                                Value::String(s) => s.clone(),
                                Value::Number(n) => n.to_string(),
                                _ => continue,
                            };
                            *q = Value::String(canonical_quantity(&raw).unwrap_or(raw));
                        }
                    }
                    (_, child) => canonicalize_quantities(child),
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(canonicalize_quantities),
        _ => {}
    }
}

/// Canonical form of a plain decimal or milli quantity: whole numbers
/// without a suffix, anything finer in `m`. `None` for values with other
/// suffixes or finer than milli precision, which are kept as written.
pub fn canonical_quantity(s: &str) -> Option<String> {
    let (num, milli) = match s.strip_suffix('m') {
        Some(n) => (n, true),
        None => (s, false),
    };
    let (int, frac) = num.split_once('.').unwrap_or((num, ""));
    if int.is_empty() && frac.is_empty() {
        return None;
    }
    if !int.bytes().chain(frac.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }
    let scale = if milli { 0 } else { 3 };
    let frac = if frac.len() > scale {
        let (keep, rest) = frac.split_at(scale);
        if rest.bytes().any(|b| b != b'0') {
            return None;
        }
        keep
    } else {
        frac
    };
    let digits = format!("{int}{frac}{}", "0".repeat(scale - frac.len()));
    let millis: u128 = digits.parse().ok()?;
    if millis % 1000 == 0 {
        Some((millis / 1000).to_string())
    } else {
        Some(format!("{millis}m"))
    }
}
