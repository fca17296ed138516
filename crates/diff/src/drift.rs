use flotilla_core::ModifiedStatus;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::debug;

use crate::{NormalizeResult, Normalizer};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

/// Outcome of comparing a desired object with the live one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum Drift {
    InSync,
    /// Desired but absent from the cluster.
    Missing,
    /// Present on the cluster but no longer desired.
    Orphaned,
    /// `patch` is the JSON merge patch that brings live to desired.
    Modified { patch: Json, summary: DiffSummary },
}

/// Drop server-populated fields that never take part in a comparison.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        for k in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "selfLink"] {
            meta.remove(k);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Count the leaf changes that turn `base` into `target`.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb).filter(|(x, y)| x != y).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

/// `live` restricted to the object keys `desired` declares. Fields only the
/// cluster sets (defaults, other controllers) do not count as drift.
fn declared_only(desired: &Json, live: &Json) -> Json {
    match (desired, live) {
        (Json::Object(d), Json::Object(l)) => Json::Object(
            l.iter()
                .filter_map(|(k, lv)| d.get(k).map(|dv| (k.clone(), declared_only(dv, lv))))
                .collect(),
        ),
        _ => live.clone(),
    }
}

/// RFC 7386 merge patch from `from` to `to`.
fn merge_patch(from: &Json, to: &Json) -> Json {
    match (from, to) {
        (Json::Object(f), Json::Object(t)) => {
            let mut patch = Map::new();
            for (k, tv) in t {
                match f.get(k) {
                    Some(fv) if fv == tv => {}
                    Some(fv) => {
                        patch.insert(k.clone(), merge_patch(fv, tv));
                    }
                    None => {
                        patch.insert(k.clone(), tv.clone());
                    }
                }
            }
            for k in f.keys().filter(|k| !t.contains_key(*k)) {
                patch.insert(k.clone(), Json::Null);
            }
            Json::Object(patch)
        }
        (_, t) => t.clone(),
    }
}

/// Compare `desired` with `live` after normalizing both with `normalizer`.
/// Either side may be absent. A normalizer failure is returned as is.
pub fn detect_drift(desired: Option<&Json>, live: Option<&Json>, normalizer: &dyn Normalizer) -> NormalizeResult<Drift> {
    let (desired, live) = match (desired, live) {
        (None, None) => return Ok(Drift::InSync),
        (Some(_), None) => return Ok(record(Drift::Missing)),
        (None, Some(_)) => return Ok(record(Drift::Orphaned)),
        (Some(d), Some(l)) => (d, l),
    };
    let mut desired = strip_noisy(desired.clone());
    let mut live = strip_noisy(live.clone());
    normalizer.normalize(&mut desired)?;
    normalizer.normalize(&mut live)?;
    let live = declared_only(&desired, &live);
    if live == desired {
        return Ok(Drift::InSync);
    }
    let summary = diff_summary(&desired, &live);
    let patch = merge_patch(&live, &desired);
    debug!(adds = summary.adds, updates = summary.updates, removes = summary.removes, "drift detected");
    Ok(record(Drift::Modified { patch, summary }))
}

fn record(d: Drift) -> Drift {
    let kind = match d {
        Drift::InSync => None,
        Drift::Missing => Some("missing"),
        Drift::Orphaned => Some("orphaned"),
        Drift::Modified { .. } => Some("modified"),
    };
    if let Some(kind) = kind {
        counter!("drift_detected_total", 1u64, "kind" => kind);
    }
    d
}

/// The status entry an agent reports for `obj` (desired or live, whichever
/// exists) in `drift`. `None` when in sync.
pub fn modified_status(obj: &Json, drift: &Drift) -> Option<ModifiedStatus> {
    let s = |p: &str| obj.pointer(p).and_then(Json::as_str).unwrap_or("").to_string();
    let mut status = ModifiedStatus {
        api_version: s("/apiVersion"),
        kind: s("/kind"),
        namespace: s("/metadata/namespace"),
        name: s("/metadata/name"),
        ..ModifiedStatus::default()
    };
    match drift {
        Drift::InSync => return None,
        Drift::Missing => status.create = true,
        Drift::Orphaned => status.delete = true,
        Drift::Modified { patch, .. } => status.patch = patch.to_string(),
    }
    Some(status)
}
