//! Conversion between typed BundleDeployments and `bundledeployments` rows.
//!
//! Optional columns (labels, annotations, finalizers, owner references and
//! status) are decoded leniently: a corrupt blob is logged, counted in
//! `codec_partial_decode_total` and read as absent. A corrupt or empty spec
//! fails the row.

use chrono::{DateTime, Utc};
use flotilla_core::BundleDeployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::{Record, StoreError, StoreResult};

pub fn encode(bd: &BundleDeployment) -> StoreResult<Record> {
    let meta = &bd.metadata;
    let namespace = meta.namespace.clone().filter(|s| !s.is_empty());
    let name = meta.name.clone().filter(|s| !s.is_empty());
    let (Some(namespace), Some(name)) = (namespace, name) else {
        return Err(StoreError::Invalid("namespace and name are required".into()));
    };
    let uid = meta.uid.clone().ok_or_else(|| StoreError::Invalid(format!("{namespace}/{name}: uid is required")))?;
    let creation_timestamp = meta
        .creation_timestamp
        .as_ref()
        .map(|t| t.0.timestamp())
        .ok_or_else(|| StoreError::Invalid(format!("{namespace}/{name}: creationTimestamp is required")))?;
    let resource_version = meta.resource_version.as_deref().and_then(|v| v.parse().ok()).unwrap_or(0);

    Ok(Record {
        deletion_timestamp: meta.deletion_timestamp.as_ref().map(|t| t.0.timestamp()),
        generation: meta.generation.unwrap_or(0),
        labels: blob_opt(meta.labels.as_ref(), "labels", &namespace, &name)?,
        annotations: blob_opt(meta.annotations.as_ref(), "annotations", &namespace, &name)?,
        finalizers: blob_opt(meta.finalizers.as_ref(), "finalizers", &namespace, &name)?,
        owner_references: blob_opt(meta.owner_references.as_ref(), "ownerReferences", &namespace, &name)?,
        spec: blob(&bd.spec, "spec", &namespace, &name)?,
        status: blob_opt(bd.status.as_ref(), "status", &namespace, &name)?,
        resource_version,
        uid,
        creation_timestamp,
        namespace,
        name,
    })
}

pub fn decode(record: &Record) -> StoreResult<BundleDeployment> {
    let ns = record.namespace.as_str();
    let name = record.name.as_str();
    let spec = serde_json::from_str(&record.spec).map_err(|source| StoreError::Codec {
        namespace: ns.to_string(),
        name: name.to_string(),
        field: "spec",
        source,
    })?;
    let metadata = ObjectMeta {
        namespace: Some(record.namespace.clone()),
        name: Some(record.name.clone()),
        resource_version: Some(record.resource_version.to_string()),
        uid: Some(record.uid.clone()),
        creation_timestamp: Some(time_from_secs(record.creation_timestamp)),
        deletion_timestamp: record.deletion_timestamp.map(time_from_secs),
        generation: Some(record.generation),
        labels: lenient(record.labels.as_deref(), "labels", ns, name),
        annotations: lenient(record.annotations.as_deref(), "annotations", ns, name),
        finalizers: lenient(record.finalizers.as_deref(), "finalizers", ns, name),
        owner_references: lenient(record.owner_references.as_deref(), "ownerReferences", ns, name),
        ..ObjectMeta::default()
    };
    Ok(BundleDeployment { metadata, spec, status: lenient(record.status.as_deref(), "status", ns, name) })
}

/// Decode every row, failing on the first row whose spec cannot be read.
pub fn decode_all(records: &[Record]) -> StoreResult<Vec<BundleDeployment>> {
    records.iter().map(decode).collect()
}

/// Identity-only object used for Deleted events when the body is gone.
pub fn deleted_stub(namespace: &str, name: &str, resource_version: i64) -> BundleDeployment {
    let mut bd = BundleDeployment::new(name, Default::default());
    bd.metadata.namespace = Some(namespace.to_string());
    bd.metadata.resource_version = Some(resource_version.to_string());
    bd
}

/// Second-resolution timestamp, as stored.
pub fn time_from_secs(secs: i64) -> Time {
    Time(DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default())
}

pub fn now() -> Time {
    time_from_secs(crate::sqlite::now_ts())
}

fn lenient<T: DeserializeOwned>(raw: Option<&str>, field: &'static str, namespace: &str, name: &str) -> Option<T> {
    let raw = raw?;
    match serde_json::from_str::<Option<T>>(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(namespace, name, field, error = %e, "dropping undecodable column");
            counter!("codec_partial_decode_total", 1u64, "field" => field);
            None
        }
    }
}

fn blob<T: Serialize>(v: &T, field: &'static str, namespace: &str, name: &str) -> StoreResult<String> {
    serde_json::to_string(v).map_err(|source| StoreError::Codec {
        namespace: namespace.to_string(),
        name: name.to_string(),
        field,
        source,
    })
}

fn blob_opt<T: Serialize>(v: Option<&T>, field: &'static str, namespace: &str, name: &str) -> StoreResult<Option<String>> {
    v.map(|v| blob(v, field, namespace, name)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::{BundleDeploymentSpec, BundleDeploymentStatus};
    use std::collections::BTreeMap;

    fn sample() -> BundleDeployment {
        let mut bd = BundleDeployment::new(
            "bd1",
            BundleDeploymentSpec { deployment_id: "abc".into(), ..Default::default() },
        );
        bd.metadata.namespace = Some("ns1".into());
        bd.metadata.uid = Some("u-1".into());
        bd.metadata.generation = Some(1);
        bd.metadata.creation_timestamp = Some(time_from_secs(1_700_000_000));
        bd.metadata.labels = Some(BTreeMap::from([("env".to_string(), "prod".to_string())]));
        bd.status = Some(BundleDeploymentStatus { ready: true, ..Default::default() });
        bd
    }

    #[test]
    fn encode_then_decode_preserves_object() {
        let bd = sample();
        let mut rec = encode(&bd).unwrap();
        rec.resource_version = 4;
        assert_eq!(rec.spec, r#"{"deploymentID":"abc","options":{},"stagedOptions":{}}"#);
        let back = decode(&rec).unwrap();
        assert_eq!(back.spec, bd.spec);
        assert_eq!(back.status, bd.status);
        assert_eq!(back.metadata.labels, bd.metadata.labels);
        assert_eq!(back.metadata.resource_version.as_deref(), Some("4"));
        assert_eq!(back.metadata.creation_timestamp, bd.metadata.creation_timestamp);
        assert!(back.metadata.annotations.is_none());
    }

    #[test]
    fn encode_requires_identity() {
        let mut bd = sample();
        bd.metadata.namespace = None;
        assert!(matches!(encode(&bd), Err(StoreError::Invalid(_))));
        let mut bd = sample();
        bd.metadata.uid = None;
        assert!(matches!(encode(&bd), Err(StoreError::Invalid(_))));
    }

    #[test]
    fn corrupt_optional_columns_are_dropped() {
        let mut rec = encode(&sample()).unwrap();
        rec.labels = Some("{not json".into());
        rec.status = Some("42".into());
        rec.finalizers = Some("null".into());
        let back = decode(&rec).unwrap();
        assert!(back.metadata.labels.is_none());
        assert!(back.status.is_none());
        assert!(back.metadata.finalizers.is_none());
        assert_eq!(back.spec.deployment_id, "abc");
    }

    #[test]
    fn corrupt_spec_is_fatal() {
        let mut rec = encode(&sample()).unwrap();
        rec.spec = "oops".into();
        let err = decode(&rec).unwrap_err();
        assert!(matches!(err, StoreError::Codec { field: "spec", .. }));
        assert!(decode_all(&[encode(&sample()).unwrap(), rec]).is_err());
    }

    #[test]
    fn deleted_stub_carries_identity_only() {
        let bd = deleted_stub("ns1", "gone", 9);
        assert_eq!(bd.metadata.name.as_deref(), Some("gone"));
        assert_eq!(bd.metadata.namespace.as_deref(), Some("ns1"));
        assert_eq!(bd.metadata.resource_version.as_deref(), Some("9"));
        assert!(bd.status.is_none());
    }
}
