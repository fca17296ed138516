//! Flotilla diff normalizers.
//!
//! Live objects pick up fields from controllers Fleet does not own (sidecar
//! injectors, autoscalers, cert-manager). Before a live object is compared to
//! its desired manifest it runs through a [`Normalizer`] chain that removes or
//! canonicalises those fields, so they never show up as drift.
//!
//! Objects are handled in their unstructured JSON form.

#![forbid(unsafe_code)]

use serde_json::Value;

mod drift;
mod ignore;
mod known_types;
mod manifest;
mod pointer;
mod rules;

pub use drift::{detect_drift, diff_summary, modified_status, strip_noisy, DiffSummary, Drift};
pub use ignore::{default_ignore_rules, IgnoreNormalizer};
pub use known_types::{canonical_quantity, KnownTypesNormalizer, KNOWN_TYPES};
pub use manifest::{group_kind, parse_manifest};
pub use rules::{IgnoreRule, KnownTypeField, OverrideIgnoreDiff, ResourceOverride, RuleSet};

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("invalid glob {pattern:?}: {source}")]
    Glob {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("unknown type {type_name:?} for field {field:?}")]
    UnknownType { field: String, type_name: String },
    #[error("field {field:?} does not decode as {type_name}: {source}")]
    Decode {
        field: String,
        type_name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("manifest: {0}")]
    Manifest(String),
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type NormalizeResult<T> = Result<T, NormalizeError>;

/// A stage that rewrites a live object in place before it is diffed.
pub trait Normalizer: Send + Sync {
    fn normalize(&self, obj: &mut Value) -> NormalizeResult<()>;
}

/// Runs its stages in order; the first failing stage stops the chain and
/// its error is returned. Stages that already ran keep their edits.
#[derive(Default)]
pub struct ComposableNormalizer {
    stages: Vec<Box<dyn Normalizer>>,
}

impl ComposableNormalizer {
    pub fn new(stages: Vec<Box<dyn Normalizer>>) -> Self {
        Self { stages }
    }

    pub fn push(mut self, stage: impl Normalizer + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl Normalizer for ComposableNormalizer {
    fn normalize(&self, obj: &mut Value) -> NormalizeResult<()> {
        for stage in &self.stages {
            stage.normalize(obj)?;
        }
        Ok(())
    }
}

/// The standard chain: ignore rules (built-in defaults, `ignore`, and the
/// `ignoreDifferences` of `overrides`) followed by known-type normalization
/// of the fields `overrides` declares.
pub fn diff_normalizer(ignore: Vec<IgnoreRule>, rules: &RuleSet) -> NormalizeResult<ComposableNormalizer> {
    let mut all = ignore;
    all.extend(rules.ignore_differences.iter().cloned());
    let ignore = IgnoreNormalizer::new(all, &rules.overrides)?;
    let known = KnownTypesNormalizer::new(&rules.overrides)?;
    Ok(ComposableNormalizer::default().push(ignore).push(known))
}
