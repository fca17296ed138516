//! Flotilla resource-state merger.
//!
//! A parent object (bundle, GitRepo) owns one BundleDeployment per target
//! cluster. Each deployment reports which resources it deployed and which of
//! them are not ready or drifted. [`merge_resources`] folds those reports into
//! one [`Resource`] per distinct resource key, with the per-cluster detail
//! kept underneath, and [`set_resources`] writes the result onto a parent's
//! [`StatusBase`].

#![forbid(unsafe_code)]

mod merge;
mod state;

pub use merge::{
    merge_resources, resource_counts_per_cluster, set_resources, sum_resource_counts, summary_state,
    MergedResources, MAX_REPORTED,
};
pub use state::{type_and_id, PerClusterState, Resource, ResourceState, StatusBase};
