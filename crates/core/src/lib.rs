//! Flotilla core types: the BundleDeployment object model, resource keys and
//! counts, label selectors, the typed request context and the type registry.

#![forbid(unsafe_code)]

pub mod context;
pub mod registry;
pub mod resources;
pub mod selector;
pub mod types;

pub use context::RequestContext;
pub use registry::{Registry, RegistryBuilder, ResourceInfo};
pub use resources::{cluster_id, ResourceCounts, ResourceKey};
pub use selector::{LabelSelector, SelectorError};
pub use types::*;

pub mod prelude {
    pub use super::{
        BundleDeployment, BundleDeploymentSpec, BundleDeploymentStatus, LabelSelector, Registry,
        RequestContext, ResourceCounts, ResourceKey,
    };
    pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
    pub use kube::{Resource, ResourceExt};
}
