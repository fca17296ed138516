//! Immutable type registry.
//!
//! Built once at startup with [`RegistryBuilder`] and handed to storage
//! constructors; there is no process-global scheme to mutate.

use std::any::TypeId;
use std::sync::Arc;

use kube::core::{NamespaceResourceScope, Resource};

use crate::types::BundleDeployment;

/// Static description of one served resource type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceInfo {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub singular: String,
    pub namespaced: bool,
    pub status_subresource: bool,
}

impl ResourceInfo {
    /// Describe a statically typed resource.
    pub fn of<K>() -> Self
    where
        K: Resource<DynamicType = ()>,
        K::Scope: 'static,
    {
        let kind = K::kind(&()).to_string();
        Self {
            group: K::group(&()).to_string(),
            version: K::version(&()).to_string(),
            plural: K::plural(&()).to_string(),
            singular: kind.to_ascii_lowercase(),
            kind,
            namespaced: TypeId::of::<K::Scope>() == TypeId::of::<NamespaceResourceScope>(),
            status_subresource: false,
        }
    }

    pub fn with_status(mut self) -> Self {
        self.status_subresource = true;
        self
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

#[derive(Debug, Default)]
pub struct RegistryBuilder {
    types: Vec<ResourceInfo>,
}

impl RegistryBuilder {
    pub fn register(mut self, info: ResourceInfo) -> Self {
        self.types.retain(|t| !(t.group == info.group && t.kind == info.kind));
        self.types.push(info);
        self
    }

    pub fn build(self) -> Registry {
        Registry { types: Arc::from(self.types) }
    }
}

/// Cheap to clone; contents never change after [`RegistryBuilder::build`].
#[derive(Clone, Debug)]
pub struct Registry {
    types: Arc<[ResourceInfo]>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Registry serving BundleDeployments with a status subresource.
    pub fn fleet() -> Self {
        Self::builder().register(ResourceInfo::of::<BundleDeployment>().with_status()).build()
    }

    pub fn lookup(&self, group: &str, kind: &str) -> Option<&ResourceInfo> {
        self.types.iter().find(|t| t.group == group && t.kind == kind)
    }

    pub fn lookup_of<K>(&self) -> Option<&ResourceInfo>
    where
        K: Resource<DynamicType = ()>,
    {
        self.lookup(&K::group(&()), &K::kind(&()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceInfo> {
        self.types.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fleet_registry_describes_bundle_deployments() {
        let reg = Registry::fleet();
        let info = reg.lookup("fleet.cattle.io", "BundleDeployment").unwrap();
        assert_eq!(info.plural, "bundledeployments");
        assert_eq!(info.singular, "bundledeployment");
        assert_eq!(info.api_version(), "fleet.cattle.io/v1alpha1");
        assert!(info.namespaced);
        assert!(info.status_subresource);
        assert_eq!(reg.lookup_of::<BundleDeployment>(), Some(info));
    }

    #[test]
    fn re_registering_replaces() {
        let reg = Registry::builder()
            .register(ResourceInfo::of::<BundleDeployment>())
            .register(ResourceInfo::of::<BundleDeployment>().with_status())
            .build();
        assert_eq!(reg.iter().count(), 1);
        assert!(reg.iter().all(|t| t.status_subresource));
        assert!(reg.lookup("", "Pod").is_none());
    }
}
