//! Flotilla storage facade.
//!
//! [`StandardStorage`] is the create/get/list/update/delete/watch contract a
//! hosting API server calls for BundleDeployments; [`BundleDeploymentStorage`]
//! implements it on the versioned store and the watch broker.

#![forbid(unsafe_code)]

use flotilla_core::{BundleDeployment, BundleDeploymentList, LabelSelector, RequestContext};
use flotilla_persist::StoreError;
use kube::core::GroupVersionKind;
use serde::{Deserialize, Serialize};

mod config;
mod storage;

pub use config::StorageConfig;
pub use flotilla_store::{Event, WatchStream};
pub use storage::{BundleDeploymentStorage, StatusStorage};

/// API errors, mapped onto conventional HTTP status codes.
#[derive(Debug, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum FlotillaError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl FlotillaError {
    pub fn status_code(&self) -> u16 {
        match self {
            FlotillaError::NotFound(_) => 404,
            FlotillaError::AlreadyExists(_) | FlotillaError::Conflict(_) => 409,
            FlotillaError::Invalid(_) => 400,
            FlotillaError::Internal(_) => 500,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FlotillaError::NotFound(_))
    }
}

impl From<StoreError> for FlotillaError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { .. } => FlotillaError::NotFound(e.to_string()),
            StoreError::AlreadyExists { .. } => FlotillaError::AlreadyExists(e.to_string()),
            StoreError::Conflict { .. } => FlotillaError::Conflict(e.to_string()),
            StoreError::Codec { .. } | StoreError::Invalid(_) => FlotillaError::Invalid(e.to_string()),
            StoreError::Sqlite(_) => FlotillaError::Internal(e.to_string()),
        }
    }
}

pub type FlotillaResult<T> = Result<T, FlotillaError>;

/// Produces the desired object from the current one (`None` when absent).
pub type UpdateFn = Box<dyn FnOnce(Option<BundleDeployment>) -> FlotillaResult<BundleDeployment> + Send>;

/// Options shared by list, watch and delete-collection.
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    pub label_selector: LabelSelector,
    /// Watch start version; 0 or unset replays current objects first.
    pub resource_version: Option<i64>,
}

impl ListOptions {
    pub fn selector(label_selector: LabelSelector) -> Self {
        Self { label_selector, resource_version: None }
    }
}

/// Storage contract for one namespaced resource type with a status subresource.
#[async_trait::async_trait]
pub trait StandardStorage: Send + Sync {
    fn new_object(&self) -> BundleDeployment;

    fn new_list(&self) -> BundleDeploymentList;

    fn singular_name(&self) -> &str;

    fn group_version_kind(&self) -> GroupVersionKind;

    fn namespace_scoped(&self) -> bool;

    /// Store a new object. Server-assigned fields (uid, creation timestamp,
    /// generation, resource version) are overwritten.
    async fn create(&self, ctx: &RequestContext, obj: BundleDeployment) -> FlotillaResult<BundleDeployment>;

    async fn get(&self, ctx: &RequestContext, name: &str) -> FlotillaResult<BundleDeployment>;

    /// Objects in the context namespace (all namespaces when unset) matching
    /// the selector, with the store version the rows were read at.
    async fn list(&self, ctx: &RequestContext, opts: &ListOptions) -> FlotillaResult<BundleDeploymentList>;

    /// Replace an object with the output of `update`. When absent and
    /// `force_create` is set the result is created instead. Returns the stored
    /// object and whether it was created.
    async fn update(
        &self,
        ctx: &RequestContext,
        name: &str,
        update: UpdateFn,
        force_create: bool,
    ) -> FlotillaResult<(BundleDeployment, bool)>;

    /// Remove an object, returning its last stored state.
    async fn delete(&self, ctx: &RequestContext, name: &str) -> FlotillaResult<BundleDeployment>;

    async fn delete_collection(&self, ctx: &RequestContext, opts: &ListOptions) -> FlotillaResult<BundleDeploymentList>;

    async fn watch(&self, ctx: &RequestContext, opts: &ListOptions) -> FlotillaResult<WatchStream>;

    /// Release background resources (the watch poll loop).
    fn destroy(&self);
}
