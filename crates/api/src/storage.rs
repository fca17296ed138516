use std::sync::Arc;
use std::time::Instant;

use flotilla_core::{BundleDeployment, BundleDeploymentList, Registry, RequestContext, ResourceInfo};
use flotilla_persist::{codec, RecordStore, SqliteStore, StoreResult};
use flotilla_store::{WatchBroker, WatchOptions, WatchStream};
use kube::core::GroupVersionKind;
use metrics::counter;
use tracing::{debug, info};

use crate::{FlotillaError, FlotillaResult, ListOptions, StandardStorage, StorageConfig, UpdateFn};

/// BundleDeployment storage over a [`RecordStore`] and a [`WatchBroker`].
pub struct BundleDeploymentStorage<S: RecordStore = SqliteStore> {
    store: Arc<S>,
    broker: WatchBroker<S>,
    info: ResourceInfo,
    strict_resource_version: bool,
}

impl BundleDeploymentStorage<SqliteStore> {
    /// Open the SQLite store named by `cfg` and start the watch broker.
    pub fn open(cfg: &StorageConfig, registry: &Registry) -> FlotillaResult<Self> {
        let store = SqliteStore::open(&cfg.db_path)?.with_retention(cfg.event_retention);
        Self::new(Arc::new(store), registry, cfg)
    }
}

impl<S: RecordStore> BundleDeploymentStorage<S> {
    /// Must be called inside a tokio runtime; the broker's poll loop is spawned here.
    pub fn new(store: Arc<S>, registry: &Registry, cfg: &StorageConfig) -> FlotillaResult<Self> {
        let info = registry
            .lookup_of::<BundleDeployment>()
            .cloned()
            .ok_or_else(|| FlotillaError::Invalid("BundleDeployment is not registered".into()))?;
        let broker = WatchBroker::start(Arc::clone(&store), cfg.broker.clone());
        Ok(Self { store, broker, info, strict_resource_version: cfg.strict_resource_version })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn broker(&self) -> &WatchBroker<S> {
        &self.broker
    }

    /// Accessor restricted to the status field.
    pub fn status(&self) -> StatusStorage<'_, S> {
        StatusStorage { inner: self }
    }

    async fn run<T, F>(&self, f: F) -> FlotillaResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&S) -> StoreResult<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let res = tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| FlotillaError::Internal(format!("storage task failed: {e}")))?;
        Ok(res?)
    }

    async fn fetch(&self, namespace: &str, name: &str) -> FlotillaResult<BundleDeployment> {
        let (ns, n) = (namespace.to_string(), name.to_string());
        let rec = self.run(move |s| s.get(&ns, &n)).await?;
        Ok(codec::decode(&rec)?)
    }

    /// Persist `obj` as an update of `existing`, keeping its identity fields.
    async fn replace(&self, existing: &BundleDeployment, mut obj: BundleDeployment) -> FlotillaResult<BundleDeployment> {
        let started = Instant::now();
        let expected_rv = if self.strict_resource_version {
            match obj.metadata.resource_version.as_deref().filter(|v| !v.is_empty()) {
                Some(v) => Some(
                    v.parse::<i64>()
                        .map_err(|_| FlotillaError::Invalid(format!("malformed resourceVersion '{v}'")))?,
                ),
                None => None,
            }
        } else {
            None
        };
        obj.metadata.namespace = existing.metadata.namespace.clone();
        obj.metadata.name = existing.metadata.name.clone();
        obj.metadata.uid = existing.metadata.uid.clone();
        obj.metadata.creation_timestamp = existing.metadata.creation_timestamp.clone();
        obj.metadata.generation = Some(existing.metadata.generation.unwrap_or(0) + 1);
        let record = codec::encode(&obj)?;
        let stored = self.run(move |s| s.update(record, expected_rv)).await?;
        let out = codec::decode(&stored)?;
        counter!("storage_ops_total", 1u64, "op" => "update");
        info!(
            ns = %stored.namespace,
            name = %stored.name,
            rv = stored.resource_version,
            generation = stored.generation,
            took_ms = started.elapsed().as_millis() as u64,
            "updated"
        );
        Ok(out)
    }

    async fn update_with(
        &self,
        ctx: &RequestContext,
        name: &str,
        update: UpdateFn,
        force_create: bool,
    ) -> FlotillaResult<(BundleDeployment, bool)> {
        let ns = require_namespace(ctx)?;
        let existing = match self.fetch(ns, name).await {
            Ok(existing) => existing,
            Err(e) if e.is_not_found() && force_create => {
                let mut obj = update(None)?;
                if obj.metadata.name.as_deref().map_or(true, str::is_empty) {
                    obj.metadata.name = Some(name.to_string());
                }
                check_identity(&obj, ns, name)?;
                let created = self.create(ctx, obj).await?;
                return Ok((created, true));
            }
            Err(e) => return Err(e),
        };
        let obj = update(Some(existing.clone()))?;
        check_identity(&obj, ns, name)?;
        Ok((self.replace(&existing, obj).await?, false))
    }
}

#[async_trait::async_trait]
impl<S: RecordStore> StandardStorage for BundleDeploymentStorage<S> {
    fn new_object(&self) -> BundleDeployment {
        BundleDeployment::new("", Default::default())
    }

    fn new_list(&self) -> BundleDeploymentList {
        BundleDeploymentList::new(Vec::new(), 0)
    }

    fn singular_name(&self) -> &str {
        &self.info.singular
    }

    fn group_version_kind(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.info.group, &self.info.version, &self.info.kind)
    }

    fn namespace_scoped(&self) -> bool {
        self.info.namespaced
    }

    async fn create(&self, ctx: &RequestContext, mut obj: BundleDeployment) -> FlotillaResult<BundleDeployment> {
        let started = Instant::now();
        let ns = match (obj.metadata.namespace.as_deref().filter(|s| !s.is_empty()), ctx.namespace()) {
            (Some(obj_ns), Some(ctx_ns)) if obj_ns != ctx_ns => {
                return Err(FlotillaError::Invalid(format!(
                    "object namespace '{obj_ns}' does not match request namespace '{ctx_ns}'"
                )));
            }
            (Some(ns), _) | (None, Some(ns)) => ns.to_string(),
            (None, None) => return Err(FlotillaError::Invalid("namespace is required".into())),
        };
        if obj.metadata.name.as_deref().map_or(true, str::is_empty) {
            return Err(FlotillaError::Invalid("metadata.name is required".into()));
        }
        obj.metadata.namespace = Some(ns);
        obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        obj.metadata.creation_timestamp = Some(codec::now());
        obj.metadata.generation = Some(1);
        obj.metadata.resource_version = None;
        let record = codec::encode(&obj)?;
        let stored = self.run(move |s| s.create(record)).await?;
        let out = codec::decode(&stored)?;
        counter!("storage_ops_total", 1u64, "op" => "create");
        info!(
            ns = %stored.namespace,
            name = %stored.name,
            rv = stored.resource_version,
            took_ms = started.elapsed().as_millis() as u64,
            "created"
        );
        Ok(out)
    }

    async fn get(&self, ctx: &RequestContext, name: &str) -> FlotillaResult<BundleDeployment> {
        let ns = require_namespace(ctx)?;
        self.fetch(ns, name).await
    }

    async fn list(&self, ctx: &RequestContext, opts: &ListOptions) -> FlotillaResult<BundleDeploymentList> {
        let started = Instant::now();
        let ns = ctx.namespace().map(str::to_string);
        let (records, rv) = self.run(move |s| s.list(ns.as_deref())).await?;
        let scanned = records.len();
        let items: Vec<BundleDeployment> = codec::decode_all(&records)?
            .into_iter()
            .filter(|bd| opts.label_selector.matches(bd.metadata.labels.as_ref()))
            .collect();
        debug!(
            ns = ?ctx.namespace(),
            selector = %opts.label_selector,
            scanned,
            matched = items.len(),
            rv,
            took_ms = started.elapsed().as_millis() as u64,
            "listed"
        );
        Ok(BundleDeploymentList::new(items, rv))
    }

    async fn update(
        &self,
        ctx: &RequestContext,
        name: &str,
        update: UpdateFn,
        force_create: bool,
    ) -> FlotillaResult<(BundleDeployment, bool)> {
        self.update_with(ctx, name, update, force_create).await
    }

    async fn delete(&self, ctx: &RequestContext, name: &str) -> FlotillaResult<BundleDeployment> {
        let ns = require_namespace(ctx)?.to_string();
        let n = name.to_string();
        let stored = self.run(move |s| s.delete(&ns, &n)).await?;
        counter!("storage_ops_total", 1u64, "op" => "delete");
        info!(ns = %stored.namespace, name = %stored.name, rv = stored.resource_version, "deleted");
        Ok(codec::decode(&stored)?)
    }

    async fn delete_collection(&self, ctx: &RequestContext, opts: &ListOptions) -> FlotillaResult<BundleDeploymentList> {
        let listed = self.list(ctx, opts).await?;
        let mut deleted = Vec::with_capacity(listed.items.len());
        for bd in listed.items {
            let (ns, name) = (bd.metadata.namespace.clone().unwrap_or_default(), bd.metadata.name.clone().unwrap_or_default());
            let (n1, n2) = (ns.clone(), name.clone());
            match self.run(move |s| s.delete(&n1, &n2)).await {
                Ok(rec) => deleted.push(codec::decode(&rec)?),
                Err(e) if e.is_not_found() => debug!(%ns, %name, "already gone"),
                Err(e) => return Err(e),
            }
        }
        info!(ns = ?ctx.namespace(), deleted = deleted.len(), "deleted collection");
        Ok(BundleDeploymentList::new(deleted, self.store.current_resource_version()))
    }

    async fn watch(&self, ctx: &RequestContext, opts: &ListOptions) -> FlotillaResult<WatchStream> {
        let rv = opts.resource_version.unwrap_or(0);
        if rv < 0 {
            return Err(FlotillaError::Invalid(format!("resourceVersion {rv} is negative")));
        }
        Ok(self.broker.watch(
            ctx,
            WatchOptions {
                namespace: ctx.namespace().map(str::to_string),
                resource_version: rv,
                selector: opts.label_selector.clone(),
            },
        ))
    }

    fn destroy(&self) {
        self.broker.stop();
    }
}

/// Status-only view of a [`BundleDeploymentStorage`].
pub struct StatusStorage<'a, S: RecordStore> {
    inner: &'a BundleDeploymentStorage<S>,
}

impl<S: RecordStore> StatusStorage<'_, S> {
    pub async fn get(&self, ctx: &RequestContext, name: &str) -> FlotillaResult<BundleDeployment> {
        self.inner.get(ctx, name).await
    }

    /// Apply only the `status` of `update`'s result to the stored object.
    /// Never creates; the object's generation still advances.
    pub async fn update(
        &self,
        ctx: &RequestContext,
        name: &str,
        update: UpdateFn,
    ) -> FlotillaResult<(BundleDeployment, bool)> {
        let name_owned = name.to_string();
        let status_only: UpdateFn = Box::new(move |current: Option<BundleDeployment>| -> FlotillaResult<BundleDeployment> {
            let current = current.ok_or_else(|| FlotillaError::NotFound(format!("bundledeployment {name_owned} not found")))?;
            let desired = update(Some(current.clone()))?;
            let mut next = current;
            next.status = desired.status;
            next.metadata.resource_version = desired.metadata.resource_version;
            Ok(next)
        });
        self.inner.update_with(ctx, name, status_only, false).await
    }
}

fn require_namespace(ctx: &RequestContext) -> FlotillaResult<&str> {
    ctx.namespace().ok_or_else(|| FlotillaError::Invalid("namespace is required".into()))
}

fn check_identity(obj: &BundleDeployment, namespace: &str, name: &str) -> FlotillaResult<()> {
    if let Some(n) = obj.metadata.name.as_deref().filter(|n| !n.is_empty()) {
        if n != name {
            return Err(FlotillaError::Invalid(format!("name '{n}' does not match request name '{name}'")));
        }
    }
    if let Some(ns) = obj.metadata.namespace.as_deref().filter(|ns| !ns.is_empty()) {
        if ns != namespace {
            return Err(FlotillaError::Invalid(format!(
                "namespace '{ns}' does not match request namespace '{namespace}'"
            )));
        }
    }
    Ok(())
}
