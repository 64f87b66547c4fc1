//! Tenant manager supervision
//!
//! Each control-plane Kyma gets one tenant loop, started once the tenant
//! cluster is reachable and stopped only after the mirrored Kyma in that
//! cluster is gone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::ObjectMeta;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use super::conditions::{error_condition, REASON_CLUSTER_CLIENT_CREATION_ERROR};
use super::credential::evaluate_rotation;
use super::finalizers::{add_finalizer, is_being_deleted, remove_finalizer};
use super::tenant_loop::{TenantLoop, TenantLoopFactory};
use super::ReconcileOutcome;
use crate::clock::Clock;
use crate::config::SimConfig;
use crate::crd::{
    tenant_crds, CloudResources, GardenerCluster, Kyma, KymaSpec, KymaState, KymaStatus,
    DEFAULT_CHANNEL, DELETION_HOOK_FINALIZER, LABEL_DO_NOT_RECONCILE,
};
use crate::error::{Error, Result};
use crate::store::{KubeStore, MemoryStore, ObjectKey, Store};

/// Wait between checks while the tenant cluster catches up
const TENANT_POLL: Duration = Duration::from_secs(1);

/// Resolves a handle on a runtime's tenant cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterResolver: Send + Sync {
    /// Fails with `CredentialsNotReady` until a kubeconfig has been issued
    async fn resolve(&self, runtime_id: &str) -> Result<Store>;
}

/// Installs CRDs into a tenant cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CrdInstaller: Send + Sync {
    async fn install(&self, target: &Store, crds: Vec<CustomResourceDefinition>) -> Result<()>;
}

/// Creates each CRD, leaving existing ones alone
#[derive(Default)]
pub struct ApplyCrdInstaller;

#[async_trait]
impl CrdInstaller for ApplyCrdInstaller {
    async fn install(&self, target: &Store, crds: Vec<CustomResourceDefinition>) -> Result<()> {
        for crd in crds {
            let name = crd.name_any();
            match target.create(&crd).await {
                Ok(_) => info!(crd = %name, "Installed CRD in tenant cluster"),
                Err(e) if e.is_already_exists() => debug!(crd = %name, "CRD already present"),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Read the kubeconfig a GardenerCluster points at
///
/// A credential that is due for rotation counts as not ready, so no client
/// is built from an expired or forcibly revoked kubeconfig.
async fn load_kubeconfig(
    kcp: &Store,
    config: &SimConfig,
    clock: &dyn Clock,
    runtime_id: &str,
) -> Result<(Vec<u8>, Option<String>)> {
    let not_ready = || Error::CredentialsNotReady(runtime_id.to_string());
    let gc: GardenerCluster = kcp
        .get(Some(&config.kcp_namespace), runtime_id)
        .await?
        .ok_or_else(not_ready)?;
    let (needs_rotation, _) = evaluate_rotation(&gc, clock.now());
    if needs_rotation {
        return Err(not_ready());
    }
    let target = &gc.spec.kubeconfig.secret;
    let secret: Secret = kcp
        .get(Some(&target.namespace), &target.name)
        .await?
        .ok_or_else(not_ready)?;
    let data = secret
        .data
        .as_ref()
        .and_then(|d| d.get(&target.key))
        .ok_or_else(not_ready)?;
    Ok((data.0.clone(), secret.metadata.resource_version.clone()))
}

/// Builds API clients from the kubeconfig secrets in the control plane
pub struct KubeconfigClusterResolver {
    kcp: Store,
    config: Arc<SimConfig>,
    clock: Arc<dyn Clock>,
    // runtime id -> (secret resourceVersion, store)
    cache: Mutex<HashMap<String, (Option<String>, Store)>>,
}

impl KubeconfigClusterResolver {
    pub fn new(kcp: Store, config: Arc<SimConfig>, clock: Arc<dyn Clock>) -> Self {
        Self {
            kcp,
            config,
            clock,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ClusterResolver for KubeconfigClusterResolver {
    async fn resolve(&self, runtime_id: &str) -> Result<Store> {
        let (raw, version) = load_kubeconfig(&self.kcp, &self.config, &*self.clock, runtime_id).await?;
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((cached_version, store)) = cache.get(runtime_id) {
                if *cached_version == version {
                    return Ok(store.clone());
                }
            }
        }

        let yaml = String::from_utf8(raw)
            .map_err(|e| Error::CredentialError(format!("kubeconfig is not UTF-8: {e}")))?;
        let kubeconfig = Kubeconfig::from_yaml(&yaml)
            .map_err(|e| Error::CredentialError(format!("parsing kubeconfig: {e}")))?;
        let client_config =
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::CredentialError(format!("loading kubeconfig: {e}")))?;
        let client = Client::try_from(client_config)?;
        let store = Store::new(Arc::new(KubeStore::new(client)));

        debug!(runtime = %runtime_id, "Built tenant client");
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(runtime_id.to_string(), (version, store.clone()));
        Ok(store)
    }
}

/// Hands out one in-memory tenant cluster per runtime
///
/// A cluster is only reachable once its kubeconfig secret exists, so the
/// credential controller still gates access as it would against real shoots.
pub struct SimulatedClusterResolver {
    kcp: Store,
    config: Arc<SimConfig>,
    clock: Arc<dyn Clock>,
    clusters: Mutex<HashMap<String, Arc<MemoryStore>>>,
}

impl SimulatedClusterResolver {
    pub fn new(kcp: Store, config: Arc<SimConfig>, clock: Arc<dyn Clock>) -> Self {
        Self {
            kcp,
            config,
            clock,
            clusters: Mutex::new(HashMap::new()),
        }
    }

    /// The tenant cluster of a runtime, if it was ever resolved
    pub fn cluster(&self, runtime_id: &str) -> Option<Arc<MemoryStore>> {
        self.clusters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(runtime_id)
            .cloned()
    }
}

#[async_trait]
impl ClusterResolver for SimulatedClusterResolver {
    async fn resolve(&self, runtime_id: &str) -> Result<Store> {
        load_kubeconfig(&self.kcp, &self.config, &*self.clock, runtime_id).await?;
        let mut clusters = self.clusters.lock().unwrap_or_else(|e| e.into_inner());
        let cluster = clusters
            .entry(runtime_id.to_string())
            .or_insert_with(|| Arc::new(MemoryStore::tenant(self.clock.clone())));
        Ok(Store::new(cluster.clone()))
    }
}

/// A running tenant loop
pub struct TenantManagerHandle {
    runtime_id: String,
    cancel: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl TenantManagerHandle {
    pub fn spawn(runtime_id: &str, tenant_loop: Box<dyn TenantLoop>) -> Self {
        let cancel = CancellationToken::new();
        let last_error = Arc::new(Mutex::new(None));

        let task = {
            let cancel = cancel.clone();
            let last_error = last_error.clone();
            let span = info_span!("tenant_loop", runtime = %runtime_id);
            tokio::spawn(
                async move {
                    if let Err(e) = tenant_loop.run(cancel).await {
                        error!("Tenant loop exited with error: {}", e);
                        *last_error.lock().unwrap_or_else(|e| e.into_inner()) =
                            Some(e.to_string());
                    }
                }
                .instrument(span),
            )
        };

        Self {
            runtime_id: runtime_id.to_string(),
            cancel,
            task: tokio::sync::Mutex::new(Some(task)),
            last_error,
        }
    }

    pub fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Cancel the loop and wait for it to return
    pub async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(format!("tenant loop panicked: {e}"));
            }
        }
        match self.last_error() {
            Some(message) => Err(Error::TenantLoopError(message)),
            None => Ok(()),
        }
    }
}

/// At most one handle per runtime id
#[derive(Default)]
pub struct TenantManagerRegistry {
    handles: Mutex<HashMap<String, Arc<TenantManagerHandle>>>,
}

impl TenantManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the existing handle, or register the one `create` builds
    ///
    /// The second value is true when `create` ran.
    pub fn get_or_create<F>(&self, runtime_id: &str, create: F) -> (Arc<TenantManagerHandle>, bool)
    where
        F: FnOnce() -> TenantManagerHandle,
    {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = handles.get(runtime_id) {
            return (handle.clone(), false);
        }
        let handle = Arc::new(create());
        handles.insert(runtime_id.to_string(), handle.clone());
        (handle, true)
    }

    pub fn get(&self, runtime_id: &str) -> Option<Arc<TenantManagerHandle>> {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(runtime_id)
            .cloned()
    }

    pub fn contains(&self, runtime_id: &str) -> bool {
        self.get(runtime_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.handles.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop a runtime's loop and forget it. `None` if there was no loop.
    pub async fn remove_and_join(&self, runtime_id: &str) -> Option<Result<()>> {
        let handle = self.get(runtime_id)?;
        let result = handle.stop().await;
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        if handles
            .get(runtime_id)
            .is_some_and(|current| Arc::ptr_eq(current, &handle))
        {
            handles.remove(runtime_id);
        }
        Some(result)
    }

    /// Stop every loop, used on shutdown
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        for id in ids {
            if let Some(Err(e)) = self.remove_and_join(&id).await {
                warn!(runtime = %id, "Tenant loop ended with error: {}", e);
            }
        }
    }
}

pub struct TenantSupervisor {
    kcp: Store,
    resolver: Arc<dyn ClusterResolver>,
    installer: Arc<dyn CrdInstaller>,
    loops: Arc<dyn TenantLoopFactory>,
    registry: Arc<TenantManagerRegistry>,
    clock: Arc<dyn Clock>,
    config: Arc<SimConfig>,
}

impl TenantSupervisor {
    pub fn new(
        kcp: Store,
        resolver: Arc<dyn ClusterResolver>,
        installer: Arc<dyn CrdInstaller>,
        loops: Arc<dyn TenantLoopFactory>,
        registry: Arc<TenantManagerRegistry>,
        clock: Arc<dyn Clock>,
        config: Arc<SimConfig>,
    ) -> Self {
        Self {
            kcp,
            resolver,
            installer,
            loops,
            registry,
            clock,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<TenantManagerRegistry> {
        &self.registry
    }

    #[instrument(skip(self), fields(kyma = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let kyma: Option<Kyma> = self
            .kcp
            .get(key.namespace.as_deref(), &key.name)
            .await?;
        let mut kyma = match kyma {
            Some(k) => k,
            None => return Ok(ReconcileOutcome::Done),
        };
        if kyma.labels().contains_key(LABEL_DO_NOT_RECONCILE) {
            return Ok(ReconcileOutcome::Done);
        }

        // The control-plane Kyma is named after its runtime
        let runtime_id = kyma.name_any();
        let tenant = match self.resolver.resolve(&runtime_id).await {
            Ok(store) => Some(store),
            // Credentials that are gone for good leave nothing to clean up
            Err(Error::CredentialsNotReady(_))
                if is_being_deleted(&kyma) && !self.has_credentials(&runtime_id).await? =>
            {
                None
            }
            Err(Error::CredentialsNotReady(_)) => {
                debug!("Tenant credentials not ready yet");
                return Ok(ReconcileOutcome::RequeueAfter(TENANT_POLL));
            }
            Err(e) => {
                self.mark_client_error(&kyma, &e).await;
                return Err(e);
            }
        };

        if is_being_deleted(&kyma) {
            self.reconcile_deletion(&mut kyma, &runtime_id, tenant).await
        } else {
            match tenant {
                Some(tenant) => self.reconcile_creation(&mut kyma, &runtime_id, tenant).await,
                None => Ok(ReconcileOutcome::RequeueAfter(TENANT_POLL)),
            }
        }
    }

    async fn has_credentials(&self, runtime_id: &str) -> Result<bool> {
        let gc: Option<GardenerCluster> = self
            .kcp
            .get(Some(&self.config.kcp_namespace), runtime_id)
            .await?;
        Ok(gc.is_some())
    }

    /// Record why no tenant client could be built. Module statuses are kept.
    async fn mark_client_error(&self, kyma: &Kyma, cause: &Error) {
        let mut kyma = kyma.clone();
        let status = kyma.status.get_or_insert_with(KymaStatus::default);
        status.state = Some(KymaState::Error);
        status.conditions = vec![error_condition(
            REASON_CLUSTER_CLIENT_CREATION_ERROR,
            &cause.to_string(),
            self.clock.now(),
        )
        .with_observed_generation(kyma.metadata.generation)];
        if let Err(e) = self.kcp.patch_status(&kyma).await {
            warn!("Failed to record tenant client error: {}", e);
        }
    }

    async fn reconcile_deletion(
        &self,
        kyma: &mut Kyma,
        runtime_id: &str,
        tenant: Option<Store>,
    ) -> Result<ReconcileOutcome> {
        if let Some(tenant) = tenant {
            let namespace = &self.config.tenant_namespace;
            let manifest = &self.config.tenant_manifest_name;
            let tenant_kyma: Option<Kyma> =
                tenant.get_if_registered(Some(namespace), manifest).await?;
            match tenant_kyma {
                Some(tk) if !is_being_deleted(&tk) => {
                    info!("Deleting tenant Kyma");
                    tenant.delete_if_exists::<Kyma>(Some(namespace), manifest).await?;
                    return Ok(ReconcileOutcome::RequeueAfter(TENANT_POLL));
                }
                Some(_) => {
                    debug!("Waiting for tenant Kyma to be deleted");
                    return Ok(ReconcileOutcome::RequeueAfter(TENANT_POLL));
                }
                None => {}
            }
        } else {
            warn!("Tenant cluster unreachable during deletion, skipping tenant cleanup");
        }

        // The loop releases the tenant Kyma's finalizer, so it stops last
        if let Some(Err(e)) = self.registry.remove_and_join(runtime_id).await {
            warn!("Tenant loop ended with error: {}", e);
        }
        remove_finalizer(&self.kcp, kyma, DELETION_HOOK_FINALIZER).await?;
        info!("Control-plane Kyma released");
        Ok(ReconcileOutcome::Done)
    }

    async fn reconcile_creation(
        &self,
        kyma: &mut Kyma,
        runtime_id: &str,
        tenant: Store,
    ) -> Result<ReconcileOutcome> {
        add_finalizer(&self.kcp, kyma, DELETION_HOOK_FINALIZER).await?;

        let namespace = &self.config.tenant_namespace;
        self.ensure_namespace(&tenant, namespace).await?;

        if !tenant.is_registered::<Kyma>().await? || !tenant.is_registered::<CloudResources>().await?
        {
            info!("Installing module CRDs in tenant cluster");
            self.installer.install(&tenant, tenant_crds()).await?;
        }

        let manifest = &self.config.tenant_manifest_name;
        let existing: Option<Kyma> = tenant.get(Some(namespace), manifest).await?;
        if existing.is_none() {
            let tenant_kyma = Kyma {
                metadata: ObjectMeta {
                    name: Some(manifest.clone()),
                    namespace: Some(namespace.clone()),
                    labels: Some(kyma.labels().clone()),
                    finalizers: Some(vec![DELETION_HOOK_FINALIZER.to_string()]),
                    ..Default::default()
                },
                spec: KymaSpec {
                    channel: DEFAULT_CHANNEL.to_string(),
                    modules: vec![],
                },
                status: None,
            };
            match tenant.create(&tenant_kyma).await {
                Ok(_) => info!("Created tenant Kyma"),
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e),
            }
        }

        let (_, started) = self.registry.get_or_create(runtime_id, || {
            TenantManagerHandle::spawn(runtime_id, self.loops.new_loop(runtime_id, tenant.clone()))
        });
        if started {
            info!("Tenant loop started");
        }

        let ready = kyma.state() == Some(KymaState::Ready)
            && kyma.status.as_ref().is_some_and(|s| s.conditions.is_empty());
        if !ready {
            let status = kyma.status.get_or_insert_with(KymaStatus::default);
            status.state = Some(KymaState::Ready);
            status.conditions.clear();
            self.kcp.patch_status(&*kyma).await?;
        }
        Ok(ReconcileOutcome::Done)
    }

    async fn ensure_namespace(&self, tenant: &Store, name: &str) -> Result<()> {
        let existing: Option<Namespace> = tenant.get(None, name).await?;
        if existing.is_some() {
            return Ok(());
        }
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match tenant.create(&namespace).await {
            Err(e) if e.is_already_exists() => Ok(()),
            other => other.map(|_| ()),
        }
    }
}
