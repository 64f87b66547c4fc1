//! Tenant-side control loop
//!
//! One loop runs per tenant cluster. It mirrors module changes between the
//! tenant Kyma and its control-plane copy, and releases the tenant Kyma's
//! finalizer once the module resources are gone.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::conditions::{error_condition, same_conditions, REASON_NO_RUNTIME_ID_LABEL};
use super::finalizers::{is_being_deleted, remove_finalizer};
use super::module_sync;
use crate::clock::Clock;
use crate::config::SimConfig;
use crate::crd::{
    CloudResources, CloudResourcesSpec, Kyma, KymaState, KymaStatus,
    DEFAULT_CLOUD_RESOURCES_NAME, DELETION_HOOK_FINALIZER, LABEL_RUNTIME_ID,
};
use crate::error::{Error, Result};
use crate::store::Store;

/// A cancellable background loop bound to one tenant cluster
#[async_trait]
pub trait TenantLoop: Send {
    /// Run until `cancel` fires
    async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<()>;
}

pub trait TenantLoopFactory: Send + Sync {
    fn new_loop(&self, runtime_id: &str, tenant: Store) -> Box<dyn TenantLoop>;
}

/// Creates [`ModuleSyncLoop`]s against one control plane
pub struct ModuleSyncLoopFactory {
    kcp: Store,
    config: Arc<SimConfig>,
    clock: Arc<dyn Clock>,
}

impl ModuleSyncLoopFactory {
    pub fn new(kcp: Store, config: Arc<SimConfig>, clock: Arc<dyn Clock>) -> Self {
        Self { kcp, config, clock }
    }
}

impl TenantLoopFactory for ModuleSyncLoopFactory {
    fn new_loop(&self, runtime_id: &str, tenant: Store) -> Box<dyn TenantLoop> {
        Box::new(ModuleSyncLoop::new(
            runtime_id,
            tenant,
            self.kcp.clone(),
            self.config.clone(),
            self.clock.clone(),
        ))
    }
}

pub struct ModuleSyncLoop {
    runtime_id: String,
    tenant: Store,
    kcp: Store,
    config: Arc<SimConfig>,
    clock: Arc<dyn Clock>,
}

impl ModuleSyncLoop {
    pub fn new(
        runtime_id: &str,
        tenant: Store,
        kcp: Store,
        config: Arc<SimConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            runtime_id: runtime_id.to_string(),
            tenant,
            kcp,
            config,
            clock,
        }
    }

    /// One pass over the tenant Kyma
    pub async fn sync_once(&self) -> Result<()> {
        let namespace = &self.config.tenant_namespace;
        let tenant_kyma: Option<Kyma> = self
            .tenant
            .get_if_registered(Some(namespace), &self.config.tenant_manifest_name)
            .await?;
        let mut tenant_kyma = match tenant_kyma {
            Some(k) => k,
            None => return Ok(()),
        };

        if is_being_deleted(&tenant_kyma) {
            return self.finish_deletion(&mut tenant_kyma).await;
        }

        let runtime_id = match tenant_kyma.labels().get(LABEL_RUNTIME_ID) {
            Some(id) if !id.is_empty() => id.clone(),
            _ => return self.mark_missing_runtime_id(&tenant_kyma).await,
        };

        let mut cp_kyma: Kyma = self
            .kcp
            .get(Some(&self.config.kcp_namespace), &runtime_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("control-plane Kyma {runtime_id}")))?;

        let outcome = module_sync::sync(&mut tenant_kyma, &mut cp_kyma);
        if !outcome.removed().is_empty() {
            info!(removed = ?outcome.removed(), "Modules removed");
        }

        let tenant_status = tenant_kyma.status.get_or_insert_with(KymaStatus::default);
        let tenant_ready =
            tenant_status.state == Some(KymaState::Ready) && tenant_status.conditions.is_empty();
        if outcome.tenant.status_changed || !tenant_ready {
            tenant_status.state = Some(KymaState::Ready);
            tenant_status.conditions.clear();
            debug!("Patching tenant Kyma status");
            self.tenant.patch_status(&tenant_kyma).await?;
        }
        if outcome.control_plane.spec_changed {
            debug!("Updating control-plane Kyma spec.modules");
            self.kcp.update(&cp_kyma).await?;
        }
        if outcome.control_plane.status_changed {
            debug!("Patching control-plane Kyma status.modules");
            self.kcp.patch_status(&cp_kyma).await?;
        }

        self.ensure_cloud_resources().await
    }

    async fn finish_deletion(&self, tenant_kyma: &mut Kyma) -> Result<()> {
        let namespace = &self.config.tenant_namespace;
        let cloud_resources: Option<CloudResources> = self
            .tenant
            .get_if_registered(Some(namespace), DEFAULT_CLOUD_RESOURCES_NAME)
            .await?;
        match cloud_resources {
            Some(cr) if !is_being_deleted(&cr) => {
                info!("Deleting default CloudResources");
                self.tenant
                    .delete_if_exists::<CloudResources>(Some(namespace), DEFAULT_CLOUD_RESOURCES_NAME)
                    .await
            }
            Some(_) => {
                debug!("Waiting for CloudResources to be deleted");
                Ok(())
            }
            None => {
                remove_finalizer(&self.tenant, tenant_kyma, DELETION_HOOK_FINALIZER).await?;
                Ok(())
            }
        }
    }

    async fn mark_missing_runtime_id(&self, tenant_kyma: &Kyma) -> Result<()> {
        let current = tenant_kyma.status.clone().unwrap_or_default();
        let desired = KymaStatus {
            state: Some(KymaState::Error),
            conditions: vec![error_condition(
                REASON_NO_RUNTIME_ID_LABEL,
                "Missing runtime ID label",
                self.clock.now(),
            )
            .with_observed_generation(tenant_kyma.metadata.generation)],
            modules: current.modules.clone(),
        };
        if current.state == desired.state
            && same_conditions(&current.conditions, &desired.conditions)
        {
            return Ok(());
        }
        warn!("Tenant Kyma has no {} label", LABEL_RUNTIME_ID);
        let mut kyma = tenant_kyma.clone();
        kyma.status = Some(desired);
        self.tenant.patch_status(&kyma).await?;
        Ok(())
    }

    async fn ensure_cloud_resources(&self) -> Result<()> {
        let namespace = &self.config.tenant_namespace;
        let existing: Option<CloudResources> = self
            .tenant
            .get(Some(namespace), DEFAULT_CLOUD_RESOURCES_NAME)
            .await?;
        if existing.is_some() {
            return Ok(());
        }
        let cr = CloudResources {
            metadata: ObjectMeta {
                name: Some(DEFAULT_CLOUD_RESOURCES_NAME.to_string()),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            spec: CloudResourcesSpec {},
            status: None,
        };
        info!("Creating default CloudResources");
        match self.tenant.create(&cr).await {
            Err(e) if e.is_already_exists() => Ok(()),
            other => other.map(|_| ()),
        }
    }

    fn interval(&self) -> Duration {
        self.config.tenant_loop_interval()
    }
}

#[async_trait]
impl TenantLoop for ModuleSyncLoop {
    async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<()> {
        info!(runtime = %self.runtime_id, "Tenant loop started");
        loop {
            if let Err(e) = self.sync_once().await {
                warn!(runtime = %self.runtime_id, "Tenant sync failed: {}", e);
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval()) => {}
            }
        }
        info!(runtime = %self.runtime_id, "Tenant loop stopped");
        Ok(())
    }
}
