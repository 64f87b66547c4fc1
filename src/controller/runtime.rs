//! Runtime lifecycle orchestration
//!
//! Provisioning walks Shoot → GardenerCluster → Kyma, each step gated on the
//! previous one being ready. Teardown runs in reverse and the Runtime
//! finalizer goes last.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::conditions::{
    error_condition, same_conditions, set_condition, CONDITION_STATUS_FALSE,
    CONDITION_TYPE_PROVISIONED, REASON_CREATION_ERROR, REASON_SHOOT_ERROR,
};
use super::finalizers::{add_finalizer, is_being_deleted, remove_finalizer};
use super::shoot_builder::ShootBuilder;
use super::ReconcileOutcome;
use crate::clock::Clock;
use crate::config::SimConfig;
use crate::crd::{
    kubeconfig_secret_name, Condition, GardenerCluster, GardenerClusterSpec, KubeconfigRef, Kyma,
    KymaSpec, Runtime, RuntimeState, RuntimeStatus, SecretRef, Shoot, ShootRef,
    ANNOTATION_CONFIRM_DELETION, DEFAULT_CHANNEL, DELETION_HOOK_FINALIZER, KUBECONFIG_SECRET_KEY,
    LABEL_BROKER_PLAN_NAME, LABEL_DO_NOT_RECONCILE, LABEL_GLOBAL_ACCOUNT_ID, LABEL_PROVIDER,
    LABEL_REGION, LABEL_RUNTIME_ID, LABEL_SHOOT_NAME, LABEL_SUBACCOUNT_ID, RUNTIME_FINALIZER,
};
use crate::error::Result;
use crate::store::{ObjectKey, Store};

const FINALIZER_ADDED_REQUEUE: Duration = Duration::from_secs(1);
const SHOOT_CREATED_REQUEUE: Duration = Duration::from_secs(30);
const SHOOT_ERROR_REQUEUE: Duration = Duration::from_secs(10);
const DEPENDENCY_POLL: Duration = Duration::from_secs(5);
const TEARDOWN_POLL: Duration = Duration::from_secs(10);

/// How long a deleting Kyma may hold up teardown
pub const MANIFEST_DELETION_GRACE: Duration = Duration::from_secs(60);

/// Labels copied from a Runtime to its GardenerCluster
const SCOPE_LABELS: [&str; 6] = [
    LABEL_GLOBAL_ACCOUNT_ID,
    LABEL_SUBACCOUNT_ID,
    LABEL_REGION,
    LABEL_BROKER_PLAN_NAME,
    LABEL_PROVIDER,
    LABEL_RUNTIME_ID,
];

/// Dependent objects of one Runtime as observed at the start of a pass
struct Dependents {
    shoot: Option<Shoot>,
    credential: Option<GardenerCluster>,
    manifest: Option<Kyma>,
}

pub struct RuntimeOrchestrator {
    kcp: Store,
    garden: Store,
    builder: Arc<dyn ShootBuilder>,
    clock: Arc<dyn Clock>,
    config: Arc<SimConfig>,
}

impl RuntimeOrchestrator {
    pub fn new(
        kcp: Store,
        garden: Store,
        builder: Arc<dyn ShootBuilder>,
        clock: Arc<dyn Clock>,
        config: Arc<SimConfig>,
    ) -> Self {
        Self {
            kcp,
            garden,
            builder,
            clock,
            config,
        }
    }

    #[instrument(skip(self), fields(runtime = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let runtime: Option<Runtime> = self
            .kcp
            .get(key.namespace.as_deref(), &key.name)
            .await?;
        let mut runtime = match runtime {
            Some(rt) => rt,
            None => return Ok(ReconcileOutcome::Done),
        };
        if runtime.labels().contains_key(LABEL_DO_NOT_RECONCILE) {
            debug!("Skipping Runtime marked do-not-reconcile");
            return Ok(ReconcileOutcome::Done);
        }

        let dependents = self.load_dependents(&runtime).await?;
        if is_being_deleted(&runtime) {
            self.reconcile_deletion(&mut runtime, dependents).await
        } else {
            self.reconcile_creation(&mut runtime, dependents).await
        }
    }

    async fn load_dependents(&self, runtime: &Runtime) -> Result<Dependents> {
        let namespace = runtime.namespace();
        let name = runtime.name_any();
        Ok(Dependents {
            shoot: self
                .garden
                .get(Some(&self.config.garden_namespace), &runtime.spec.shoot.name)
                .await?,
            credential: self.kcp.get(namespace.as_deref(), &name).await?,
            manifest: self.kcp.get(namespace.as_deref(), &name).await?,
        })
    }

    async fn reconcile_deletion(
        &self,
        runtime: &mut Runtime,
        dependents: Dependents,
    ) -> Result<ReconcileOutcome> {
        let namespace = runtime.namespace();
        let name = runtime.name_any();

        if let Some(manifest) = &dependents.manifest {
            match &manifest.metadata.deletion_timestamp {
                None => {
                    info!("Deleting Kyma");
                    self.kcp
                        .delete_if_exists::<Kyma>(namespace.as_deref(), &name)
                        .await?;
                    return Ok(ReconcileOutcome::RequeueAfter(DEPENDENCY_POLL));
                }
                Some(since) => {
                    let waited = (self.clock.now() - since.0).to_std().unwrap_or_default();
                    if waited < MANIFEST_DELETION_GRACE {
                        debug!("Waiting for Kyma to be deleted");
                        return Ok(ReconcileOutcome::RequeueAfter(DEPENDENCY_POLL));
                    }
                    warn!(
                        "Kyma still present {}s after deletion, continuing teardown",
                        waited.as_secs()
                    );
                }
            }
        }

        if let Some(shoot) = &dependents.shoot {
            if !is_being_deleted(shoot) {
                self.delete_shoot(shoot.clone()).await?;
            }
        }
        if let Some(credential) = &dependents.credential {
            if !is_being_deleted(credential) {
                info!("Deleting GardenerCluster");
                self.kcp
                    .delete_if_exists::<GardenerCluster>(namespace.as_deref(), &name)
                    .await?;
            }
        }
        if dependents.shoot.is_some() || dependents.credential.is_some() {
            debug!("Waiting for Shoot and GardenerCluster to be deleted");
            return Ok(ReconcileOutcome::RequeueAfter(TEARDOWN_POLL));
        }

        remove_finalizer(&self.kcp, runtime, RUNTIME_FINALIZER).await?;
        info!("Runtime deprovisioned");
        Ok(ReconcileOutcome::Done)
    }

    async fn delete_shoot(&self, mut shoot: Shoot) -> Result<()> {
        if shoot.annotations().get(ANNOTATION_CONFIRM_DELETION).map(String::as_str) != Some("true")
        {
            shoot
                .annotations_mut()
                .insert(ANNOTATION_CONFIRM_DELETION.to_string(), "true".to_string());
            self.garden.update(&shoot).await?;
        }
        info!(shoot = %shoot.name_any(), "Deleting Shoot");
        self.garden
            .delete_if_exists::<Shoot>(shoot.namespace().as_deref(), &shoot.name_any())
            .await
    }

    async fn reconcile_creation(
        &self,
        runtime: &mut Runtime,
        dependents: Dependents,
    ) -> Result<ReconcileOutcome> {
        if add_finalizer(&self.kcp, runtime, RUNTIME_FINALIZER).await? {
            return Ok(ReconcileOutcome::RequeueAfter(FINALIZER_ADDED_REQUEUE));
        }

        let shoot = match dependents.shoot {
            Some(shoot) => shoot,
            None => return self.create_shoot(runtime).await,
        };

        if let Some(last_error) = shoot.first_error() {
            let description = last_error.description.clone();
            warn!(shoot = %shoot.name_any(), "Shoot reports error: {}", description);
            self.set_status(
                runtime,
                RuntimeState::Failed,
                false,
                vec![error_condition(
                    REASON_SHOOT_ERROR,
                    &description,
                    self.clock.now(),
                )],
            )
            .await?;
            return Ok(ReconcileOutcome::RequeueAfter(SHOOT_ERROR_REQUEUE));
        }
        if matches!(runtime.state(), None | Some(RuntimeState::Failed)) {
            info!("Runtime provisioning in progress");
            self.set_status(runtime, RuntimeState::Pending, false, vec![])
                .await?;
            return Ok(ReconcileOutcome::RequeueAfter(FINALIZER_ADDED_REQUEUE));
        }
        if !shoot.is_ready() {
            debug!(shoot = %shoot.name_any(), "Waiting for Shoot to become ready");
            return Ok(ReconcileOutcome::RequeueAfter(DEPENDENCY_POLL));
        }

        let credential = match dependents.credential {
            Some(gc) => gc,
            None => self.create_credential(runtime).await?,
        };
        if !credential.is_ready() {
            debug!("Waiting for GardenerCluster to become ready");
            return Ok(ReconcileOutcome::RequeueAfter(DEPENDENCY_POLL));
        }

        let manifest = match dependents.manifest {
            Some(kyma) => kyma,
            None => self.create_manifest(runtime).await?,
        };
        if !manifest.is_ready() {
            debug!("Waiting for Kyma to become ready");
            return Ok(ReconcileOutcome::RequeueAfter(DEPENDENCY_POLL));
        }

        let was_ready = runtime.state() == Some(RuntimeState::Ready);
        if self
            .set_status(runtime, RuntimeState::Ready, true, vec![])
            .await?
            && !was_ready
        {
            info!("Runtime provisioned");
        }
        Ok(ReconcileOutcome::Done)
    }

    async fn create_shoot(&self, runtime: &mut Runtime) -> Result<ReconcileOutcome> {
        let shoot = match self.builder.build(runtime) {
            Ok(shoot) => shoot,
            Err(errors) => {
                let message = format!(
                    "Shoot validation error: {}",
                    errors
                        .iter()
                        .map(|e| e.to_string())
                        .collect::<Vec<_>>()
                        .join("; ")
                );
                warn!("{}", message);
                self.mark_build_failure(runtime, &message).await?;
                return Ok(ReconcileOutcome::Done);
            }
        };

        match self.garden.create(&shoot).await {
            Ok(created) => {
                info!(shoot = %created.name_any(), "Shoot created");
                Ok(ReconcileOutcome::RequeueAfter(SHOOT_CREATED_REQUEUE))
            }
            Err(e) if e.is_already_exists() => {
                Ok(ReconcileOutcome::RequeueAfter(FINALIZER_ADDED_REQUEUE))
            }
            Err(e) => Err(e),
        }
    }

    /// Terminal until the Runtime spec is corrected
    async fn mark_build_failure(&self, runtime: &mut Runtime, message: &str) -> Result<()> {
        let mut conditions = runtime
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default();
        set_condition(
            &mut conditions,
            CONDITION_TYPE_PROVISIONED,
            CONDITION_STATUS_FALSE,
            REASON_CREATION_ERROR,
            message,
            runtime.metadata.generation,
            self.clock.now(),
        );
        self.set_status(runtime, RuntimeState::Error, false, conditions)
            .await?;
        Ok(())
    }

    async fn create_credential(&self, runtime: &Runtime) -> Result<GardenerCluster> {
        let name = runtime.name_any();
        let namespace = runtime
            .namespace()
            .unwrap_or_else(|| self.config.kcp_namespace.clone());

        let mut labels: BTreeMap<String, String> = SCOPE_LABELS
            .iter()
            .filter_map(|l| runtime.labels().get(*l).map(|v| (l.to_string(), v.clone())))
            .collect();
        labels.insert(LABEL_RUNTIME_ID.to_string(), name.clone());
        labels.insert(
            LABEL_SHOOT_NAME.to_string(),
            runtime.spec.shoot.name.clone(),
        );

        let gc = GardenerCluster {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: GardenerClusterSpec {
                shoot: ShootRef {
                    name: runtime.spec.shoot.name.clone(),
                },
                kubeconfig: KubeconfigRef {
                    secret: SecretRef {
                        name: kubeconfig_secret_name(&name),
                        namespace,
                        key: KUBECONFIG_SECRET_KEY.to_string(),
                    },
                },
            },
            status: None,
        };
        let created = self.kcp.create(&gc).await?;
        info!("GardenerCluster created");
        Ok(created)
    }

    async fn create_manifest(&self, runtime: &Runtime) -> Result<Kyma> {
        let name = runtime.name_any();
        let mut labels = runtime.labels().clone();
        labels.insert(LABEL_RUNTIME_ID.to_string(), name.clone());

        let kyma = Kyma {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: runtime.namespace(),
                labels: Some(labels),
                finalizers: Some(vec![DELETION_HOOK_FINALIZER.to_string()]),
                ..Default::default()
            },
            spec: KymaSpec {
                channel: DEFAULT_CHANNEL.to_string(),
                modules: vec![],
            },
            status: None,
        };
        let created = self.kcp.create(&kyma).await?;
        info!("Kyma created");
        Ok(created)
    }

    /// Write the Runtime status if it differs. Returns whether it was written.
    async fn set_status(
        &self,
        runtime: &mut Runtime,
        state: RuntimeState,
        provisioning_completed: bool,
        conditions: Vec<Condition>,
    ) -> Result<bool> {
        let current = runtime.status.clone().unwrap_or_default();
        if current.state == Some(state)
            && current.provisioning_completed == provisioning_completed
            && same_conditions(&current.conditions, &conditions)
        {
            return Ok(false);
        }
        runtime.status = Some(RuntimeStatus {
            state: Some(state),
            provisioning_completed,
            conditions,
        });
        *runtime = self.kcp.patch_status(&*runtime).await?;
        Ok(true)
    }
}
