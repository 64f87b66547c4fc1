//! kube-runtime wiring for the three control-plane controllers
//!
//! Each controller watches its primary kind in the KCP namespace plus the
//! dependents that should wake it up. Distinct keys are reconciled
//! concurrently; one key is never reconciled twice at the same time.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::{
    api::Api,
    client::Client,
    runtime::{
        controller::{Action, Controller},
        reflector::ObjectRef,
        watcher::Config,
    },
    Resource, ResourceExt,
};
use tracing::{debug, error, info, instrument};

use super::credential::CredentialController;
use super::runtime::RuntimeOrchestrator;
use super::tenant::TenantSupervisor;
use crate::config::SimConfig;
use crate::crd::{GardenerCluster, Kyma, Runtime};
use crate::error::{Error, Result};
use crate::store::ObjectKey;

/// Shared state for the controllers
pub struct ControllerState {
    pub client: Client,
    pub config: Arc<SimConfig>,
    pub runtimes: RuntimeOrchestrator,
    pub credentials: CredentialController,
    pub tenants: TenantSupervisor,
}

/// Run all controllers until a shutdown signal arrives
pub async fn run_controllers(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let namespace = state.config.kcp_namespace.clone();
    let runtimes: Api<Runtime> = Api::namespaced(client.clone(), &namespace);
    let credentials: Api<GardenerCluster> = Api::namespaced(client.clone(), &namespace);
    let manifests: Api<Kyma> = Api::namespaced(client.clone(), &namespace);

    // Verify CRDs exist
    for (kind, result) in [
        ("Runtime", runtimes.list(&Default::default()).await.map(|_| ())),
        ("GardenerCluster", credentials.list(&Default::default()).await.map(|_| ())),
        ("Kyma", manifests.list(&Default::default()).await.map(|_| ())),
    ] {
        if let Err(e) = result {
            error!("{} CRD not found. Please install the CRDs first: {:?}", kind, e);
            return Err(Error::ConfigError(format!("{kind} CRD not installed")));
        }
    }
    info!(namespace = %namespace, "Starting KCP controllers");

    let runtime_controller = {
        let ns = namespace.clone();
        let ns2 = namespace.clone();
        Controller::new(runtimes, Config::default())
            .watches(credentials.clone(), Config::default(), move |gc| {
                Some(runtime_ref(&ns, &gc.name_any()))
            })
            .watches(manifests.clone(), Config::default(), move |kyma| {
                Some(runtime_ref(&ns2, &kyma.name_any()))
            })
            .shutdown_on_signal()
            .run(reconcile_runtime, error_policy::<Runtime>, state.clone())
            .for_each(log_result)
    };

    let credential_controller = Controller::new(credentials, Config::default())
        .shutdown_on_signal()
        .run(reconcile_credential, error_policy::<GardenerCluster>, state.clone())
        .for_each(log_result);

    let tenant_controller = Controller::new(manifests, Config::default())
        .shutdown_on_signal()
        .run(reconcile_manifest, error_policy::<Kyma>, state.clone())
        .for_each(log_result);

    futures::join!(runtime_controller, credential_controller, tenant_controller);

    info!("Controllers stopped, stopping tenant loops");
    state.tenants.registry().stop_all().await;
    Ok(())
}

/// The Runtime owning a GardenerCluster or Kyma of the same name
pub(crate) fn runtime_ref(namespace: &str, name: &str) -> ObjectRef<Runtime> {
    ObjectRef::new(name).within(namespace)
}

async fn log_result<T: std::fmt::Debug, E: std::fmt::Debug>(res: std::result::Result<T, E>) {
    match res {
        Ok(obj) => debug!("Reconciled: {:?}", obj),
        Err(e) => error!("Reconcile error: {:?}", e),
    }
}

fn key_of<K: Resource>(obj: &K) -> ObjectKey {
    ObjectKey::of(obj)
}

#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile_runtime(obj: Arc<Runtime>, ctx: Arc<ControllerState>) -> Result<Action> {
    ctx.runtimes.reconcile(&key_of(obj.as_ref())).await.map(Action::from)
}

#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile_credential(
    obj: Arc<GardenerCluster>,
    ctx: Arc<ControllerState>,
) -> Result<Action> {
    ctx.credentials
        .reconcile(&key_of(obj.as_ref()))
        .await
        .map(Action::from)
}

#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile_manifest(obj: Arc<Kyma>, ctx: Arc<ControllerState>) -> Result<Action> {
    ctx.tenants.reconcile(&key_of(obj.as_ref())).await.map(Action::from)
}

/// Backoff after a failed reconcile
pub(crate) fn retry_after(error: &Error) -> Duration {
    if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    }
}

/// Error policy determines how to handle reconciliation errors
fn error_policy<K: ResourceExt>(obj: Arc<K>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    error!("Reconciliation error for {}: {:?}", obj.name_any(), error);
    Action::requeue(retry_after(error))
}
