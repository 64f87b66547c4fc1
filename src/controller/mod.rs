//! Controllers of the simulated control plane
//!
//! Each controller exposes a `reconcile(&ObjectKey)` that is independent of
//! kube-runtime, so tests can drive it step by step against a `MemoryStore`.
//! `reconciler` wires them into `kube::runtime::Controller` for a live cluster.

pub mod conditions;
pub mod credential;
pub mod finalizers;
pub mod module_sync;
mod reconciler;
#[cfg(test)]
mod reconciler_test;
pub mod runtime;
pub mod shoot_builder;
pub mod tenant;
pub mod tenant_loop;
#[cfg(test)]
mod tenant_test;

use std::time::Duration;

use kube::runtime::controller::Action;

pub use credential::{
    evaluate_rotation, CredentialController, CredentialIssuer, GardenCredentialIssuer,
    SimulatedCredentialIssuer,
};
pub use module_sync::{sync, SyncOutcome};
pub use reconciler::{run_controllers, ControllerState};
pub use runtime::RuntimeOrchestrator;
pub use shoot_builder::{DefaultShootBuilder, ShootBuilder};
pub use tenant::{
    ApplyCrdInstaller, ClusterResolver, CrdInstaller, KubeconfigClusterResolver,
    SimulatedClusterResolver, TenantManagerHandle, TenantManagerRegistry, TenantSupervisor,
};
pub use tenant_loop::{ModuleSyncLoop, ModuleSyncLoopFactory, TenantLoop, TenantLoopFactory};

/// What the work queue should do with a key after a reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing left to do until the object changes
    Done,
    RequeueAfter(Duration),
}

impl From<ReconcileOutcome> for Action {
    fn from(outcome: ReconcileOutcome) -> Self {
        match outcome {
            ReconcileOutcome::Done => Action::await_change(),
            ReconcileOutcome::RequeueAfter(after) => Action::requeue(after),
        }
    }
}
