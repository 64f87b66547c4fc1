//! Custom Resource Definitions for the control-plane simulator
//!
//! This module defines the resource graph a Runtime drives:
//! Runtime → Shoot → GardenerCluster → Kyma.

mod gardener_cluster;
mod kyma;
mod runtime;
mod shoot;
pub mod types;


use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

pub use gardener_cluster::{
    kubeconfig_secret_name, GardenerCluster, GardenerClusterSpec, GardenerClusterStatus,
    KubeconfigRef, SecretRef, ShootRef, KUBECONFIG_SECRET_KEY,
};
pub use kyma::{
    CloudResources, CloudResourcesSpec, CloudResourcesStatus, Kyma, KymaSpec, KymaStatus, Module,
    ModuleStatus, DEFAULT_CLOUD_RESOURCES_NAME,
};
pub use runtime::{
    Runtime, RuntimeKubernetes, RuntimeNetworking, RuntimeProvider, RuntimeShoot, RuntimeSpec,
    RuntimeStatus, SpecValidationError, Worker,
};
pub use shoot::{
    LastError, Shoot, ShootKubernetes, ShootNetworking, ShootProvider, ShootSpec, ShootStatus,
    SHOOT_READY_CONDITIONS,
};
pub use types::*;

/// CRDs served by the control plane (KCP)
pub fn kcp_crds() -> Vec<CustomResourceDefinition> {
    vec![Runtime::crd(), GardenerCluster::crd(), Kyma::crd()]
}

/// CRDs served by the Garden cluster
pub fn garden_crds() -> Vec<CustomResourceDefinition> {
    vec![Shoot::crd()]
}

/// CRDs a tenant cluster needs before the mirrored Kyma can be created
pub fn tenant_crds() -> Vec<CustomResourceDefinition> {
    vec![Kyma::crd(), CloudResources::crd()]
}
