//! GardenerCluster Custom Resource Definition
//!
//! Links a Runtime to the secret holding its admin kubeconfig. The credential
//! controller keeps that secret valid and records the expiry in an annotation.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, CredentialState};

pub const KUBECONFIG_SECRET_KEY: &str = "config";

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "infrastructuremanager.kyma-project.io",
    version = "v1",
    kind = "GardenerCluster",
    namespaced,
    status = "GardenerClusterStatus",
    shortname = "gc",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GardenerClusterSpec {
    pub shoot: ShootRef,
    pub kubeconfig: KubeconfigRef,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShootRef {
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeconfigRef {
    pub secret: SecretRef,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    pub name: String,
    pub namespace: String,
    pub key: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GardenerClusterStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<CredentialState>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl GardenerCluster {
    pub fn state(&self) -> Option<CredentialState> {
        self.status.as_ref().and_then(|s| s.state)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == Some(CredentialState::Ready)
    }
}

/// Name of the kubeconfig secret for a runtime
pub fn kubeconfig_secret_name(runtime_id: &str) -> String {
    format!("kubeconfig-{runtime_id}")
}
