//! Kyma and CloudResources Custom Resource Definitions
//!
//! Kyma is the module manifest. One copy lives in the control plane and one
//! in the tenant cluster; the tenant copy's spec is authoritative.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, KymaState};

/// Name of the default CloudResources object in a tenant cluster
pub const DEFAULT_CLOUD_RESOURCES_NAME: &str = "default";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "operator.kyma-project.io",
    version = "v1beta2",
    kind = "Kyma",
    namespaced,
    status = "KymaStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KymaSpec {
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub modules: Vec<Module>,
}

/// A declared module
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

/// An observed module
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleStatus {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub state: KymaState,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KymaStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<KymaState>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub modules: Vec<ModuleStatus>,
}

impl Kyma {
    pub fn state(&self) -> Option<KymaState> {
        self.status.as_ref().and_then(|s| s.state)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == Some(KymaState::Ready)
    }
}

/// Module kind installed in tenant clusters alongside Kyma
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "cloud-resources.kyma-project.io",
    version = "v1beta1",
    kind = "CloudResources",
    namespaced,
    status = "CloudResourcesStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct CloudResourcesSpec {}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloudResourcesStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}
