//! Runtime Custom Resource Definition
//!
//! A Runtime is the top-level request for one managed cluster. The
//! orchestrator walks it through Shoot, GardenerCluster and Kyma creation.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, RuntimeState};

/// Structured validation error for a Runtime's shoot definition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
    pub how_to_fix: String,
}

impl SpecValidationError {
    pub fn new(
        field: impl Into<String>,
        message: impl Into<String>,
        how_to_fix: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            how_to_fix: how_to_fix.into(),
        }
    }
}

impl std::fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "infrastructuremanager.kyma-project.io",
    version = "v1",
    kind = "Runtime",
    namespaced,
    status = "RuntimeStatus",
    shortname = "rt",
    printcolumn = r#"{"name":"Shoot","type":"string","jsonPath":".spec.shoot.name"}"#,
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".spec.shoot.provider.type"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    pub shoot: RuntimeShoot,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeShoot {
    pub name: String,
    #[serde(default)]
    pub purpose: String,
    pub region: String,
    pub provider: RuntimeProvider,
    pub networking: RuntimeNetworking,
    #[serde(default)]
    pub kubernetes: RuntimeKubernetes,
    #[serde(default)]
    pub secret_binding_name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeProvider {
    /// One of aws, azure, gcp, openstack
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub workers: Vec<Worker>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    pub name: String,
    #[serde(default)]
    pub machine_type: String,
    #[serde(default)]
    pub minimum: i32,
    #[serde(default)]
    pub maximum: i32,
    #[serde(default)]
    pub zones: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeNetworking {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    pub nodes: String,
    pub pods: String,
    pub services: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeKubernetes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<RuntimeState>,
    #[serde(default)]
    pub provisioning_completed: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Runtime {
    pub fn state(&self) -> Option<RuntimeState> {
        self.status.as_ref().and_then(|s| s.state)
    }

    pub fn provisioning_completed(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.provisioning_completed)
            .unwrap_or(false)
    }
}
