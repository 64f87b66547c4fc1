//! Shoot Custom Resource Definition
//!
//! The subset of the Gardener Shoot the simulator reads and writes.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::runtime::Worker;
use super::types::Condition;

/// Condition types a Shoot must report as "True" before it counts as ready
pub const SHOOT_READY_CONDITIONS: [&str; 4] = [
    "ControlPlaneHealthy",
    "APIServerAvailable",
    "EveryNodeReady",
    "SystemComponentsHealthy",
];

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "core.gardener.cloud",
    version = "v1beta1",
    kind = "Shoot",
    namespaced,
    status = "ShootStatus",
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".spec.provider.type"}"#,
    printcolumn = r#"{"name":"Region","type":"string","jsonPath":".spec.region"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ShootSpec {
    pub cloud_profile_name: String,
    pub kubernetes: ShootKubernetes,
    pub networking: ShootNetworking,
    pub provider: ShootProvider,
    pub region: String,
    #[serde(default)]
    pub secret_binding_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShootKubernetes {
    pub version: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShootNetworking {
    #[serde(rename = "type")]
    pub type_: String,
    pub nodes: String,
    pub pods: String,
    pub services: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShootProvider {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub workers: Vec<Worker>,
    /// Provider-specific infrastructure config (raw extension)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub infrastructure_config: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShootStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub last_errors: Vec<LastError>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    pub description: String,
}

impl Shoot {
    /// All four readiness conditions are present and "True"
    pub fn is_ready(&self) -> bool {
        let conditions = match &self.status {
            Some(status) if !status.conditions.is_empty() => &status.conditions,
            _ => return false,
        };
        SHOOT_READY_CONDITIONS.iter().all(|type_| {
            conditions
                .iter()
                .any(|c| c.type_ == *type_ && c.is_true())
        })
    }

    /// First reported provisioning error, if any
    pub fn first_error(&self) -> Option<&LastError> {
        self.status.as_ref().and_then(|s| s.last_errors.first())
    }
}
