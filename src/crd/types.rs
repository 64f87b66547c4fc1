//! Shared types for the simulator CRDs
//!
//! Labels, annotations and finalizers used across the Runtime resource graph,
//! plus the condition and state types every status carries.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// Scope labels carried from the broker request through every dependent object
pub const LABEL_RUNTIME_ID: &str = "kyma-project.io/runtime-id";
pub const LABEL_GLOBAL_ACCOUNT_ID: &str = "kyma-project.io/global-account-id";
pub const LABEL_SUBACCOUNT_ID: &str = "kyma-project.io/subaccount-id";
pub const LABEL_SHOOT_NAME: &str = "kyma-project.io/shoot-name";
pub const LABEL_REGION: &str = "kyma-project.io/region";
pub const LABEL_BROKER_PLAN_NAME: &str = "kyma-project.io/broker-plan-name";
pub const LABEL_PROVIDER: &str = "kyma-project.io/provider";
pub const LABEL_ALIAS: &str = "e2e.kyma-project.io/alias";

/// Objects carrying this label are skipped by every reconciler
pub const LABEL_DO_NOT_RECONCILE: &str = "e2e.kyma-project.io/do-not-reconcile";

pub const ANNOTATION_EXPIRES_AT: &str = "operator.kyma-project.io/expires-at";
pub const ANNOTATION_FORCE_ROTATION: &str = "operator.kyma-project.io/force-kubeconfig-rotation";
pub const ANNOTATION_CONFIRM_DELETION: &str = "confirmation.gardener.cloud/deletion";

pub const RUNTIME_FINALIZER: &str =
    "runtime-controller.infrastructure-manager.kyma-project.io/deletion-hook";
pub const DELETION_HOOK_FINALIZER: &str = "cloud-manager.kyma-project.io/deletion-hook";

pub const DEFAULT_CHANNEL: &str = "regular";

/// Condition on any of the simulator resources
///
/// Follows the Kubernetes convention: type/status/reason/message plus the
/// time of the last status transition.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready", "Error", "ControlPlaneHealthy")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned (RFC3339)
    #[serde(default)]
    pub last_transition_time: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    pub fn new(type_: &str, status: bool, reason: &str, message: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: None,
        }
    }

    pub fn with_observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Runtime `status.state`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum RuntimeState {
    Pending,
    Ready,
    Failed,
    Error,
}

/// GardenerCluster `status.state`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum CredentialState {
    Ready,
    Error,
}

/// State shared by Kyma and its module entries
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum KymaState {
    Ready,
    Processing,
    Error,
    Deleting,
    Warning,
}

/// The fixed provider set a shoot can be built for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Provider {
    Aws,
    Azure,
    Gcp,
    Openstack,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::Aws,
        Provider::Azure,
        Provider::Gcp,
        Provider::Openstack,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Aws => "aws",
            Provider::Azure => "azure",
            Provider::Gcp => "gcp",
            Provider::Openstack => "openstack",
        }
    }

    pub fn default_region(&self) -> &'static str {
        match self {
            Provider::Aws => "eu-central-1",
            Provider::Azure => "westeurope",
            Provider::Gcp => "europe-west1",
            Provider::Openstack => "eu-de-1",
        }
    }

    /// Zones for the single worker pool created in `region`
    pub fn default_zones(&self, region: &str) -> Vec<String> {
        match self {
            Provider::Aws | Provider::Openstack => vec![format!("{region}a")],
            Provider::Gcp => vec![format!("{region}-b")],
            Provider::Azure => vec!["1".to_string()],
        }
    }

    pub fn default_machine_type(&self) -> &'static str {
        match self {
            Provider::Aws => "m6i.large",
            Provider::Azure => "Standard_D2s_v5",
            Provider::Gcp => "n2-standard-2",
            Provider::Openstack => "g_c2_m8",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aws" => Ok(Provider::Aws),
            "azure" => Ok(Provider::Azure),
            "gcp" => Ok(Provider::Gcp),
            "openstack" => Ok(Provider::Openstack),
            other => Err(format!("unsupported provider {other:?}")),
        }
    }
}
