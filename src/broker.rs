//! Simulated service broker
//!
//! Stands in for the component that turns "give me a cluster" requests into
//! Runtime objects. Instances are identified by their runtime id and can be
//! looked up by a human-friendly alias.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use kube::api::ObjectMeta;
use kube::ResourceExt;
use rand::Rng;
use serde::Serialize;
use tracing::info;

use crate::config::SimConfig;
use crate::controller::conditions::{find_condition, CONDITION_STATUS_TRUE, CONDITION_TYPE_ERROR};
use crate::crd::{
    Provider, Runtime, RuntimeKubernetes, RuntimeNetworking, RuntimeProvider, RuntimeShoot,
    RuntimeSpec, RuntimeState, Worker, LABEL_ALIAS, LABEL_BROKER_PLAN_NAME,
    LABEL_GLOBAL_ACCOUNT_ID, LABEL_PROVIDER, LABEL_REGION, LABEL_RUNTIME_ID, LABEL_SHOOT_NAME,
    LABEL_SUBACCOUNT_ID, RUNTIME_FINALIZER,
};
use crate::error::{Error, Result};
use crate::store::Store;

pub const DEFAULT_NODES_RANGE: &str = "10.250.0.0/16";
pub const DEFAULT_PODS_RANGE: &str = "10.96.0.0/13";
pub const DEFAULT_SERVICES_RANGE: &str = "10.104.0.0/13";

const WORKER_NAME: &str = "cpu-worker-0";
const WORKER_MINIMUM: i32 = 3;
const WORKER_MAXIMUM: i32 = 20;

/// A request for a new instance. Unset fields get defaults.
#[derive(Clone, Debug)]
pub struct InstanceRequest {
    pub alias: String,
    pub provider: Provider,
    pub region: Option<String>,
    pub global_account: Option<String>,
    pub subaccount: Option<String>,
    pub nodes_range: Option<String>,
    pub pods_range: Option<String>,
    pub services_range: Option<String>,
}

impl InstanceRequest {
    pub fn new(alias: &str, provider: Provider) -> Self {
        Self {
            alias: alias.to_string(),
            provider,
            region: None,
            global_account: None,
            subaccount: None,
            nodes_range: None,
            pods_range: None,
            services_range: None,
        }
    }

    pub fn with_region(mut self, region: &str) -> Self {
        self.region = Some(region.to_string());
        self
    }

    pub fn with_global_account(mut self, id: &str) -> Self {
        self.global_account = Some(id.to_string());
        self
    }

    pub fn with_subaccount(mut self, id: &str) -> Self {
        self.subaccount = Some(id.to_string());
        self
    }

    fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.alias.trim().is_empty() {
            problems.push("alias required".to_string());
        }
        let blank = |v: &Option<String>| v.as_deref().is_some_and(|s| s.trim().is_empty());
        if blank(&self.global_account) {
            problems.push("global account required".to_string());
        }
        if blank(&self.subaccount) {
            problems.push("subaccount required".to_string());
        }
        if blank(&self.region) {
            problems.push("region required".to_string());
        }
        problems
    }
}

/// Label filter for listing. Empty matches everything.
#[derive(Clone, Debug, Default)]
pub struct InstanceFilter {
    pub alias: Option<String>,
    pub global_account: Option<String>,
    pub subaccount: Option<String>,
    pub provider: Option<Provider>,
}

impl InstanceFilter {
    pub fn alias(alias: &str) -> Self {
        Self {
            alias: Some(alias.to_string()),
            ..Default::default()
        }
    }

    fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        if let Some(alias) = &self.alias {
            labels.insert(LABEL_ALIAS.to_string(), alias.clone());
        }
        if let Some(ga) = &self.global_account {
            labels.insert(LABEL_GLOBAL_ACCOUNT_ID.to_string(), ga.clone());
        }
        if let Some(sa) = &self.subaccount {
            labels.insert(LABEL_SUBACCOUNT_ID.to_string(), sa.clone());
        }
        if let Some(provider) = &self.provider {
            labels.insert(LABEL_BROKER_PLAN_NAME.to_string(), provider.to_string());
        }
        labels
    }
}

/// What the broker reports about an instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDetails {
    pub alias: String,
    pub global_account: String,
    pub subaccount: String,
    pub provider: String,
    pub region: String,
    pub runtime_id: String,
    pub shoot_name: String,
    pub state: Option<RuntimeState>,
    /// Message of a true `Error` condition, if any
    pub message: Option<String>,
    pub provisioning_completed: bool,
    pub being_deleted: bool,
}

impl From<&Runtime> for InstanceDetails {
    fn from(rt: &Runtime) -> Self {
        let label = |key: &str| rt.labels().get(key).cloned().unwrap_or_default();
        let message = rt.status.as_ref().and_then(|s| {
            find_condition(&s.conditions, CONDITION_TYPE_ERROR)
                .filter(|c| c.status == CONDITION_STATUS_TRUE)
                .map(|c| c.message.clone())
        });
        Self {
            alias: label(LABEL_ALIAS),
            global_account: label(LABEL_GLOBAL_ACCOUNT_ID),
            subaccount: label(LABEL_SUBACCOUNT_ID),
            provider: rt.spec.shoot.provider.type_.clone(),
            region: rt.spec.shoot.region.clone(),
            runtime_id: rt.name_any(),
            shoot_name: rt.spec.shoot.name.clone(),
            state: rt.state(),
            message,
            provisioning_completed: rt.provisioning_completed(),
            being_deleted: rt.metadata.deletion_timestamp.is_some(),
        }
    }
}

impl fmt::Display for InstanceDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self
            .state
            .map(|s| format!("{s:?}"))
            .unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.alias, self.runtime_id, self.shoot_name, self.provider, self.region, state
        )?;
        if self.being_deleted {
            write!(f, "\tdeleting")?;
        }
        if let Some(message) = &self.message {
            write!(f, "\t{message}")?;
        }
        Ok(())
    }
}

/// Random id in the textual layout of a version 4 UUID
fn random_id() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "{}-{}-4{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[13..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Shoot names are short: `p-` and seven hex digits
fn random_shoot_name() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..0x1000_0000);
    format!("p-{n:07x}")
}

pub struct Broker {
    kcp: Store,
    config: Arc<SimConfig>,
}

impl Broker {
    pub fn new(kcp: Store, config: Arc<SimConfig>) -> Self {
        Self { kcp, config }
    }

    /// Create the Runtime for a new instance
    pub async fn create_instance(&self, request: InstanceRequest) -> Result<InstanceDetails> {
        let problems = request.validate();
        if !problems.is_empty() {
            return Err(Error::ValidationError(problems.join(", ")));
        }
        if self.config.cloud_profile(request.provider.as_str()).is_none() {
            return Err(Error::ValidationError(format!(
                "no cloud profile configured for provider {}",
                request.provider
            )));
        }
        let existing = self
            .list_instances(&InstanceFilter::alias(&request.alias))
            .await?;
        if !existing.is_empty() {
            return Err(Error::AlreadyExists(format!(
                "instance with alias {:?}",
                request.alias
            )));
        }

        let runtime = self.build_runtime(&request);
        let created = self.kcp.create(&runtime).await?;
        let details = InstanceDetails::from(&created);
        info!(
            alias = %details.alias,
            runtime = %details.runtime_id,
            shoot = %details.shoot_name,
            "Instance requested"
        );
        Ok(details)
    }

    fn build_runtime(&self, request: &InstanceRequest) -> Runtime {
        let provider = request.provider;
        let runtime_id = random_id();
        let shoot_name = random_shoot_name();
        let region = request
            .region
            .clone()
            .unwrap_or_else(|| provider.default_region().to_string());

        let labels = BTreeMap::from([
            (LABEL_RUNTIME_ID.to_string(), runtime_id.clone()),
            (
                LABEL_GLOBAL_ACCOUNT_ID.to_string(),
                request.global_account.clone().unwrap_or_else(random_id),
            ),
            (
                LABEL_SUBACCOUNT_ID.to_string(),
                request.subaccount.clone().unwrap_or_else(random_id),
            ),
            (LABEL_SHOOT_NAME.to_string(), shoot_name.clone()),
            (LABEL_BROKER_PLAN_NAME.to_string(), provider.to_string()),
            (
                LABEL_PROVIDER.to_string(),
                provider.as_str().to_ascii_uppercase(),
            ),
            (LABEL_REGION.to_string(), region.clone()),
            (LABEL_ALIAS.to_string(), request.alias.clone()),
        ]);

        Runtime {
            metadata: ObjectMeta {
                name: Some(runtime_id),
                namespace: Some(self.config.kcp_namespace.clone()),
                labels: Some(labels),
                finalizers: Some(vec![RUNTIME_FINALIZER.to_string()]),
                ..Default::default()
            },
            spec: RuntimeSpec {
                shoot: RuntimeShoot {
                    name: shoot_name,
                    purpose: "test".to_string(),
                    provider: RuntimeProvider {
                        type_: provider.to_string(),
                        workers: vec![Worker {
                            name: WORKER_NAME.to_string(),
                            machine_type: provider.default_machine_type().to_string(),
                            minimum: WORKER_MINIMUM,
                            maximum: WORKER_MAXIMUM,
                            zones: provider.default_zones(&region),
                        }],
                    },
                    region,
                    networking: RuntimeNetworking {
                        type_: None,
                        nodes: request
                            .nodes_range
                            .clone()
                            .unwrap_or_else(|| DEFAULT_NODES_RANGE.to_string()),
                        pods: request
                            .pods_range
                            .clone()
                            .unwrap_or_else(|| DEFAULT_PODS_RANGE.to_string()),
                        services: request
                            .services_range
                            .clone()
                            .unwrap_or_else(|| DEFAULT_SERVICES_RANGE.to_string()),
                    },
                    kubernetes: RuntimeKubernetes::default(),
                    secret_binding_name: format!("sim-{provider}"),
                },
            },
            status: None,
        }
    }

    pub async fn get_instance(&self, runtime_id: &str) -> Result<Option<InstanceDetails>> {
        let runtime: Option<Runtime> = self
            .kcp
            .get(Some(&self.config.kcp_namespace), runtime_id)
            .await?;
        Ok(runtime.as_ref().map(InstanceDetails::from))
    }

    pub async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<InstanceDetails>> {
        let runtimes: Vec<Runtime> = self
            .kcp
            .list(Some(&self.config.kcp_namespace), &filter.labels())
            .await?;
        Ok(runtimes.iter().map(InstanceDetails::from).collect())
    }

    /// Request deletion. An unknown runtime id is not an error.
    pub async fn delete_instance(&self, runtime_id: &str) -> Result<()> {
        self.kcp
            .delete_if_exists::<Runtime>(Some(&self.config.kcp_namespace), runtime_id)
            .await?;
        info!(runtime = %runtime_id, "Instance deletion requested");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::controller::conditions::error_condition;
    use crate::crd::RuntimeStatus;
    use crate::store::MemoryStore;

    fn broker() -> (Store, Broker) {
        let clock = Arc::new(ManualClock::default());
        let kcp = Store::new(Arc::new(MemoryStore::kcp(clock)));
        let broker = Broker::new(kcp.clone(), Arc::new(SimConfig::default()));
        (kcp, broker)
    }

    #[test]
    fn test_random_names_have_expected_shape() {
        let shoot = random_shoot_name();
        assert_eq!(shoot.len(), 9);
        assert!(shoot.starts_with("p-"));
        assert!(shoot[2..].chars().all(|c| c.is_ascii_hexdigit()));

        let id = random_id();
        assert_eq!(id.len(), 36);
        assert_eq!(id.matches('-').count(), 4);
        assert_ne!(random_id(), id);
    }

    #[tokio::test]
    async fn test_create_instance_builds_labelled_runtime() {
        let (kcp, broker) = broker();

        let details = broker
            .create_instance(InstanceRequest::new("alpha", Provider::Aws).with_global_account("ga-1"))
            .await
            .unwrap();

        assert_eq!(details.alias, "alpha");
        assert_eq!(details.global_account, "ga-1");
        assert_eq!(details.provider, "aws");
        assert_eq!(details.region, "eu-central-1");
        assert!(!details.subaccount.is_empty());
        assert!(!details.provisioning_completed);

        let rt: Runtime = kcp
            .get(Some("kcp-system"), &details.runtime_id)
            .await
            .unwrap()
            .unwrap();
        let labels = rt.labels();
        assert_eq!(labels[LABEL_RUNTIME_ID], details.runtime_id);
        assert_eq!(labels[LABEL_SHOOT_NAME], details.shoot_name);
        assert_eq!(labels[LABEL_BROKER_PLAN_NAME], "aws");
        assert_eq!(labels[LABEL_PROVIDER], "AWS");
        assert_eq!(labels[LABEL_REGION], "eu-central-1");
        assert_eq!(rt.finalizers(), [RUNTIME_FINALIZER.to_string()]);
        assert_eq!(rt.spec.shoot.networking.nodes, DEFAULT_NODES_RANGE);
        assert_eq!(rt.spec.shoot.provider.workers[0].zones, ["eu-central-1a"]);
    }

    #[tokio::test]
    async fn test_duplicate_alias_rejected() {
        let (_, broker) = broker();
        broker
            .create_instance(InstanceRequest::new("alpha", Provider::Gcp))
            .await
            .unwrap();

        let err = broker
            .create_instance(InstanceRequest::new("alpha", Provider::Azure))
            .await
            .unwrap_err();

        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_invalid_request_rejected() {
        let (_, broker) = broker();
        let err = broker
            .create_instance(InstanceRequest::new(" ", Provider::Aws).with_region(""))
            .await
            .unwrap_err();
        match err {
            Error::ValidationError(msg) => {
                assert!(msg.contains("alias required"));
                assert!(msg.contains("region required"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_list_filters_by_labels() {
        let (_, broker) = broker();
        broker
            .create_instance(InstanceRequest::new("a", Provider::Aws).with_global_account("ga-1"))
            .await
            .unwrap();
        broker
            .create_instance(InstanceRequest::new("b", Provider::Gcp).with_global_account("ga-1"))
            .await
            .unwrap();
        broker
            .create_instance(InstanceRequest::new("c", Provider::Gcp).with_global_account("ga-2"))
            .await
            .unwrap();

        assert_eq!(broker.list_instances(&InstanceFilter::default()).await.unwrap().len(), 3);
        let gcp = InstanceFilter {
            provider: Some(Provider::Gcp),
            ..Default::default()
        };
        assert_eq!(broker.list_instances(&gcp).await.unwrap().len(), 2);
        let ga1_gcp = InstanceFilter {
            global_account: Some("ga-1".to_string()),
            provider: Some(Provider::Gcp),
            ..Default::default()
        };
        let found = broker.list_instances(&ga1_gcp).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].alias, "b");
    }

    #[tokio::test]
    async fn test_details_report_error_and_deletion() {
        let (kcp, broker) = broker();
        let details = broker
            .create_instance(InstanceRequest::new("alpha", Provider::Aws))
            .await
            .unwrap();
        let mut rt: Runtime = kcp
            .get(Some("kcp-system"), &details.runtime_id)
            .await
            .unwrap()
            .unwrap();
        rt.status = Some(RuntimeStatus {
            state: Some(RuntimeState::Failed),
            provisioning_completed: false,
            conditions: vec![error_condition(
                "ShootError",
                "quota exceeded",
                chrono::Utc::now(),
            )],
        });
        kcp.patch_status(&rt).await.unwrap();

        broker.delete_instance(&details.runtime_id).await.unwrap();

        let found = broker.get_instance(&details.runtime_id).await.unwrap().unwrap();
        assert_eq!(found.state, Some(RuntimeState::Failed));
        assert_eq!(found.message.as_deref(), Some("quota exceeded"));
        assert!(found.being_deleted);

        // Unknown ids are fine
        broker.delete_instance("missing").await.unwrap();
        assert!(broker.get_instance("missing").await.unwrap().is_none());
    }
}
