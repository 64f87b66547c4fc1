//! End-to-end lifecycle of a simulated instance
//!
//! Runs the orchestrator, credential controller and tenant supervisor by
//! hand against in-memory clusters, with the test acting as Gardener.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kcp_sim::broker::{Broker, InstanceRequest};
use kcp_sim::clock::ManualClock;
use kcp_sim::config::SimConfig;
use kcp_sim::controller::{
    ApplyCrdInstaller, CredentialController, DefaultShootBuilder, ModuleSyncLoopFactory,
    RuntimeOrchestrator, SimulatedClusterResolver, SimulatedCredentialIssuer,
    TenantManagerRegistry, TenantSupervisor,
};
use kcp_sim::crd::{
    CloudResources, Condition, GardenerCluster, Kyma, Module, Provider, Shoot, ShootStatus,
    SHOOT_READY_CONDITIONS,
};
use kcp_sim::store::{MemoryStore, ObjectKey, Store};

const KCP_NS: &str = "kcp-system";
const GARDEN_NS: &str = "garden-sim";

struct Sim {
    clock: Arc<ManualClock>,
    kcp: Store,
    garden: Store,
    broker: Broker,
    issuer: Arc<SimulatedCredentialIssuer>,
    resolver: Arc<SimulatedClusterResolver>,
    registry: Arc<TenantManagerRegistry>,
    runtimes: RuntimeOrchestrator,
    credentials: CredentialController,
    tenants: TenantSupervisor,
}

impl Sim {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::default());
        let config = Arc::new(SimConfig {
            tenant_loop_interval_ms: 10,
            ..Default::default()
        });
        let kcp = Store::new(Arc::new(MemoryStore::kcp(clock.clone())));
        let garden = Store::new(Arc::new(MemoryStore::garden(clock.clone())));
        let issuer = Arc::new(SimulatedCredentialIssuer::new());
        let resolver = Arc::new(SimulatedClusterResolver::new(
            kcp.clone(),
            config.clone(),
            clock.clone(),
        ));
        let registry = Arc::new(TenantManagerRegistry::new());

        Self {
            broker: Broker::new(kcp.clone(), config.clone()),
            runtimes: RuntimeOrchestrator::new(
                kcp.clone(),
                garden.clone(),
                Arc::new(DefaultShootBuilder::new(config.clone())),
                clock.clone(),
                config.clone(),
            ),
            credentials: CredentialController::new(
                kcp.clone(),
                issuer.clone(),
                clock.clone(),
                config.clone(),
            ),
            tenants: TenantSupervisor::new(
                kcp.clone(),
                resolver.clone(),
                Arc::new(ApplyCrdInstaller),
                Arc::new(ModuleSyncLoopFactory::new(
                    kcp.clone(),
                    config.clone(),
                    clock.clone(),
                )),
                registry.clone(),
                clock.clone(),
                config,
            ),
            clock,
            kcp,
            garden,
            issuer,
            resolver,
            registry,
        }
    }

    /// Mark every shoot without conditions as fully healthy
    async fn play_gardener(&self) {
        let shoots: Vec<Shoot> = self
            .garden
            .list(Some(GARDEN_NS), &Default::default())
            .await
            .unwrap();
        for mut shoot in shoots {
            if shoot.status.as_ref().is_some_and(|s| !s.conditions.is_empty()) {
                continue;
            }
            shoot.status = Some(ShootStatus {
                conditions: SHOOT_READY_CONDITIONS
                    .iter()
                    .map(|t| Condition::new(t, true, "Healthy", "all good"))
                    .collect(),
                last_errors: vec![],
            });
            self.garden.patch_status(&shoot).await.unwrap();
        }
    }

    /// One pass of every controller over one runtime
    async fn step(&self, runtime_id: &str) {
        let key = ObjectKey::namespaced(KCP_NS, runtime_id);
        self.runtimes.reconcile(&key).await.unwrap();
        self.play_gardener().await;
        self.credentials.reconcile(&key).await.unwrap();
        self.tenants.reconcile(&key).await.unwrap();
        // Let the tenant loop tick
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    async fn provision(&self, alias: &str, provider: Provider) -> String {
        let details = self
            .broker
            .create_instance(InstanceRequest::new(alias, provider))
            .await
            .unwrap();
        for _ in 0..30 {
            self.step(&details.runtime_id).await;
            let current = self.broker.get_instance(&details.runtime_id).await.unwrap();
            if current.is_some_and(|d| d.provisioning_completed) {
                return details.runtime_id;
            }
        }
        panic!("instance {alias} was not provisioned");
    }

    fn tenant(&self, runtime_id: &str) -> Store {
        Store::new(self.resolver.cluster(runtime_id).unwrap())
    }
}

#[tokio::test]
async fn test_instance_lifecycle() {
    let sim = Sim::new();
    let runtime_id = sim.provision("alpha", Provider::Aws).await;

    let details = sim.broker.get_instance(&runtime_id).await.unwrap().unwrap();
    assert!(details.provisioning_completed);
    assert!(details.message.is_none());
    assert!(sim.registry.contains(&runtime_id));

    // Tenant side is prepared and synced
    let tenant = sim.tenant(&runtime_id);
    let tenant_kyma: Kyma = tenant
        .get(Some("kyma-system"), "default")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tenant_kyma.spec.channel, "regular");
    let cloud_resources: Option<CloudResources> =
        tenant.get(Some("kyma-system"), "default").await.unwrap();
    assert!(cloud_resources.is_some());

    // Enable a module in the tenant and watch it reach the control plane
    let mut tenant_kyma = tenant_kyma;
    tenant_kyma.spec.modules.push(Module {
        name: "cloud-manager".to_string(),
        channel: None,
    });
    tenant.update(&tenant_kyma).await.unwrap();

    let mut synced = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let cp: Kyma = sim.kcp.get(Some(KCP_NS), &runtime_id).await.unwrap().unwrap();
        let in_status = cp
            .status
            .as_ref()
            .is_some_and(|s| s.modules.iter().any(|m| m.name == "cloud-manager"));
        if cp.spec.modules.iter().any(|m| m.name == "cloud-manager") && in_status {
            synced = true;
            break;
        }
    }
    assert!(synced, "module never reached the control-plane Kyma");

    // Teardown
    sim.broker.delete_instance(&runtime_id).await.unwrap();
    let mut gone = false;
    for _ in 0..40 {
        sim.step(&runtime_id).await;
        if sim.broker.get_instance(&runtime_id).await.unwrap().is_none() {
            gone = true;
            break;
        }
    }
    assert!(gone, "runtime was not deprovisioned");

    assert!(!sim.registry.contains(&runtime_id));
    let cp: Option<Kyma> = sim.kcp.get(Some(KCP_NS), &runtime_id).await.unwrap();
    assert!(cp.is_none());
    let gc: Option<GardenerCluster> = sim.kcp.get(Some(KCP_NS), &runtime_id).await.unwrap();
    assert!(gc.is_none());
    let shoot: Option<Shoot> = sim
        .garden
        .get(Some(GARDEN_NS), &details.shoot_name)
        .await
        .unwrap();
    assert!(shoot.is_none());
    let tenant_kyma: Option<Kyma> = tenant.get(Some("kyma-system"), "default").await.unwrap();
    assert!(tenant_kyma.is_none());
}

#[tokio::test]
async fn test_credentials_rotate_before_expiry() {
    let sim = Sim::new();
    let runtime_id = sim.provision("beta", Provider::Gcp).await;
    let details = sim.broker.get_instance(&runtime_id).await.unwrap().unwrap();
    let secret_name = format!("kubeconfig-{runtime_id}");
    let first: Secret = sim
        .kcp
        .get(Some(KCP_NS), &secret_name)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sim.issuer.issued_count(&details.shoot_name), 1);

    sim.clock
        .advance(chrono::Duration::hours(6) - chrono::Duration::seconds(30));
    sim.step(&runtime_id).await;

    assert_eq!(sim.issuer.issued_count(&details.shoot_name), 2);
    let second: Secret = sim
        .kcp
        .get(Some(KCP_NS), &secret_name)
        .await
        .unwrap()
        .unwrap();
    assert_ne!(first.data, second.data);

    sim.registry.stop_all().await;
}

#[tokio::test]
async fn test_instances_are_independent() {
    let sim = Sim::new();
    let a = sim.provision("one", Provider::Aws).await;
    let b = sim.provision("two", Provider::Azure).await;

    assert_ne!(a, b);
    assert_eq!(sim.registry.len(), 2);

    sim.broker.delete_instance(&a).await.unwrap();
    for _ in 0..40 {
        sim.step(&a).await;
        sim.step(&b).await;
        if sim.broker.get_instance(&a).await.unwrap().is_none() {
            break;
        }
    }

    assert!(sim.broker.get_instance(&a).await.unwrap().is_none());
    let remaining = sim.broker.get_instance(&b).await.unwrap().unwrap();
    assert!(remaining.provisioning_completed);
    assert!(!remaining.being_deleted);
    assert_eq!(sim.registry.len(), 1);

    sim.registry.stop_all().await;
}
