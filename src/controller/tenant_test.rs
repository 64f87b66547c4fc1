//! Tests for tenant manager supervision

#[cfg(test)]
mod tests {
    use super::super::tenant::*;
    use super::super::tenant_loop::{TenantLoop, TenantLoopFactory};
    use super::super::ReconcileOutcome;
    use crate::clock::{Clock, ManualClock};
    use crate::config::SimConfig;
    use crate::crd::{
        kubeconfig_secret_name, CloudResources, CredentialState, GardenerCluster,
        GardenerClusterSpec, GardenerClusterStatus, KubeconfigRef, Kyma, KymaSpec, KymaState,
        SecretRef, ShootRef, ANNOTATION_EXPIRES_AT, ANNOTATION_FORCE_ROTATION,
        DELETION_HOOK_FINALIZER, LABEL_GLOBAL_ACCOUNT_ID, LABEL_RUNTIME_ID,
    };
    use crate::error::{Error, Result};
    use crate::store::{MemoryStore, ObjectKey, Store};
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{Namespace, Secret};
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use kube::ResourceExt;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const NS: &str = "kcp-system";
    const RT: &str = "rt-1";

    /// Waits for cancellation, optionally failing afterwards
    struct IdleLoop {
        fail: bool,
    }

    #[async_trait]
    impl TenantLoop for IdleLoop {
        async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<()> {
            cancel.cancelled().await;
            if self.fail {
                return Err(Error::TenantLoopError("sync exploded".into()));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct IdleLoopFactory {
        created: AtomicUsize,
        fail: bool,
    }

    impl TenantLoopFactory for IdleLoopFactory {
        fn new_loop(&self, _runtime_id: &str, _tenant: Store) -> Box<dyn TenantLoop> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Box::new(IdleLoop { fail: self.fail })
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        kcp: Store,
        resolver: Arc<SimulatedClusterResolver>,
        loops: Arc<IdleLoopFactory>,
        supervisor: TenantSupervisor,
    }

    fn fixture_with(loops: IdleLoopFactory) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let config = Arc::new(SimConfig::default());
        let kcp = Store::new(Arc::new(MemoryStore::kcp(clock.clone())));
        let resolver = Arc::new(SimulatedClusterResolver::new(
            kcp.clone(),
            config.clone(),
            clock.clone(),
        ));
        let loops = Arc::new(loops);
        let supervisor = TenantSupervisor::new(
            kcp.clone(),
            resolver.clone(),
            Arc::new(ApplyCrdInstaller),
            loops.clone(),
            Arc::new(TenantManagerRegistry::new()),
            clock.clone(),
            config,
        );
        Fixture {
            clock,
            kcp,
            resolver,
            loops,
            supervisor,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(IdleLoopFactory::default())
    }

    fn key() -> ObjectKey {
        ObjectKey::namespaced(NS, RT)
    }

    async fn create_cp_kyma(kcp: &Store) {
        let mut kyma = Kyma::new(RT, KymaSpec::default());
        kyma.metadata.namespace = Some(NS.to_string());
        kyma.metadata.labels = Some(BTreeMap::from([
            (LABEL_RUNTIME_ID.to_string(), RT.to_string()),
            (LABEL_GLOBAL_ACCOUNT_ID.to_string(), "ga-1".to_string()),
        ]));
        kcp.create(&kyma).await.unwrap();
    }

    /// A ready credential valid for six hours, with its kubeconfig secret
    async fn issue_credentials(f: &Fixture) {
        let kcp = &f.kcp;
        let secret_name = kubeconfig_secret_name(RT);
        let mut gc = GardenerCluster::new(
            RT,
            GardenerClusterSpec {
                shoot: ShootRef {
                    name: "p-abc1234".to_string(),
                },
                kubeconfig: KubeconfigRef {
                    secret: SecretRef {
                        name: secret_name.clone(),
                        namespace: NS.to_string(),
                        key: "config".to_string(),
                    },
                },
            },
        );
        gc.metadata.namespace = Some(NS.to_string());
        let expires_at = f.clock.now() + chrono::Duration::hours(6);
        gc.metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_EXPIRES_AT.to_string(),
            expires_at.to_rfc3339(),
        )]));
        gc.status = Some(GardenerClusterStatus {
            state: Some(CredentialState::Ready),
            conditions: vec![],
        });
        kcp.create(&gc).await.unwrap();
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(secret_name),
                namespace: Some(NS.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "config".to_string(),
                ByteString(b"apiVersion: v1".to_vec()),
            )])),
            ..Default::default()
        };
        kcp.create(&secret).await.unwrap();
    }

    async fn cp_kyma(kcp: &Store) -> Option<Kyma> {
        kcp.get(Some(NS), RT).await.unwrap()
    }

    #[tokio::test]
    async fn test_waits_for_credentials() {
        let f = fixture();
        create_cp_kyma(&f.kcp).await;

        let outcome = f.supervisor.reconcile(&key()).await.unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::RequeueAfter(Duration::from_secs(1))
        );
        assert!(f.supervisor.registry().is_empty());
        assert!(f.resolver.cluster(RT).is_none());
    }

    #[tokio::test]
    async fn test_creation_prepares_tenant_and_starts_loop() {
        let f = fixture();
        create_cp_kyma(&f.kcp).await;
        issue_credentials(&f).await;

        let outcome = f.supervisor.reconcile(&key()).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Done);
        let cp = cp_kyma(&f.kcp).await.unwrap();
        assert!(cp.finalizers().contains(&DELETION_HOOK_FINALIZER.to_string()));
        assert_eq!(cp.state(), Some(KymaState::Ready));

        let tenant = Store::new(f.resolver.cluster(RT).unwrap());
        let ns: Option<Namespace> = tenant.get(None, "kyma-system").await.unwrap();
        assert!(ns.is_some());
        assert!(tenant.is_registered::<Kyma>().await.unwrap());
        assert!(tenant.is_registered::<CloudResources>().await.unwrap());

        let tk: Kyma = tenant
            .get(Some("kyma-system"), "default")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tk.spec.channel, "regular");
        assert_eq!(tk.labels().get(LABEL_RUNTIME_ID).map(String::as_str), Some(RT));
        assert_eq!(
            tk.labels().get(LABEL_GLOBAL_ACCOUNT_ID).map(String::as_str),
            Some("ga-1")
        );
        assert_eq!(tk.finalizers(), [DELETION_HOOK_FINALIZER.to_string()]);

        assert!(f.supervisor.registry().contains(RT));
        f.supervisor.registry().stop_all().await;
    }

    #[tokio::test]
    async fn test_repeat_reconcile_starts_one_loop_and_skips_installed_crds() {
        let f = fixture();
        create_cp_kyma(&f.kcp).await;
        issue_credentials(&f).await;
        f.supervisor.reconcile(&key()).await.unwrap();

        let mut installer = MockCrdInstaller::new();
        installer.expect_install().never();
        let again = TenantSupervisor::new(
            f.kcp.clone(),
            f.resolver.clone(),
            Arc::new(installer),
            f.loops.clone(),
            f.supervisor.registry().clone(),
            f.clock.clone(),
            Arc::new(SimConfig::default()),
        );
        again.reconcile(&key()).await.unwrap();
        f.supervisor.reconcile(&key()).await.unwrap();

        assert_eq!(f.loops.created.load(Ordering::SeqCst), 1);
        assert_eq!(f.supervisor.registry().len(), 1);
        f.supervisor.registry().stop_all().await;
    }

    #[tokio::test]
    async fn test_deletion_waits_for_tenant_kyma_then_releases() {
        let f = fixture();
        create_cp_kyma(&f.kcp).await;
        issue_credentials(&f).await;
        f.supervisor.reconcile(&key()).await.unwrap();
        let tenant = Store::new(f.resolver.cluster(RT).unwrap());

        f.kcp.delete::<Kyma>(Some(NS), RT).await.unwrap();

        // First pass requests the tenant deletion
        let outcome = f.supervisor.reconcile(&key()).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::RequeueAfter(Duration::from_secs(1))
        );
        let tk: Kyma = tenant
            .get(Some("kyma-system"), "default")
            .await
            .unwrap()
            .unwrap();
        assert!(tk.metadata.deletion_timestamp.is_some());

        // Held by its finalizer
        let outcome = f.supervisor.reconcile(&key()).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::RequeueAfter(Duration::from_secs(1))
        );
        assert!(f.supervisor.registry().contains(RT));
        assert!(cp_kyma(&f.kcp).await.is_some());

        let mut tk = tk;
        tk.metadata.finalizers = Some(vec![]);
        tenant.update(&tk).await.unwrap();

        let outcome = f.supervisor.reconcile(&key()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Done);
        assert!(!f.supervisor.registry().contains(RT));
        assert!(cp_kyma(&f.kcp).await.is_none());
    }

    #[tokio::test]
    async fn test_deletion_completes_when_tenant_loop_fails() {
        let f = fixture_with(IdleLoopFactory {
            fail: true,
            ..Default::default()
        });
        create_cp_kyma(&f.kcp).await;
        issue_credentials(&f).await;
        f.supervisor.reconcile(&key()).await.unwrap();
        let tenant = Store::new(f.resolver.cluster(RT).unwrap());

        f.kcp.delete::<Kyma>(Some(NS), RT).await.unwrap();
        f.supervisor.reconcile(&key()).await.unwrap();
        let mut tk: Kyma = tenant
            .get(Some("kyma-system"), "default")
            .await
            .unwrap()
            .unwrap();
        tk.metadata.finalizers = Some(vec![]);
        tenant.update(&tk).await.unwrap();

        // The loop's error is logged, not propagated
        let outcome = f.supervisor.reconcile(&key()).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Done);
        assert!(cp_kyma(&f.kcp).await.is_none());
        assert!(f.supervisor.registry().is_empty());
    }

    #[tokio::test]
    async fn test_credentials_due_for_rotation_are_not_used() {
        let f = fixture();
        create_cp_kyma(&f.kcp).await;
        issue_credentials(&f).await;
        let mut gc: GardenerCluster = f.kcp.get(Some(NS), RT).await.unwrap().unwrap();
        gc.annotations_mut()
            .insert(ANNOTATION_FORCE_ROTATION.to_string(), "true".to_string());
        f.kcp.update(&gc).await.unwrap();

        let outcome = f.supervisor.reconcile(&key()).await.unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::RequeueAfter(Duration::from_secs(1))
        );
        assert!(f.supervisor.registry().is_empty());
        assert!(f.resolver.cluster(RT).is_none());
    }

    #[tokio::test]
    async fn test_expired_credentials_are_not_used() {
        let f = fixture();
        create_cp_kyma(&f.kcp).await;
        issue_credentials(&f).await;
        f.clock.advance(chrono::Duration::hours(6));

        let outcome = f.supervisor.reconcile(&key()).await.unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::RequeueAfter(Duration::from_secs(1))
        );
        assert!(f.resolver.cluster(RT).is_none());
    }

    #[tokio::test]
    async fn test_deletion_waits_while_credentials_rotate() {
        let f = fixture();
        let mut kyma = Kyma::new(RT, KymaSpec::default());
        kyma.metadata.namespace = Some(NS.to_string());
        kyma.metadata.finalizers = Some(vec![DELETION_HOOK_FINALIZER.to_string()]);
        f.kcp.create(&kyma).await.unwrap();
        issue_credentials(&f).await;
        f.clock.advance(chrono::Duration::hours(7));
        f.kcp.delete::<Kyma>(Some(NS), RT).await.unwrap();

        let outcome = f.supervisor.reconcile(&key()).await.unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::RequeueAfter(Duration::from_secs(1))
        );
        assert!(cp_kyma(&f.kcp).await.is_some());
    }

    #[tokio::test]
    async fn test_deletion_without_credentials_releases_finalizer() {
        let f = fixture();
        let mut kyma = Kyma::new(RT, KymaSpec::default());
        kyma.metadata.namespace = Some(NS.to_string());
        kyma.metadata.finalizers = Some(vec![DELETION_HOOK_FINALIZER.to_string()]);
        f.kcp.create(&kyma).await.unwrap();
        f.kcp.delete::<Kyma>(Some(NS), RT).await.unwrap();

        let outcome = f.supervisor.reconcile(&key()).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Done);
        assert!(cp_kyma(&f.kcp).await.is_none());
    }

    #[tokio::test]
    async fn test_resolver_failure_is_returned_and_recorded() {
        let clock = Arc::new(ManualClock::default());
        let kcp = Store::new(Arc::new(MemoryStore::kcp(clock.clone())));
        create_cp_kyma(&kcp).await;

        let mut resolver = MockClusterResolver::new();
        resolver
            .expect_resolve()
            .returning(|_| Err(Error::CredentialError("bad kubeconfig".into())));
        let supervisor = TenantSupervisor::new(
            kcp.clone(),
            Arc::new(resolver),
            Arc::new(ApplyCrdInstaller),
            Arc::new(IdleLoopFactory::default()),
            Arc::new(TenantManagerRegistry::new()),
            clock.clone(),
            Arc::new(SimConfig::default()),
        );

        let err = supervisor.reconcile(&key()).await.unwrap_err();
        assert!(matches!(err, Error::CredentialError(_)));

        let cp = cp_kyma(&kcp).await.unwrap();
        assert_eq!(cp.state(), Some(KymaState::Error));
        let conditions = cp.status.unwrap().conditions;
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, "Error");
        assert_eq!(conditions[0].status, "True");
        assert_eq!(conditions[0].reason, "ClusterClientCreationError");
        assert!(conditions[0].message.contains("bad kubeconfig"));
        assert_eq!(conditions[0].last_transition_time, clock.now().to_rfc3339());
    }

    #[tokio::test]
    async fn test_registry_creates_once_under_contention() {
        let registry = Arc::new(TenantManagerRegistry::new());
        let created = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let created = created.clone();
                tokio::spawn(async move {
                    registry.get_or_create(RT, || {
                        created.fetch_add(1, Ordering::SeqCst);
                        TenantManagerHandle::spawn(RT, Box::new(IdleLoop { fail: false }))
                    });
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
        assert!(matches!(registry.remove_and_join(RT).await, Some(Ok(()))));
        assert!(registry.is_empty());
        assert!(registry.remove_and_join(RT).await.is_none());
    }

    #[tokio::test]
    async fn test_stop_reports_loop_error() {
        let handle = TenantManagerHandle::spawn(RT, Box::new(IdleLoop { fail: true }));
        assert!(!handle.is_stopped());

        let err = handle.stop().await.unwrap_err();

        assert!(handle.is_stopped());
        assert!(matches!(err, Error::TenantLoopError(_)));
        assert_eq!(handle.last_error().as_deref(), Some("Tenant loop error: sync exploded"));
    }
}
