//! GardenerCluster credential rotation
//!
//! Keeps the admin kubeconfig referenced by a GardenerCluster valid. A new
//! credential is issued when the object is not Ready, carries no expiry,
//! was asked to rotate, or expires within a minute.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{ObjectMeta, PostParams};
use kube::core::Request;
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::conditions::{
    same_conditions, set_condition, CONDITION_STATUS_FALSE, CONDITION_TYPE_KUBECONFIG_READY,
    REASON_CONFIGURATION_ERROR,
};
use super::ReconcileOutcome;
use crate::clock::Clock;
use crate::config::SimConfig;
use crate::crd::{
    CredentialState, GardenerCluster, GardenerClusterStatus, ShootRef, ANNOTATION_EXPIRES_AT,
    ANNOTATION_FORCE_ROTATION, LABEL_DO_NOT_RECONCILE, LABEL_RUNTIME_ID, LABEL_SHOOT_NAME,
};
use crate::error::{Error, Result};
use crate::store::{ObjectKey, Store};

/// Rotate when less than this is left, and recheck this often while waiting
pub const ROTATION_MARGIN: Duration = Duration::from_secs(60);

/// Issues time-limited admin kubeconfigs for shoots
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn issue(&self, shoot: &ShootRef, validity: Duration) -> Result<Vec<u8>>;
}

/// Fabricates kubeconfigs with random tokens
#[derive(Default)]
pub struct SimulatedCredentialIssuer {
    issued: Mutex<HashMap<String, u32>>,
}

impl SimulatedCredentialIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many credentials were issued for a shoot so far
    pub fn issued_count(&self, shoot_name: &str) -> u32 {
        self.issued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(shoot_name)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl CredentialIssuer for SimulatedCredentialIssuer {
    async fn issue(&self, shoot: &ShootRef, validity: Duration) -> Result<Vec<u8>> {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(40)
            .map(char::from)
            .collect();
        *self
            .issued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(shoot.name.clone())
            .or_default() += 1;
        debug!(shoot = %shoot.name, validity = ?validity, "Issued simulated kubeconfig");
        let kubeconfig = format!(
            "apiVersion: v1\n\
             kind: Config\n\
             clusters:\n\
             - name: {name}\n  cluster:\n    server: https://api.{name}.sim.local\n\
             contexts:\n\
             - name: {name}\n  context:\n    cluster: {name}\n    user: {name}-admin\n\
             current-context: {name}\n\
             users:\n\
             - name: {name}-admin\n  user:\n    token: {token}\n",
            name = shoot.name,
        );
        Ok(kubeconfig.into_bytes())
    }
}

/// Requests admin kubeconfigs from the Garden `adminkubeconfig` subresource
pub struct GardenCredentialIssuer {
    client: Client,
    namespace: String,
}

impl GardenCredentialIssuer {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }
}

#[async_trait]
impl CredentialIssuer for GardenCredentialIssuer {
    async fn issue(&self, shoot: &ShootRef, validity: Duration) -> Result<Vec<u8>> {
        let request = Request::new(format!(
            "/apis/core.gardener.cloud/v1beta1/namespaces/{}/shoots",
            self.namespace
        ));
        let body = serde_json::to_vec(&json!({
            "apiVersion": "authentication.gardener.cloud/v1alpha1",
            "kind": "AdminKubeconfigRequest",
            "spec": { "expirationSeconds": validity.as_secs() }
        }))?;
        let request = request
            .create_subresource("adminkubeconfig", &shoot.name, &PostParams::default(), body)
            .map_err(|e| Error::CredentialError(format!("building request: {e}")))?;
        let response: serde_json::Value = self.client.request(request).await?;
        let encoded = response["status"]["kubeconfig"].as_str().ok_or_else(|| {
            Error::CredentialError(format!("no kubeconfig returned for shoot {}", shoot.name))
        })?;
        STANDARD
            .decode(encoded)
            .map_err(|e| Error::CredentialError(format!("decoding kubeconfig: {e}")))
    }
}

/// Decide whether a credential must be rotated now, and when to look again
pub fn evaluate_rotation(gc: &GardenerCluster, now: DateTime<Utc>) -> (bool, Duration) {
    if !gc.is_ready() {
        return (true, ROTATION_MARGIN);
    }
    let annotations = match &gc.metadata.annotations {
        Some(a) => a,
        None => return (true, ROTATION_MARGIN),
    };
    if annotations.contains_key(ANNOTATION_FORCE_ROTATION) {
        return (true, ROTATION_MARGIN);
    }

    // An unreadable expiry counts as already expired
    let expires_at = annotations
        .get(ANNOTATION_EXPIRES_AT)
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(now);
    match (expires_at - now).to_std() {
        Ok(expires_in) if expires_in >= ROTATION_MARGIN => {
            (false, expires_in - Duration::from_secs(1))
        }
        _ => (true, ROTATION_MARGIN),
    }
}

pub struct CredentialController {
    kcp: Store,
    issuer: Arc<dyn CredentialIssuer>,
    clock: Arc<dyn Clock>,
    config: Arc<SimConfig>,
}

impl CredentialController {
    pub fn new(
        kcp: Store,
        issuer: Arc<dyn CredentialIssuer>,
        clock: Arc<dyn Clock>,
        config: Arc<SimConfig>,
    ) -> Self {
        Self {
            kcp,
            issuer,
            clock,
            config,
        }
    }

    #[instrument(skip(self), fields(credential = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let gc: Option<GardenerCluster> = self
            .kcp
            .get(key.namespace.as_deref(), &key.name)
            .await?;
        let mut gc = match gc {
            Some(gc) => gc,
            None => return Ok(ReconcileOutcome::Done),
        };
        if gc.labels().contains_key(LABEL_DO_NOT_RECONCILE) {
            return Ok(ReconcileOutcome::Done);
        }

        let shoot_name = match gc.labels().get(LABEL_SHOOT_NAME) {
            Some(name) if !name.is_empty() => name.clone(),
            _ => {
                self.mark_misconfigured(&gc).await?;
                return Ok(ReconcileOutcome::Done);
            }
        };

        let now = self.clock.now();
        let (sync_needed, wait) = evaluate_rotation(&gc, now);
        if !sync_needed {
            debug!("Kubeconfig valid, next check in {:?}", wait);
            return Ok(ReconcileOutcome::RequeueAfter(wait));
        }

        let validity = self.config.credential_validity();
        let kubeconfig = self
            .issuer
            .issue(&ShootRef { name: shoot_name.clone() }, validity)
            .await?;
        self.store_kubeconfig(&gc, kubeconfig).await?;

        let expires_at = now
            + chrono::Duration::from_std(validity)
                .map_err(|e| Error::ConfigError(format!("credential validity: {e}")))?;
        gc.annotations_mut().insert(
            ANNOTATION_EXPIRES_AT.to_string(),
            expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        gc.annotations_mut().remove(ANNOTATION_FORCE_ROTATION);
        let mut gc = self.kcp.update(&gc).await?;
        info!(shoot = %shoot_name, expires_at = %expires_at, "Kubeconfig rotated");

        let changed = gc
            .status
            .as_ref()
            .map(|s| s.state != Some(CredentialState::Ready) || !s.conditions.is_empty())
            .unwrap_or(true);
        if changed {
            gc.status = Some(GardenerClusterStatus {
                state: Some(CredentialState::Ready),
                conditions: vec![],
            });
            self.kcp.patch_status(&gc).await?;
        }

        Ok(ReconcileOutcome::RequeueAfter(
            self.config.rotation_poll_interval(),
        ))
    }

    /// Terminal: nothing to rotate against until the label is added
    async fn mark_misconfigured(&self, gc: &GardenerCluster) -> Result<()> {
        let current = gc.status.clone().unwrap_or_default();
        let mut desired = current.clone();
        desired.state = Some(CredentialState::Error);
        set_condition(
            &mut desired.conditions,
            CONDITION_TYPE_KUBECONFIG_READY,
            CONDITION_STATUS_FALSE,
            REASON_CONFIGURATION_ERROR,
            &format!("Missing label {LABEL_SHOOT_NAME}"),
            gc.metadata.generation,
            self.clock.now(),
        );
        if current.state == desired.state
            && same_conditions(&current.conditions, &desired.conditions)
        {
            return Ok(());
        }
        warn!("GardenerCluster has no {} label", LABEL_SHOOT_NAME);
        let mut gc = gc.clone();
        gc.status = Some(desired);
        self.kcp.patch_status(&gc).await?;
        Ok(())
    }

    async fn store_kubeconfig(&self, gc: &GardenerCluster, kubeconfig: Vec<u8>) -> Result<()> {
        let target = &gc.spec.kubeconfig.secret;
        let data = BTreeMap::from([(target.key.clone(), ByteString(kubeconfig))]);
        let existing: Option<Secret> = self
            .kcp
            .get(Some(&target.namespace), &target.name)
            .await?;
        match existing {
            Some(mut secret) => {
                secret.data = Some(data);
                self.kcp.update(&secret).await?;
            }
            None => {
                let mut labels = BTreeMap::new();
                if let Some(runtime_id) = gc.labels().get(LABEL_RUNTIME_ID) {
                    labels.insert(LABEL_RUNTIME_ID.to_string(), runtime_id.clone());
                }
                let secret = Secret {
                    metadata: ObjectMeta {
                        name: Some(target.name.clone()),
                        namespace: Some(target.namespace.clone()),
                        labels: Some(labels),
                        ..Default::default()
                    },
                    data: Some(data),
                    ..Default::default()
                };
                self.kcp.create(&secret).await?;
                debug!(secret = %target.name, "Created kubeconfig secret");
            }
        }
        Ok(())
    }
}
