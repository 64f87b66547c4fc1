//! In-process API server
//!
//! Enough Kubernetes semantics to drive the controllers without a cluster:
//! metadata bookkeeping, finalizer-gated deletion, status as a separate
//! write path and REST-mapping registration through CRDs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{DynamicObject, TypeMeta};
use kube::error::ErrorResponse;
use kube::discovery::ApiResource;
use tracing::debug;

use super::{not_registered, Object, ObjectKey, ObjectStore};
use crate::clock::Clock;
use crate::crd::{garden_crds, kcp_crds};
use crate::error::{Error, Result};

const APIEXTENSIONS_GROUP: &str = "apiextensions.k8s.io";

/// (group, kind, namespace, name)
type StoreKey = (String, String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<StoreKey, DynamicObject>,
    /// (group, kind) pairs with a REST mapping
    registered: BTreeSet<(String, String)>,
    /// Kinds whose every operation fails, for outage tests
    unavailable: BTreeSet<String>,
    revision: u64,
}

impl State {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }
}

pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(State::default()),
        }
    }

    /// A control plane serving Runtime, GardenerCluster and Kyma
    pub fn kcp(clock: Arc<dyn Clock>) -> Self {
        let store = Self::new(clock);
        store.register_crds(&kcp_crds());
        store
    }

    /// A Garden cluster serving Shoot
    pub fn garden(clock: Arc<dyn Clock>) -> Self {
        let store = Self::new(clock);
        store.register_crds(&garden_crds());
        store
    }

    /// A fresh tenant cluster; its CRDs arrive through the CRD installer
    pub fn tenant(clock: Arc<dyn Clock>) -> Self {
        Self::new(clock)
    }

    pub fn register<K: Object>(&self) {
        let ar = ApiResource::erase::<K>(&());
        self.register_kind(&ar.group, &ar.kind);
    }

    pub fn register_kind(&self, group: &str, kind: &str) {
        self.lock()
            .registered
            .insert((group.to_string(), kind.to_string()));
    }

    pub fn register_crds(&self, crds: &[CustomResourceDefinition]) {
        for crd in crds {
            self.register_kind(&crd.spec.group, &crd.spec.names.kind);
        }
    }

    /// Make every operation on `kind` fail with a 503 until restored
    pub fn set_unavailable(&self, kind: &str, unavailable: bool) {
        let mut state = self.lock();
        if unavailable {
            state.unavailable.insert(kind.to_string());
        } else {
            state.unavailable.remove(kind);
        }
    }

    /// Number of stored objects of a kind, including ones being deleted
    pub fn count<K: Object>(&self) -> usize {
        let ar = ApiResource::erase::<K>(&());
        self.lock()
            .objects
            .keys()
            .filter(|(group, kind, _, _)| *group == ar.group && *kind == ar.kind)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(state: &State, ar: &ApiResource) -> Result<()> {
        if state.unavailable.contains(&ar.kind) {
            return Err(Error::KubeError(kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: format!("{} temporarily unavailable", ar.kind),
                reason: "ServiceUnavailable".to_string(),
                code: 503,
            })));
        }
        let always = ar.group.is_empty() || ar.group == APIEXTENSIONS_GROUP;
        if always
            || state
                .registered
                .contains(&(ar.group.clone(), ar.kind.clone()))
        {
            Ok(())
        } else {
            Err(not_registered(ar))
        }
    }
}

fn store_key(ar: &ApiResource, namespace: Option<&str>, name: &str) -> StoreKey {
    (
        ar.group.clone(),
        ar.kind.clone(),
        namespace.unwrap_or_default().to_string(),
        name.to_string(),
    )
}

fn key_of(ar: &ApiResource, key: &ObjectKey) -> StoreKey {
    store_key(ar, key.namespace.as_deref(), &key.name)
}

fn describe(ar: &ApiResource, key: &StoreKey) -> String {
    if key.2.is_empty() {
        format!("{} {}", ar.kind, key.3)
    } else {
        format!("{} {}/{}", ar.kind, key.2, key.3)
    }
}

fn has_finalizers(obj: &DynamicObject) -> bool {
    obj.metadata
        .finalizers
        .as_ref()
        .map(|f| !f.is_empty())
        .unwrap_or(false)
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, ar: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        let state = self.lock();
        Self::check(&state, ar)?;
        Ok(state.objects.get(&key_of(ar, key)).cloned())
    }

    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>> {
        let state = self.lock();
        Self::check(&state, ar)?;
        Ok(state
            .objects
            .iter()
            .filter(|((group, kind, ns, _), _)| {
                *group == ar.group
                    && *kind == ar.kind
                    && namespace.map(|n| n == ns).unwrap_or(true)
            })
            .filter(|(_, obj)| {
                let own = obj.metadata.labels.as_ref();
                labels
                    .iter()
                    .all(|(k, v)| own.and_then(|l| l.get(k)) == Some(v))
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, ar: &ApiResource, mut obj: DynamicObject) -> Result<DynamicObject> {
        let mut state = self.lock();
        Self::check(&state, ar)?;
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::ValidationError(format!("{} without a name", ar.kind)))?;
        let key = store_key(ar, obj.metadata.namespace.as_deref(), &name);
        if state.objects.contains_key(&key) {
            return Err(Error::AlreadyExists(describe(ar, &key)));
        }

        let revision = state.next_revision();
        obj.types = Some(TypeMeta {
            api_version: ar.api_version.clone(),
            kind: ar.kind.clone(),
        });
        obj.metadata.uid = Some(format!("uid-{revision}"));
        obj.metadata.resource_version = Some(revision);
        obj.metadata.generation = Some(1);
        obj.metadata.creation_timestamp = Some(Time(self.clock.now()));
        obj.metadata.deletion_timestamp = None;

        if ar.group == APIEXTENSIONS_GROUP && ar.kind == "CustomResourceDefinition" {
            let group = obj.data["spec"]["group"].as_str().unwrap_or_default();
            let kind = obj.data["spec"]["names"]["kind"].as_str().unwrap_or_default();
            if !group.is_empty() && !kind.is_empty() {
                debug!("Registering {}/{}", group, kind);
                state
                    .registered
                    .insert((group.to_string(), kind.to_string()));
            }
        }

        state.objects.insert(key, obj.clone());
        Ok(obj)
    }

    async fn update(&self, ar: &ApiResource, mut obj: DynamicObject) -> Result<DynamicObject> {
        let mut state = self.lock();
        Self::check(&state, ar)?;
        let name = obj.metadata.name.clone().unwrap_or_default();
        let key = store_key(ar, obj.metadata.namespace.as_deref(), &name);
        let existing = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(describe(ar, &key)))?;

        // Status only moves through patch_status
        match existing.data.get("status") {
            Some(status) => obj.data["status"] = status.clone(),
            None => {
                if let Some(data) = obj.data.as_object_mut() {
                    data.remove("status");
                }
            }
        }

        let generation = existing.metadata.generation.unwrap_or(1);
        let spec_changed = existing.data.get("spec") != obj.data.get("spec");
        obj.types = existing.types.clone();
        obj.metadata.uid = existing.metadata.uid.clone();
        obj.metadata.creation_timestamp = existing.metadata.creation_timestamp.clone();
        obj.metadata.deletion_timestamp = existing.metadata.deletion_timestamp.clone();
        obj.metadata.generation = Some(if spec_changed { generation + 1 } else { generation });
        obj.metadata.resource_version = Some(state.next_revision());

        if obj.metadata.deletion_timestamp.is_some() && !has_finalizers(&obj) {
            debug!("Finalizers released, removing {}", describe(ar, &key));
            state.objects.remove(&key);
            return Ok(obj);
        }
        state.objects.insert(key, obj.clone());
        Ok(obj)
    }

    async fn patch_status(
        &self,
        ar: &ApiResource,
        key: &ObjectKey,
        status: serde_json::Value,
    ) -> Result<DynamicObject> {
        let mut state = self.lock();
        Self::check(&state, ar)?;
        let key = key_of(ar, key);
        let revision = state.next_revision();
        let obj = state
            .objects
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(describe(ar, &key)))?;
        obj.data["status"] = status;
        obj.metadata.resource_version = Some(revision);
        Ok(obj.clone())
    }

    async fn delete(&self, ar: &ApiResource, key: &ObjectKey) -> Result<()> {
        let mut state = self.lock();
        Self::check(&state, ar)?;
        let key = key_of(ar, key);
        let now = self.clock.now();
        let revision = state.next_revision();
        let obj = state
            .objects
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(describe(ar, &key)))?;
        if has_finalizers(obj) {
            if obj.metadata.deletion_timestamp.is_none() {
                obj.metadata.deletion_timestamp = Some(Time(now));
                obj.metadata.resource_version = Some(revision);
            }
        } else {
            state.objects.remove(&key);
        }
        Ok(())
    }

    async fn is_kind_registered(&self, ar: &ApiResource) -> Result<bool> {
        let state = self.lock();
        match Self::check(&state, ar) {
            Ok(()) => Ok(true),
            Err(e) if e.is_kind_not_registered() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
