//! Object store abstraction
//!
//! Controllers read and write through [`Store`], a typed facade over an
//! object-safe [`ObjectStore`]. Two backends exist: [`KubeStore`] talks to a
//! real API server, [`MemoryStore`] simulates one in process.

mod kube_store;
mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::{Resource, ResourceExt};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

pub use kube_store::KubeStore;
pub use memory::MemoryStore;

/// Namespaced (or cluster-scoped) name of an object
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self::new(Some(namespace), name)
    }

    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Untyped CRUD over one cluster
///
/// Missing objects are `Ok(None)` on `get` and `Error::NotFound` on writes.
/// Operations on a kind the cluster does not serve fail with
/// `Error::KindNotRegistered` where the backend can tell.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, ar: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>>;

    /// List objects whose labels contain every entry of `labels`
    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>>;

    async fn create(&self, ar: &ApiResource, obj: DynamicObject) -> Result<DynamicObject>;

    /// Replace metadata and spec; the stored status is left untouched
    async fn update(&self, ar: &ApiResource, obj: DynamicObject) -> Result<DynamicObject>;

    async fn patch_status(
        &self,
        ar: &ApiResource,
        key: &ObjectKey,
        status: serde_json::Value,
    ) -> Result<DynamicObject>;

    /// Delete, or mark for deletion when finalizers are present
    async fn delete(&self, ar: &ApiResource, key: &ObjectKey) -> Result<()>;

    async fn is_kind_registered(&self, ar: &ApiResource) -> Result<bool>;
}

/// Types the typed facade can move in and out of an [`ObjectStore`]
pub trait Object:
    Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> Object for T where
    T: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

fn to_dynamic<K: Object>(obj: &K) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

fn from_dynamic<K: Object>(obj: DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Typed access to one cluster
#[derive(Clone)]
pub struct Store {
    inner: Arc<dyn ObjectStore>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self { inner }
    }

    pub fn raw(&self) -> &Arc<dyn ObjectStore> {
        &self.inner
    }

    pub async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        let ar = ApiResource::erase::<K>(&());
        match self.inner.get(&ar, &ObjectKey::new(namespace, name)).await? {
            Some(obj) => Ok(Some(from_dynamic(obj)?)),
            None => Ok(None),
        }
    }

    /// Like `get`, but a kind the cluster does not serve reads as absent
    pub async fn get_if_registered<K: Object>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<K>> {
        match self.get(namespace, name).await {
            Err(e) if e.is_kind_not_registered() => Ok(None),
            other => other,
        }
    }

    pub async fn list<K: Object>(
        &self,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>> {
        let ar = ApiResource::erase::<K>(&());
        self.inner
            .list(&ar, namespace, labels)
            .await?
            .into_iter()
            .map(from_dynamic)
            .collect()
    }

    pub async fn create<K: Object>(&self, obj: &K) -> Result<K> {
        let ar = ApiResource::erase::<K>(&());
        from_dynamic(self.inner.create(&ar, to_dynamic(obj)?).await?)
    }

    pub async fn update<K: Object>(&self, obj: &K) -> Result<K> {
        let ar = ApiResource::erase::<K>(&());
        from_dynamic(self.inner.update(&ar, to_dynamic(obj)?).await?)
    }

    /// Persist the status carried by `obj`
    pub async fn patch_status<K: Object>(&self, obj: &K) -> Result<K> {
        let ar = ApiResource::erase::<K>(&());
        let status = serde_json::to_value(obj)?
            .get("status")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        from_dynamic(
            self.inner
                .patch_status(&ar, &ObjectKey::of(obj), status)
                .await?,
        )
    }

    pub async fn delete<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        let ar = ApiResource::erase::<K>(&());
        self.inner.delete(&ar, &ObjectKey::new(namespace, name)).await
    }

    /// Delete, treating an already absent object as success
    pub async fn delete_if_exists<K: Object>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<()> {
        match self.delete::<K>(namespace, name).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    pub async fn is_registered<K: Object>(&self) -> Result<bool> {
        self.inner
            .is_kind_registered(&ApiResource::erase::<K>(&()))
            .await
    }
}

pub(crate) fn not_registered(ar: &ApiResource) -> Error {
    Error::KindNotRegistered(format!("{}/{}", ar.api_version, ar.kind))
}

/// Render a label filter as a selector string (`k=v,k2=v2`)
pub(crate) fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_selector() {
        let labels = BTreeMap::from([
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
        ]);
        assert_eq!(label_selector(&labels), "a=1,b=2");
        assert_eq!(label_selector(&BTreeMap::new()), "");
    }

    #[test]
    fn test_object_key_display() {
        assert_eq!(ObjectKey::namespaced("ns", "a").to_string(), "ns/a");
        assert_eq!(ObjectKey::new(None, "a").to_string(), "a");
    }
}
