//! [`ObjectStore`] over a live API server

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{
    Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
};
use kube::core::GroupVersionKind;
use kube::discovery::{self, ApiResource};
use kube::{Client, ResourceExt};
use serde_json::json;

use super::{label_selector, ObjectKey, ObjectStore};
use crate::error::{Error, Result};

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api(&self, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        }
    }
}

fn map_error(err: kube::Error, ar: &ApiResource, name: &str) -> Error {
    match &err {
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound(format!("{} {name}", ar.kind)),
        kube::Error::Api(ae) if ae.code == 409 => {
            Error::AlreadyExists(format!("{} {name}", ar.kind))
        }
        _ => Error::KubeError(err),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, ar: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        Ok(self
            .api(ar, key.namespace.as_deref())
            .get_opt(&key.name)
            .await?)
    }

    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>> {
        let mut params = ListParams::default();
        if !labels.is_empty() {
            params = params.labels(&label_selector(labels));
        }
        Ok(self.api(ar, namespace).list(&params).await?.items)
    }

    async fn create(&self, ar: &ApiResource, obj: DynamicObject) -> Result<DynamicObject> {
        let name = obj.name_any();
        self.api(ar, obj.metadata.namespace.as_deref())
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| map_error(e, ar, &name))
    }

    async fn update(&self, ar: &ApiResource, obj: DynamicObject) -> Result<DynamicObject> {
        let name = obj.name_any();
        self.api(ar, obj.metadata.namespace.as_deref())
            .replace(&name, &PostParams::default(), &obj)
            .await
            .map_err(|e| map_error(e, ar, &name))
    }

    async fn patch_status(
        &self,
        ar: &ApiResource,
        key: &ObjectKey,
        status: serde_json::Value,
    ) -> Result<DynamicObject> {
        let patch = json!({ "status": status });
        self.api(ar, key.namespace.as_deref())
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_error(e, ar, &key.name))
    }

    async fn delete(&self, ar: &ApiResource, key: &ObjectKey) -> Result<()> {
        self.api(ar, key.namespace.as_deref())
            .delete(&key.name, &DeleteParams::default())
            .await
            .map_err(|e| map_error(e, ar, &key.name))?;
        Ok(())
    }

    async fn is_kind_registered(&self, ar: &ApiResource) -> Result<bool> {
        let gvk = GroupVersionKind::gvk(&ar.group, &ar.version, &ar.kind);
        match discovery::pinned_kind(&self.client, &gvk).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(kube::Error::Discovery(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
