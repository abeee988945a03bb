//! Tether kubehub: the versioned object store contract and its Kubernetes implementation.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{DynamicObject, TypeMeta},
    Client,
};
use metrics::counter;
use tether_core::{ObjKey, ResourceKind, StoreError};
use tracing::debug;

/// Versioned list/get/create/update/delete store keyed by `(kind, namespace, name)`.
///
/// Implementations must populate `types` on every returned object and must report
/// `NotFound` and `Conflict` distinctly. Writes are atomic: a failed call leaves the
/// stored object untouched. `update` is rejected with `Conflict` when the object's
/// `resourceVersion` is stale.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List a kind; `namespace = None` lists across all namespaces.
    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>) -> Result<Vec<DynamicObject>, StoreError>;

    async fn get(&self, key: &ObjKey) -> Result<DynamicObject, StoreError>;

    async fn create(&self, key: &ObjKey, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    async fn update(&self, key: &ObjKey, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    async fn delete(&self, key: &ObjKey) -> Result<(), StoreError>;

    /// Merge `status` into the object's status sub-resource.
    async fn patch_status(&self, key: &ObjKey, status: &serde_json::Value) -> Result<(), StoreError>;
}

/// `ObjectStore` backed by the Kubernetes API through `Api<DynamicObject>`.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client } }

    /// Connect using the ambient kubeconfig or in-cluster config.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Ok(Self { client })
    }

    fn api(&self, kind: &ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }
}

fn ensure_types(mut obj: DynamicObject, kind: &ResourceKind) -> DynamicObject {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta { api_version: kind.api_version(), kind: kind.kind.clone() });
    }
    obj
}

fn map_kube_err(target: String, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(ae) => match ae.code {
            404 => StoreError::NotFound(target),
            409 if ae.reason == "AlreadyExists" => StoreError::AlreadyExists(target),
            409 => StoreError::Conflict(target),
            400 | 422 => StoreError::Invalid { key: target, reason: ae.message },
            code => StoreError::Unavailable(format!("{}: {} ({})", target, ae.message, code)),
        },
        other => StoreError::Unavailable(format!("{}: {}", target, other)),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>) -> Result<Vec<DynamicObject>, StoreError> {
        let api = self.api(kind, namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| map_kube_err(format!("{} list", kind), e))?;
        debug!(kind = %kind, ns = ?namespace, count = list.items.len(), "listed");
        Ok(list.items.into_iter().map(|o| ensure_types(o, kind)).collect())
    }

    async fn get(&self, key: &ObjKey) -> Result<DynamicObject, StoreError> {
        let api = self.api(&key.kind, key.namespace.as_deref());
        let obj = api.get(&key.name).await.map_err(|e| map_kube_err(key.to_string(), e))?;
        Ok(ensure_types(obj, &key.kind))
    }

    async fn create(&self, key: &ObjKey, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let api = self.api(&key.kind, key.namespace.as_deref());
        let created = api
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_kube_err(key.to_string(), e))?;
        counter!("store_writes_total", 1u64, "verb" => "create");
        Ok(ensure_types(created, &key.kind))
    }

    async fn update(&self, key: &ObjKey, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let api = self.api(&key.kind, key.namespace.as_deref());
        let updated = api
            .replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_kube_err(key.to_string(), e))?;
        counter!("store_writes_total", 1u64, "verb" => "update");
        Ok(ensure_types(updated, &key.kind))
    }

    async fn delete(&self, key: &ObjKey) -> Result<(), StoreError> {
        let api = self.api(&key.kind, key.namespace.as_deref());
        api.delete(&key.name, &DeleteParams::background())
            .await
            .map_err(|e| map_kube_err(key.to_string(), e))?;
        counter!("store_writes_total", 1u64, "verb" => "delete");
        Ok(())
    }

    async fn patch_status(&self, key: &ObjKey, status: &serde_json::Value) -> Result<(), StoreError> {
        let api = self.api(&key.kind, key.namespace.as_deref());
        let patch = serde_json::json!({ "status": status });
        api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_err(key.to_string(), e))?;
        counter!("store_writes_total", 1u64, "verb" => "patch_status");
        Ok(())
    }
}
