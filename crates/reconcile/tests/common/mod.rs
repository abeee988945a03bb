#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::core::{ApiResource, DynamicObject};
use serde_json::{json, Value as Json};
use tether_apply::{builtin, RetryPolicy};
use tether_core::{ObjKey, Owner, ResourceKind};
use tether_reconcile::{ReconcileConfig, Reconciler};
use tether_store::MemStore;

pub fn owner() -> Owner {
    Owner { kind: ResourceKind::new("example.dev", "v1", "Stack", "stacks"), namespace: "ns".into(), name: "stack".into(), uid: "owner-1".into() }
}

pub fn reconciler(store: &Arc<MemStore>) -> Reconciler {
    let config = ReconcileConfig { retry: RetryPolicy::immediate(5), ..Default::default() };
    Reconciler::new(store.clone(), Arc::new(builtin()), config)
}

fn object<K: kube::Resource<DynamicType = ()>>(name: &str, data: Json) -> DynamicObject {
    DynamicObject::new(name, &ApiResource::erase::<K>(&())).within("ns").data(data)
}

pub fn service(name: &str, port: u16) -> DynamicObject {
    object::<k8s_openapi::api::core::v1::Service>(name, json!({"spec": {"ports": [{"port": port}], "selector": {"app": name}}}))
}

pub fn config_map(name: &str) -> DynamicObject {
    object::<k8s_openapi::api::core::v1::ConfigMap>(name, json!({"data": {"name": name}}))
}

pub fn deployment(name: &str, app: &str, replicas: i32) -> DynamicObject {
    object::<k8s_openapi::api::apps::v1::Deployment>(name, json!({"spec": {
        "replicas": replicas,
        "selector": {"matchLabels": {"app": app}},
        "template": {
            "metadata": {"labels": {"app": app}},
            "spec": {"containers": [{"name": name, "image": format!("{name}:1")}]}
        }
    }}))
}

pub fn cluster_role(name: &str) -> DynamicObject {
    let ar = ApiResource::erase::<k8s_openapi::api::rbac::v1::ClusterRole>(&());
    DynamicObject::new(name, &ar).data(json!({"rules": [{"apiGroups": [""], "resources": ["pods"], "verbs": ["get"]}]}))
}

/// Workload with component/version labels and an observed status.
pub fn component(name: &str, component: &str, version: Option<&str>, desired: i32, ready: i32) -> DynamicObject {
    let mut obj = deployment(name, name, desired);
    obj.data["status"] = json!({
        "replicas": desired,
        "readyReplicas": ready,
        "availableReplicas": ready,
        "updatedReplicas": desired,
        "unavailableReplicas": desired - ready,
    });
    let mut labels = BTreeMap::from([("app.kubernetes.io/component".to_string(), component.to_string())]);
    if let Some(v) = version {
        labels.insert("app.kubernetes.io/version".into(), v.into());
    }
    obj.metadata.labels = Some(labels);
    obj
}

pub fn key_of(obj: &DynamicObject) -> ObjKey {
    builtin().key_of(obj).unwrap()
}

/// Persist `obj` as if a previous pass had created it for `owner`.
pub fn seed_owned(store: &MemStore, owner: &Owner, mut obj: DynamicObject) -> ObjKey {
    obj.metadata.owner_references = Some(vec![owner.controller_ref()]);
    let key = key_of(&obj);
    store.seed(&key, obj);
    key
}

/// Persist the owner object itself so its status can be written.
pub fn seed_owner(store: &MemStore, owner: &Owner) {
    let mut obj = owner.key().placeholder();
    obj.metadata.uid = Some(owner.uid.clone());
    store.seed(&owner.key(), obj);
}
