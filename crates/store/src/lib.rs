//! Tether store: in-RAM versioned object store.
//!
//! Assigns uid, resourceVersion and creationTimestamp the way an API server does,
//! and enforces optimistic concurrency on update. Faults (conflicts, failing writes or
//! lists) can be injected per key, and every call is logged in arrival order.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::{DynamicObject, TypeMeta};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tether_core::{ObjKey, ResourceKind, StoreError};
use tether_kubehub::ObjectStore;
use tracing::debug;

/// A store call as observed by `MemStore`, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    List(ResourceKind, Option<String>),
    Get(ObjKey),
    Create(ObjKey),
    Update(ObjKey),
    Delete(ObjKey),
    PatchStatus(ObjKey),
}

impl Call {
    pub fn is_write(&self) -> bool {
        matches!(self, Call::Create(_) | Call::Update(_) | Call::Delete(_) | Call::PatchStatus(_))
    }
}

// (group, kind, namespace, name): version-agnostic identity
type Slot = (String, String, Option<String>, String);

fn slot(key: &ObjKey) -> Slot {
    (key.kind.group.clone(), key.kind.kind.clone(), key.namespace.clone(), key.name.clone())
}

#[derive(Default)]
struct Faults {
    conflicts: FxHashMap<Slot, u32>,
    writes: FxHashMap<Slot, StoreError>,
    lists: FxHashMap<(String, String), StoreError>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Slot, DynamicObject>,
    next_rv: u64,
    faults: Faults,
    calls: Vec<Call>,
}

impl State {
    fn bump_rv(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }
}

#[derive(Default)]
pub struct MemStore {
    state: Mutex<State>,
}

impl MemStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Persist `obj` (status included) under `key` as if it had been created earlier, bypassing faults and the call log.
    pub fn seed(&self, key: &ObjKey, obj: DynamicObject) -> DynamicObject {
        let mut st = self.lock();
        let rv = st.bump_rv();
        let status = obj.data.get("status").cloned();
        let mut stored = normalize(obj, key);
        if let (Some(status), Some(map)) = (status, stored.data.as_object_mut()) {
            map.insert("status".into(), status);
        }
        if stored.metadata.uid.is_none() {
            stored.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        stored.metadata.resource_version = Some(rv);
        if stored.metadata.creation_timestamp.is_none() {
            stored.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        }
        st.objects.insert(slot(key), stored.clone());
        stored
    }

    /// Next `n` updates of `key` lose a race against another writer.
    pub fn inject_conflicts(&self, key: &ObjKey, n: u32) {
        self.lock().faults.conflicts.insert(slot(key), n);
    }

    /// Every write to `key` fails with `err` until cleared.
    pub fn fail_writes(&self, key: &ObjKey, err: StoreError) {
        self.lock().faults.writes.insert(slot(key), err);
    }

    pub fn fail_list(&self, kind: &ResourceKind, err: StoreError) {
        self.lock().faults.lists.insert((kind.group.clone(), kind.kind.clone()), err);
    }

    pub fn clear_faults(&self) {
        self.lock().faults = Faults::default();
    }

    pub fn calls(&self) -> Vec<Call> { self.lock().calls.clone() }

    pub fn writes(&self) -> Vec<Call> { self.lock().calls.iter().filter(|c| c.is_write()).cloned().collect() }

    pub fn clear_calls(&self) { self.lock().calls.clear(); }

    pub fn object(&self, key: &ObjKey) -> Option<DynamicObject> { self.lock().objects.get(&slot(key)).cloned() }

    pub fn len(&self) -> usize { self.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.lock().objects.is_empty() }

    fn write_fault(st: &State, key: &ObjKey) -> Option<StoreError> {
        st.faults.writes.get(&slot(key)).cloned()
    }
}

/// Stamp type meta and key onto an incoming object; clients cannot write status through the main resource.
fn normalize(mut obj: DynamicObject, key: &ObjKey) -> DynamicObject {
    obj.types = Some(TypeMeta { api_version: key.kind.api_version(), kind: key.kind.kind.clone() });
    obj.metadata.name = Some(key.name.clone());
    obj.metadata.namespace = key.namespace.clone();
    if let Some(map) = obj.data.as_object_mut() {
        map.remove("status");
    } else {
        obj.data = Json::Object(Default::default());
    }
    obj
}

/// RFC 7386 merge patch.
fn merge_patch(target: &mut Json, patch: &Json) {
    let Json::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Json::Object(Default::default());
    }
    if let Json::Object(tmap) = target {
        for (k, v) in patch_map {
            if v.is_null() {
                tmap.remove(k);
            } else {
                merge_patch(tmap.entry(k.clone()).or_insert(Json::Null), v);
            }
        }
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>) -> Result<Vec<DynamicObject>, StoreError> {
        let mut st = self.lock();
        st.calls.push(Call::List(kind.clone(), namespace.map(|s| s.to_string())));
        if let Some(err) = st.faults.lists.get(&(kind.group.clone(), kind.kind.clone())) {
            return Err(err.clone());
        }
        let items: Vec<DynamicObject> = st
            .objects
            .iter()
            .filter(|((g, k, ns, _), _)| kind.same_kind(g, k) && (namespace.is_none() || ns.as_deref() == namespace))
            .map(|(_, o)| o.clone())
            .collect();
        Ok(items)
    }

    async fn get(&self, key: &ObjKey) -> Result<DynamicObject, StoreError> {
        let mut st = self.lock();
        st.calls.push(Call::Get(key.clone()));
        st.objects.get(&slot(key)).cloned().ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn create(&self, key: &ObjKey, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let mut st = self.lock();
        st.calls.push(Call::Create(key.clone()));
        if let Some(err) = Self::write_fault(&st, key) {
            return Err(err);
        }
        if st.objects.contains_key(&slot(key)) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        let mut stored = normalize(obj.clone(), key);
        stored.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        stored.metadata.resource_version = Some(st.bump_rv());
        stored.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        stored.metadata.generation = Some(1);
        st.objects.insert(slot(key), stored.clone());
        debug!(key = %key, "memstore create");
        Ok(stored)
    }

    async fn update(&self, key: &ObjKey, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let mut st = self.lock();
        st.calls.push(Call::Update(key.clone()));
        if let Some(err) = Self::write_fault(&st, key) {
            return Err(err);
        }
        let s = slot(key);
        if !st.objects.contains_key(&s) {
            return Err(StoreError::NotFound(key.to_string()));
        }
        if let Some(n) = st.faults.conflicts.get_mut(&s).filter(|n| **n > 0) {
            *n -= 1;
            // another writer got there first
            let rv = st.bump_rv();
            if let Some(cur) = st.objects.get_mut(&s) {
                cur.metadata.resource_version = Some(rv);
            }
            counter!("memstore_conflicts_total", 1u64);
            return Err(StoreError::Conflict(key.to_string()));
        }
        let Some(current) = st.objects.get(&s).cloned() else {
            return Err(StoreError::NotFound(key.to_string()));
        };
        if obj.metadata.resource_version.is_some() && obj.metadata.resource_version != current.metadata.resource_version {
            return Err(StoreError::Conflict(key.to_string()));
        }
        let mut stored = normalize(obj.clone(), key);
        stored.metadata.uid = current.metadata.uid.clone();
        stored.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
        stored.metadata.generation = Some(current.metadata.generation.unwrap_or(0) + 1);
        stored.metadata.resource_version = Some(st.bump_rv());
        if let (Some(status), Some(map)) = (current.data.get("status"), stored.data.as_object_mut()) {
            map.insert("status".into(), status.clone());
        }
        st.objects.insert(s, stored.clone());
        debug!(key = %key, "memstore update");
        Ok(stored)
    }

    async fn delete(&self, key: &ObjKey) -> Result<(), StoreError> {
        let mut st = self.lock();
        st.calls.push(Call::Delete(key.clone()));
        if let Some(err) = Self::write_fault(&st, key) {
            return Err(err);
        }
        if st.objects.remove(&slot(key)).is_none() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        debug!(key = %key, "memstore delete");
        Ok(())
    }

    async fn patch_status(&self, key: &ObjKey, status: &Json) -> Result<(), StoreError> {
        let mut st = self.lock();
        st.calls.push(Call::PatchStatus(key.clone()));
        if let Some(err) = Self::write_fault(&st, key) {
            return Err(err);
        }
        let rv = st.bump_rv();
        let Some(obj) = st.objects.get_mut(&slot(key)) else {
            return Err(StoreError::NotFound(key.to_string()));
        };
        if !obj.data.is_object() {
            obj.data = Json::Object(Default::default());
        }
        if let Some(map) = obj.data.as_object_mut() {
            merge_patch(map.entry("status").or_insert(Json::Null), status);
        }
        obj.metadata.resource_version = Some(rv);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm_key(name: &str) -> ObjKey {
        ObjKey::new(ResourceKind::new("", "v1", "ConfigMap", "configmaps"), Some("ns"), name)
    }

    fn cm(name: &str, data: Json) -> DynamicObject {
        cm_key(name).placeholder().data(json!({ "data": data }))
    }

    #[tokio::test]
    async fn create_assigns_server_fields() {
        let store = MemStore::new();
        let key = cm_key("a");
        let created = store.create(&key, &cm("a", json!({"k": "v"}))).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert!(created.metadata.creation_timestamp.is_some());
        assert_eq!(created.metadata.resource_version.as_deref(), Some("1"));
        let dup = store.create(&key, &cm("a", json!({}))).await.unwrap_err();
        assert_eq!(dup, StoreError::AlreadyExists(key.to_string()));
    }

    #[tokio::test]
    async fn stale_resource_version_conflicts() {
        let store = MemStore::new();
        let key = cm_key("a");
        let first = store.create(&key, &cm("a", json!({"k": "v1"}))).await.unwrap();
        let mut a = first.clone();
        a.data["data"]["k"] = json!("v2");
        store.update(&key, &a).await.unwrap();

        let mut stale = first;
        stale.data["data"]["k"] = json!("v3");
        assert!(store.update(&key, &stale).await.unwrap_err().is_conflict());
        assert_eq!(store.object(&key).unwrap().data["data"]["k"], json!("v2"));
    }

    #[tokio::test]
    async fn injected_conflicts_bump_version_then_clear() {
        let store = MemStore::new();
        let key = cm_key("a");
        store.create(&key, &cm("a", json!({}))).await.unwrap();
        store.inject_conflicts(&key, 1);
        let cur = store.get(&key).await.unwrap();
        assert!(store.update(&key, &cur).await.unwrap_err().is_conflict());
        let refreshed = store.get(&key).await.unwrap();
        assert_ne!(refreshed.metadata.resource_version, cur.metadata.resource_version);
        store.update(&key, &refreshed).await.unwrap();
    }

    #[tokio::test]
    async fn status_survives_spec_updates() {
        let store = MemStore::new();
        let key = cm_key("a");
        store.create(&key, &cm("a", json!({}))).await.unwrap();
        store.patch_status(&key, &json!({"ready": true, "replicas": 2})).await.unwrap();
        store.patch_status(&key, &json!({"replicas": null})).await.unwrap();
        let cur = store.get(&key).await.unwrap();
        store.update(&key, &cur).await.unwrap();
        assert_eq!(store.object(&key).unwrap().data["status"], json!({"ready": true}));
    }

    #[tokio::test]
    async fn every_call_is_logged_even_when_it_fails() {
        let store = MemStore::new();
        let key = cm_key("a");
        store.create(&key, &cm("a", json!({}))).await.unwrap();
        store.delete(&key).await.unwrap();
        assert!(store.is_empty());
        assert!(store.delete(&key).await.unwrap_err().is_not_found());
        store.fail_writes(&key, StoreError::Unavailable("down".into()));
        assert!(store.create(&key, &cm("a", json!({}))).await.is_err());
        assert!(store.is_empty());
        assert_eq!(
            store.writes(),
            vec![Call::Create(key.clone()), Call::Delete(key.clone()), Call::Delete(key.clone()), Call::Create(key.clone())]
        );
        store.clear_faults();
        store.clear_calls();
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn list_filters_by_namespace_and_faults() {
        let store = MemStore::new();
        store.seed(&cm_key("a"), cm("a", json!({})));
        let other = ObjKey::new(cm_key("b").kind, Some("other"), "b");
        store.seed(&other, other.placeholder());
        let kind = cm_key("a").kind;
        assert_eq!(store.list(&kind, Some("ns")).await.unwrap().len(), 1);
        assert_eq!(store.list(&kind, None).await.unwrap().len(), 2);
        store.fail_list(&kind, StoreError::Unavailable("down".into()));
        assert!(store.list(&kind, None).await.is_err());
    }
}
