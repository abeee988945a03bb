//! Tether core types: object identity, owners and the kind registry.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::{ApiResource, DynamicObject};
use serde::{Deserialize, Serialize};

pub mod error;
pub mod kinds;

pub use error::{Action, ErrorSet, ImmutableFieldChange, KeyError, ObjectError, StoreError};
pub use kinds::{render_path, FieldPath, Immutable, KindFilter, KindRegistry, KindSpec, MutationPolicy};

/// Store-assigned unique identifier (`metadata.uid`).
pub type Uid = String;

/// Objects owned by one owner across a set of candidate kinds, keyed by uid.
/// Ordered so that pruning walks objects deterministically.
pub type OwnedSet = BTreeMap<Uid, DynamicObject>;

/// A served kind. Identity is `(group, kind)`; `version` and `plural` address the API.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
}

impl ResourceKind {
    pub fn new(group: &str, version: &str, kind: &str, plural: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string(), plural: plural.to_string() }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: self.api_version(),
            kind: self.kind.clone(),
            plural: self.plural.clone(),
        }
    }

    /// Same `(group, kind)` regardless of the served version.
    pub fn same_kind(&self, group: &str, kind: &str) -> bool {
        self.group == group && self.kind == kind
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

/// Split an `apiVersion` into `(group, version)`; the core group is empty.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Namespaced,
    Cluster,
}

/// Store key of a managed object. Cluster-scoped kinds never carry a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjKey {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjKey {
    pub fn new(kind: ResourceKind, namespace: Option<&str>, name: &str) -> Self {
        Self { kind, namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    /// Zero-value typed object for this key, to be populated by a store read.
    pub fn placeholder(&self) -> DynamicObject {
        let mut obj = DynamicObject::new(&self.name, &self.kind.api_resource()).data(serde_json::json!({}));
        obj.metadata.namespace = self.namespace.clone();
        obj
    }
}

impl fmt::Display for ObjKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind.kind, self.name),
        }
    }
}

/// Parent entity on whose behalf objects are created. Owners are never created here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
    pub uid: Uid,
}

impl Owner {
    /// Build an owner handle from a persisted object; `None` when the object has no uid yet.
    pub fn from_object(kind: ResourceKind, obj: &DynamicObject) -> Option<Self> {
        let uid = obj.metadata.uid.clone()?;
        let name = obj.metadata.name.clone()?;
        Some(Self { kind, namespace: obj.metadata.namespace.clone().unwrap_or_default(), name, uid })
    }

    pub fn key(&self) -> ObjKey {
        ObjKey::new(self.kind.clone(), Some(&self.namespace), &self.name)
    }

    /// Controller back-link placed on namespaced objects this owner manages.
    pub fn controller_ref(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.kind.api_version(),
            kind: self.kind.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    pub fn owns(&self, obj: &DynamicObject) -> bool {
        obj.metadata
            .owner_references
            .as_ref()
            .is_some_and(|refs| refs.iter().any(|r| r.uid == self.uid))
    }
}

pub mod prelude {
    pub use super::{
        Action, ErrorSet, ImmutableFieldChange, KindFilter, KindRegistry, KindSpec, MutationPolicy, ObjKey, ObjectError,
        OwnedSet, Owner, ResourceKind, Scope, StoreError, Uid,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment() -> ResourceKind { ResourceKind::new("apps", "v1", "Deployment", "deployments") }

    #[test]
    fn api_version_omits_core_group() {
        assert_eq!(ResourceKind::new("", "v1", "Service", "services").api_version(), "v1");
        assert_eq!(deployment().api_version(), "apps/v1");
        assert_eq!(split_api_version("apps/v1"), ("apps", "v1"));
        assert_eq!(split_api_version("v1"), ("", "v1"));
    }

    #[test]
    fn placeholder_carries_key_only() {
        let key = ObjKey::new(deployment(), Some("ns"), "api");
        let obj = key.placeholder();
        assert_eq!(obj.metadata.name.as_deref(), Some("api"));
        assert_eq!(obj.metadata.namespace.as_deref(), Some("ns"));
        assert!(obj.metadata.uid.is_none());
        assert!(obj.metadata.resource_version.is_none());
        assert_eq!(obj.types.as_ref().map(|t| t.kind.as_str()), Some("Deployment"));
        assert_eq!(key.to_string(), "Deployment ns/api");
    }

    #[test]
    fn owner_recognizes_its_back_links() {
        let owner = Owner { kind: ResourceKind::new("example.dev", "v1", "Cluster", "clusters"), namespace: "ns".into(), name: "c1".into(), uid: "u-1".into() };
        let mut obj = ObjKey::new(deployment(), Some("ns"), "api").placeholder();
        assert!(!owner.owns(&obj));
        obj.metadata.owner_references = Some(vec![owner.controller_ref()]);
        assert!(owner.owns(&obj));
        let r = owner.controller_ref();
        assert_eq!(r.api_version, "example.dev/v1");
        assert_eq!(r.controller, Some(true));
    }
}
