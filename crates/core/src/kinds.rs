//! Closed kind registry: every reconcilable kind carries a scope and a mutation policy.
//!
//! Adding a kind means adding one `KindSpec`; there is no other dispatch to extend.

use kube::core::DynamicObject;

use crate::error::KeyError;
use crate::{split_api_version, ObjKey, ResourceKind, Scope};

/// Path of object keys below the object's top level, e.g. `["spec", "replicas"]`.
pub type FieldPath = &'static [&'static str];

pub fn render_path(path: FieldPath) -> String {
    path.join(".")
}

/// Set-once field rules. Checked only once the object has been persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Immutable {
    /// The value at `path` must stay semantically equal.
    Field(FieldPath),
    /// Every `selector` label must still appear, with the same value, in `template_labels`.
    SelectorLabels { selector: FieldPath, template_labels: FieldPath },
    /// Per-replica storage templates. `backfilled` spec keys unset in desired inherit the persisted value.
    ClaimTemplates { path: FieldPath, backfilled: &'static [&'static str] },
}

/// Field-level merge rules for one kind. Labels, annotations and owner references
/// are handled identically for every kind and are not listed here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutationPolicy {
    /// Replaced wholesale by the desired value (removed when desired leaves it unset).
    pub replace: &'static [FieldPath],
    pub immutable: &'static [Immutable],
    /// Pod template: metadata labels/annotations merge additively, `spec` is replaced.
    pub pod_template: Option<FieldPath>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindSpec {
    pub kind: ResourceKind,
    pub scope: Scope,
    /// Exposes declared and observed replica counts.
    pub workload: bool,
    pub policy: MutationPolicy,
}

impl KindSpec {
    pub fn namespaced(&self) -> bool { self.scope == Scope::Namespaced }
}

/// Selects a subset of registered kinds. Names match either `Kind` or `group/Kind`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum KindFilter {
    #[default]
    All,
    Only(Vec<String>),
    Exclude(Vec<String>),
}

impl KindFilter {
    pub fn only<I: IntoIterator<Item = S>, S: Into<String>>(names: I) -> Self {
        Self::Only(names.into_iter().map(Into::into).collect())
    }

    pub fn exclude<I: IntoIterator<Item = S>, S: Into<String>>(names: I) -> Self {
        Self::Exclude(names.into_iter().map(Into::into).collect())
    }

    pub fn admits(&self, kind: &ResourceKind) -> bool {
        let named = |names: &[String]| {
            names.iter().any(|n| {
                n.eq_ignore_ascii_case(&kind.kind)
                    || n.split_once('/').is_some_and(|(g, k)| g == kind.group && k.eq_ignore_ascii_case(&kind.kind))
            })
        };
        match self {
            KindFilter::All => true,
            KindFilter::Only(names) => named(names),
            KindFilter::Exclude(names) => !named(names),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    specs: Vec<KindSpec>,
}

impl KindRegistry {
    pub fn new(specs: Vec<KindSpec>) -> Self {
        let mut reg = Self::default();
        for s in specs { reg.register(s); }
        reg
    }

    /// Insert or replace the entry for `(group, kind)`.
    pub fn register(&mut self, spec: KindSpec) {
        match self.specs.iter_mut().find(|s| s.kind.same_kind(&spec.kind.group, &spec.kind.kind)) {
            Some(slot) => *slot = spec,
            None => self.specs.push(spec),
        }
    }

    pub fn lookup(&self, group: &str, kind: &str) -> Option<&KindSpec> {
        self.specs.iter().find(|s| s.kind.same_kind(group, kind))
    }

    pub fn iter(&self) -> impl Iterator<Item = &KindSpec> { self.specs.iter() }

    pub fn len(&self) -> usize { self.specs.len() }

    pub fn is_empty(&self) -> bool { self.specs.is_empty() }

    pub fn kinds(&self, filter: &KindFilter) -> Vec<&KindSpec> {
        self.specs.iter().filter(|s| filter.admits(&s.kind)).collect()
    }

    /// Registry entry for an object, by its `apiVersion`/`kind`.
    pub fn spec_for(&self, obj: &DynamicObject) -> Result<&KindSpec, KeyError> {
        let types = obj.types.as_ref().ok_or(KeyError::MissingType)?;
        let (group, _) = split_api_version(&types.api_version);
        self.lookup(group, &types.kind)
            .ok_or_else(|| KeyError::Unsupported(format!("{}/{}", types.api_version, types.kind)))
    }

    /// Store key for an object. Namespaces on cluster-scoped kinds are dropped.
    pub fn key_of(&self, obj: &DynamicObject) -> Result<ObjKey, KeyError> {
        let spec = self.spec_for(obj)?;
        let name = obj.metadata.name.as_deref().ok_or_else(|| KeyError::MissingName(spec.kind.kind.clone()))?;
        let ns = if spec.namespaced() { obj.metadata.namespace.as_deref() } else { None };
        Ok(ObjKey::new(spec.kind.clone(), ns, name))
    }
}
