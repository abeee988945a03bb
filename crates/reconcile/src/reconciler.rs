//! One owner's reconcile pass: apply every desired object, recover from set-once field
//! changes, then prune whatever the owner no longer wants.
//!
//! Objects are processed sequentially; a failing object never stops its siblings and
//! every failure is reported together at the end.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::core::DynamicObject;
use metrics::{counter, histogram};
use serde::Serialize;
use tether_apply::{apply_desired, OperationResult};
use tether_core::{
    split_api_version, Action, ErrorSet, KeyError, KindFilter, KindRegistry, KindSpec, ObjKey, ObjectError, OwnedSet,
    Owner, ResourceKind, StoreError,
};
use tether_kubehub::ObjectStore;
use tracing::{debug, info, warn};

use crate::config::ReconcileConfig;
use crate::owned::find_owned;
use crate::status::{aggregate, StatusError, StatusIssue, Summary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Created,
    Updated,
    Unchanged,
    /// A set-once field changed; the persisted object was deleted and the next pass recreates it.
    ImmutableConflict,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::Updated => "updated",
            Outcome::Unchanged => "unchanged",
            Outcome::ImmutableConflict => "immutable-conflict",
            Outcome::Failed => "failed",
        }
    }
}

impl From<OperationResult> for Outcome {
    fn from(r: OperationResult) -> Self {
        match r {
            OperationResult::Created => Outcome::Created,
            OperationResult::Updated => Outcome::Updated,
            OperationResult::Unchanged => Outcome::Unchanged,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectOutcome {
    pub key: ObjKey,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Owned objects found going into the pass.
    pub owned: usize,
    pub expected: usize,
    pub objects: Vec<ObjectOutcome>,
    pub pruned: Vec<ObjKey>,
}

impl ReconcileReport {
    pub fn count(&self, outcome: Outcome) -> usize { self.objects.iter().filter(|o| o.outcome == outcome).count() }

    pub fn outcome(&self, key: &ObjKey) -> Option<Outcome> {
        self.objects.iter().find(|o| o.key == *key).map(|o| o.outcome)
    }

    /// Some object was deleted to change a set-once field and still has to be recreated.
    pub fn recreating(&self) -> bool { self.count(Outcome::ImmutableConflict) > 0 }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// A desired object cannot be reconciled at all; nothing was written.
    #[error("invalid desired object: {0}")]
    Config(#[from] KeyError),
    #[error("finding owned objects: {0}")]
    Index(#[from] StoreError),
    #[error(transparent)]
    Batch(ErrorSet),
}

impl ReconcileError {
    pub fn batch(&self) -> Option<&ErrorSet> {
        match self {
            ReconcileError::Batch(set) => Some(set),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OwnerRefError {
    #[error("already controlled by {kind} {name}")]
    Controlled { kind: String, name: String },
    #[error("object in namespace {namespace} cannot reference an owner in {owner_namespace}")]
    CrossNamespace { namespace: String, owner_namespace: String },
}

/// Make `owner` the controller of a namespaced object, defaulting its namespace to the owner's.
/// References to other, non-controlling owners are kept.
pub fn set_controller_ref(owner: &Owner, obj: &mut DynamicObject) -> Result<(), OwnerRefError> {
    let ns = obj.metadata.namespace.get_or_insert_with(|| owner.namespace.clone());
    if *ns != owner.namespace {
        return Err(OwnerRefError::CrossNamespace { namespace: ns.clone(), owner_namespace: owner.namespace.clone() });
    }
    let refs = obj.metadata.owner_references.get_or_insert_with(Vec::new);
    if let Some(other) = refs.iter().find(|r| r.controller == Some(true) && r.uid != owner.uid) {
        return Err(OwnerRefError::Controlled { kind: other.kind.clone(), name: other.name.clone() });
    }
    refs.retain(|r| r.uid != owner.uid);
    refs.push(owner.controller_ref());
    Ok(())
}

/// Drop `key` (and the object just written, by uid) from the prune candidates.
fn release(owned: &mut OwnedSet, registry: &KindRegistry, key: &ObjKey, uid: Option<&str>) {
    if let Some(uid) = uid {
        owned.remove(uid);
    }
    owned.retain(|_, o| registry.key_of(o).map_or(true, |k| k != *key));
}

/// Key for an object whose kind the registry does not know, for error reports only.
fn unregistered_key(obj: &DynamicObject) -> ObjKey {
    let (api_version, kind) = obj.types.as_ref().map_or(("", ""), |t| (t.api_version.as_str(), t.kind.as_str()));
    let (group, version) = split_api_version(api_version);
    let kind = ResourceKind::new(group, version, kind, &format!("{}s", kind.to_lowercase()));
    ObjKey::new(kind, obj.metadata.namespace.as_deref(), obj.metadata.name.as_deref().unwrap_or_default())
}

pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    registry: Arc<KindRegistry>,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ObjectStore>, registry: Arc<KindRegistry>, config: ReconcileConfig) -> Self {
        Self { store, registry, config }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> { &self.store }

    pub fn registry(&self) -> &KindRegistry { &self.registry }

    pub fn config(&self) -> &ReconcileConfig { &self.config }

    /// Objects referencing `owner` across the kinds `filter` admits.
    pub async fn find_owned(&self, owner: &Owner, filter: &KindFilter) -> Result<OwnedSet, StoreError> {
        find_owned(self.store.as_ref(), owner, &self.registry.kinds(filter)).await
    }

    fn plan<'r>(&'r self, owner: &Owner, desired: &DynamicObject) -> Result<(&'r KindSpec, ObjKey, DynamicObject), KeyError> {
        let spec = self.registry.spec_for(desired)?;
        let name = desired.metadata.name.as_deref().ok_or_else(|| KeyError::MissingName(spec.kind.kind.clone()))?;
        let mut obj = desired.clone();
        obj.metadata.namespace = if spec.namespaced() {
            Some(desired.metadata.namespace.clone().unwrap_or_else(|| owner.namespace.clone()))
        } else {
            None
        };
        let key = ObjKey::new(spec.kind.clone(), obj.metadata.namespace.as_deref(), name);
        Ok((spec, key, obj))
    }

    /// Reconcile `desired` against `owned` and prune what is left over.
    ///
    /// Every desired object is checked against the registry before anything is written; an
    /// unknown kind fails the whole call. Per-object failures, including prune failures, come
    /// back together as [`ReconcileError::Batch`].
    pub async fn reconcile(
        &self,
        owner: &Owner,
        desired: &[DynamicObject],
        mut owned: OwnedSet,
    ) -> Result<ReconcileReport, ReconcileError> {
        let t0 = Instant::now();
        let plan = desired.iter().map(|d| self.plan(owner, d)).collect::<Result<Vec<_>, _>>()?;
        info!(owner = %owner.key(), owned = owned.len(), expected = plan.len(), "reconciling");

        let mut report = ReconcileReport { owned: owned.len(), expected: plan.len(), ..Default::default() };
        let mut errors = ErrorSet::new();

        for (spec, key, mut obj) in plan {
            if spec.namespaced() {
                if let Err(e) = set_controller_ref(owner, &mut obj) {
                    warn!(object = %key, error = %e, "cannot set owner reference");
                    release(&mut owned, &self.registry, &key, None);
                    errors.push(ObjectError::new(key.clone(), Action::OwnerRef, e));
                    report.objects.push(ObjectOutcome { key, outcome: Outcome::Failed });
                    continue;
                }
            }

            let outcome = match apply_desired(self.store.as_ref(), &self.registry, &self.config.retry, &key, &obj).await {
                Ok(applied) => {
                    release(&mut owned, &self.registry, &key, applied.object.metadata.uid.as_deref());
                    let outcome = Outcome::from(applied.result);
                    if applied.result.wrote() {
                        info!(kind = %key.kind.kind, namespace = ?key.namespace, name = %key.name, result = outcome.as_str(), "applied");
                    } else {
                        debug!(kind = %key.kind.kind, namespace = ?key.namespace, name = %key.name, "unchanged");
                    }
                    outcome
                }
                Err(err) => {
                    release(&mut owned, &self.registry, &key, None);
                    match err.immutable() {
                        Some(change) => {
                            warn!(object = %key, field = %change.field, "set-once field changed; deleting for recreation");
                            match self.store.delete(&key).await {
                                Ok(()) => Outcome::ImmutableConflict,
                                Err(e) if e.is_not_found() => Outcome::ImmutableConflict,
                                Err(e) => {
                                    warn!(object = %key, error = %e, "delete for recreation failed");
                                    errors.push(ObjectError::new(key.clone(), Action::Recreate, e));
                                    Outcome::Failed
                                }
                            }
                        }
                        None => {
                            warn!(object = %key, error = %err, "create-or-update failed");
                            errors.push(ObjectError::new(key.clone(), Action::CreateOrUpdate, err));
                            Outcome::Failed
                        }
                    }
                }
            };
            counter!("reconcile_objects_total", 1u64, "result" => outcome.as_str());
            report.objects.push(ObjectOutcome { key, outcome });
        }

        let (pruned, prune_errors) = self.prune(&owned).await;
        report.pruned = pruned;
        errors.extend(prune_errors);

        histogram!("reconcile_pass_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(
            owner = %owner.key(),
            created = report.count(Outcome::Created),
            updated = report.count(Outcome::Updated),
            unchanged = report.count(Outcome::Unchanged),
            recreating = report.count(Outcome::ImmutableConflict),
            pruned = report.pruned.len(),
            failed = errors.len(),
            "reconcile pass finished"
        );
        if errors.is_empty() {
            return Ok(report);
        }
        counter!("reconcile_errors_total", errors.len() as u64);
        Err(ReconcileError::Batch(errors))
    }

    async fn prune(&self, owned: &OwnedSet) -> (Vec<ObjKey>, ErrorSet) {
        let mut pruned = Vec::new();
        let mut errors = ErrorSet::new();
        for obj in owned.values() {
            let key = match self.registry.key_of(obj) {
                Ok(k) => k,
                Err(e) => {
                    let key = unregistered_key(obj);
                    warn!(object = %key, error = %e, "cannot prune an unregistered kind");
                    errors.push(ObjectError::new(key, Action::Prune, e));
                    continue;
                }
            };
            match self.store.delete(&key).await {
                Ok(()) => {
                    info!(kind = %key.kind.kind, namespace = ?key.namespace, name = %key.name, "pruned");
                    counter!("reconcile_pruned_total", 1u64);
                    pruned.push(key);
                }
                Err(e) if e.is_not_found() => debug!(object = %key, "already gone"),
                Err(e) => {
                    warn!(object = %key, error = %e, "prune failed");
                    errors.push(ObjectError::new(key, Action::Prune, e));
                }
            }
        }
        (pruned, errors)
    }

    /// Best-effort delete of every object in `owned`; failures do not stop the rest.
    pub async fn delete_objects(&self, owned: &OwnedSet) -> Result<Vec<ObjKey>, ErrorSet> {
        let (pruned, errors) = self.prune(owned).await;
        errors.into_result().map(|()| pruned)
    }

    /// Delete everything `owner` owns across the kinds `filter` admits.
    pub async fn cleanup(&self, owner: &Owner, filter: &KindFilter) -> Result<Vec<ObjKey>, ReconcileError> {
        let owned = self.find_owned(owner, filter).await?;
        info!(owner = %owner.key(), owned = owned.len(), "cleaning up");
        self.delete_objects(&owned).await.map_err(ReconcileError::Batch)
    }

    /// Index and reconcile repeatedly until a pass succeeds with nothing left to recreate,
    /// or `max_passes` is used up. Returns the last pass's result.
    pub async fn converge(
        &self,
        owner: &Owner,
        filter: &KindFilter,
        desired: &[DynamicObject],
        max_passes: u32,
        interval: Duration,
    ) -> Result<ReconcileReport, ReconcileError> {
        let passes = max_passes.max(1);
        let mut pass = 1;
        loop {
            let result = match self.find_owned(owner, filter).await {
                Ok(owned) => self.reconcile(owner, desired, owned).await,
                Err(e) => Err(e.into()),
            };
            let settled = match &result {
                Ok(report) => !report.recreating(),
                Err(ReconcileError::Config(_)) => true,
                Err(_) => false,
            };
            if settled || pass >= passes {
                return result;
            }
            debug!(owner = %owner.key(), pass, "not converged yet");
            pass += 1;
            tokio::time::sleep(interval).await;
        }
    }

    /// Roll up the owner's workloads and merge the summary into its status.
    ///
    /// The summary is written even when components are not ready. `version` falls back to
    /// `declared_version` when no component carries a parseable one.
    pub async fn reconcile_status(&self, owner: &Owner, declared_version: Option<&str>) -> Result<Summary, StatusError> {
        let workloads: Vec<&KindSpec> = self.registry.iter().filter(|s| s.workload).collect();
        let owned = find_owned(self.store.as_ref(), owner, &workloads)
            .await
            .map_err(|e| StatusError { summary: None, issues: vec![StatusIssue::Index(e)] })?;

        let agg = aggregate(&self.config.status, owned.values());
        let mut summary = agg.summary;
        if summary.version.is_none() {
            summary.version = declared_version.map(str::to_string);
        }
        let mut issues: Vec<StatusIssue> = agg.version_errors.into_iter().map(StatusIssue::Version).collect();
        if !summary.ready {
            counter!("status_not_ready_total", 1u64);
            issues.push(StatusIssue::NotReady);
        }

        let owner_key = owner.key();
        let written = match serde_json::to_value(&summary) {
            Ok(patch) => self.store.patch_status(&owner_key, &patch).await,
            Err(e) => Err(StoreError::Invalid { key: owner_key.to_string(), reason: e.to_string() }),
        };
        if let Err(e) = written {
            issues.push(StatusIssue::Write(e));
        }

        info!(
            owner = %owner_key,
            workloads = owned.len(),
            ready = summary.ready,
            initialized = summary.initialized,
            version = ?summary.version,
            "status rolled up"
        );
        if issues.is_empty() {
            return Ok(summary);
        }
        Err(StatusError { summary: Some(summary), issues })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::core::ApiResource;

    fn owner() -> Owner {
        Owner { kind: ResourceKind::new("example.dev", "v1", "Stack", "stacks"), namespace: "ns".into(), name: "s".into(), uid: "owner-1".into() }
    }

    fn service() -> DynamicObject {
        DynamicObject::new("svc", &ApiResource::erase::<k8s_openapi::api::core::v1::Service>(&()))
    }

    #[test]
    fn controller_ref_defaults_namespace_and_is_idempotent() {
        let o = owner();
        let mut obj = service();
        set_controller_ref(&o, &mut obj).unwrap();
        set_controller_ref(&o, &mut obj).unwrap();
        assert_eq!(obj.metadata.namespace.as_deref(), Some("ns"));
        assert_eq!(obj.metadata.owner_references.as_ref().map(Vec::len), Some(1));
        assert!(o.owns(&obj));
    }

    #[test]
    fn foreign_controller_and_cross_namespace_are_refused() {
        let o = owner();
        let mut obj = service();
        obj.metadata.owner_references =
            Some(vec![OwnerReference { kind: "ReplicaSet".into(), name: "rs".into(), uid: "other".into(), controller: Some(true), ..Default::default() }]);
        assert_eq!(
            set_controller_ref(&o, &mut obj),
            Err(OwnerRefError::Controlled { kind: "ReplicaSet".into(), name: "rs".into() })
        );

        let mut elsewhere = service().within("other");
        assert!(matches!(set_controller_ref(&o, &mut elsewhere), Err(OwnerRefError::CrossNamespace { .. })));
    }

    #[test]
    fn outcomes_use_kebab_case_names() {
        assert_eq!(serde_json::to_value(Outcome::ImmutableConflict).unwrap(), serde_json::json!("immutable-conflict"));
        assert_eq!(Outcome::from(OperationResult::Unchanged), Outcome::Unchanged);
    }
}
