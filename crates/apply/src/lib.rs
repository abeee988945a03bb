//! Tether apply: per-kind mutation policies, create-or-update and conflict retry.

#![forbid(unsafe_code)]

use kube::core::DynamicObject;
use metrics::counter;
use serde::Serialize;
use tether_core::{ImmutableFieldChange, KindRegistry, ObjKey, StoreError};
use tether_kubehub::ObjectStore;
use tracing::{debug, trace};

pub mod diff;
pub mod mutate;
pub mod policy;
pub mod retry;

pub use diff::{diff_summary, semantic_eq, DiffSummary};
pub use mutate::{apply_policy, mutate, MutateError};
pub use policy::builtin;
pub use retry::{retry_on_conflict, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationResult {
    Created,
    Updated,
    Unchanged,
}

impl OperationResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationResult::Created => "created",
            OperationResult::Updated => "updated",
            OperationResult::Unchanged => "unchanged",
        }
    }

    pub fn wrote(&self) -> bool { !matches!(self, OperationResult::Unchanged) }
}

/// Outcome of one create-or-update together with the object as the store now holds it.
#[derive(Debug, Clone)]
pub struct Applied {
    pub result: OperationResult,
    pub object: DynamicObject,
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    Mutate(#[from] MutateError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: StoreError },
}

impl ApplyError {
    /// The set-once field violation behind this error, if that is what it is.
    pub fn immutable(&self) -> Option<&ImmutableFieldChange> {
        match self {
            ApplyError::Mutate(MutateError::Immutable(c)) => Some(c),
            _ => None,
        }
    }
}

/// Desired object as it should be submitted for creation: addressed by `key`, without server-owned metadata.
pub fn fresh_for(key: &ObjKey, desired: &DynamicObject) -> DynamicObject {
    let mut obj = desired.clone();
    obj.types = Some(kube::core::TypeMeta { api_version: key.kind.api_version(), kind: key.kind.kind.clone() });
    let meta = &mut obj.metadata;
    meta.name = Some(key.name.clone());
    meta.namespace = key.namespace.clone();
    meta.uid = None;
    meta.resource_version = None;
    meta.creation_timestamp = None;
    meta.generation = None;
    meta.managed_fields = None;
    meta.deletion_timestamp = None;
    if let Some(data) = obj.data.as_object_mut() {
        data.remove("status");
    }
    obj
}

/// Read the object at `key`; create it from `desired` when absent, otherwise run `merge`
/// on the persisted copy and write it back only if something changed.
///
/// The update carries the read's `resourceVersion`, so a concurrent writer surfaces as
/// `StoreError::Conflict`. Wrap in [`retry_on_conflict`] to re-read and try again.
pub async fn create_or_update<S, F>(
    store: &S,
    key: &ObjKey,
    desired: &DynamicObject,
    merge: F,
) -> Result<Applied, ApplyError>
where
    S: ObjectStore + ?Sized,
    F: FnOnce(&mut DynamicObject) -> Result<(), MutateError>,
{
    let existing = match store.get(key).await {
        Ok(obj) => obj,
        Err(e) if e.is_not_found() => {
            let object = store.create(key, &fresh_for(key, desired)).await?;
            debug!(object = %key, "created");
            return Ok(Applied { result: OperationResult::Created, object });
        }
        Err(e) => return Err(e.into()),
    };

    let mut next = existing.clone();
    merge(&mut next)?;
    if diff::unchanged(&existing, &next) {
        trace!(object = %key, "unchanged");
        return Ok(Applied { result: OperationResult::Unchanged, object: existing });
    }

    let changes = diff_summary(&diff::comparable(&next), &diff::comparable(&existing));
    let object = store.update(key, &next).await?;
    debug!(object = %key, adds = changes.adds, updates = changes.updates, removes = changes.removes, "updated");
    Ok(Applied { result: OperationResult::Updated, object })
}

/// Create-or-update `desired` under its registered policy, retrying lost write races.
pub async fn apply_desired<S>(
    store: &S,
    registry: &KindRegistry,
    retry: &RetryPolicy,
    key: &ObjKey,
    desired: &DynamicObject,
) -> Result<Applied, ApplyError>
where
    S: ObjectStore + ?Sized,
{
    let policy = registry.spec_for(desired).map_err(MutateError::from)?.policy;
    let applied = retry_on_conflict(retry, || {
        create_or_update(store, key, desired, move |existing| apply_policy(&policy, existing, desired).map_err(Into::into))
    })
    .await?;
    counter!("apply_objects_total", 1u64, "result" => applied.result.as_str());
    Ok(applied)
}
