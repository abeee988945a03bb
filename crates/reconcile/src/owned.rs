//! Ownership index: which persisted objects reference a given owner.

use tether_core::{KindSpec, OwnedSet, Owner, StoreError};
use tether_kubehub::ObjectStore;
use tracing::{debug, trace};

/// List every kind in `kinds` (namespaced kinds in the owner's namespace, cluster kinds
/// everywhere) and keep the objects whose owner references name `owner.uid`.
///
/// Any list failure aborts the whole index: a partial owned set would under-prune.
pub async fn find_owned<S>(store: &S, owner: &Owner, kinds: &[&KindSpec]) -> Result<OwnedSet, StoreError>
where
    S: ObjectStore + ?Sized,
{
    let mut owned = OwnedSet::new();
    for spec in kinds {
        let ns = spec.namespaced().then_some(owner.namespace.as_str());
        let items = store.list(&spec.kind, ns).await?;
        let listed = items.len();
        for obj in items.into_iter().filter(|o| owner.owns(o)) {
            if let Some(uid) = obj.metadata.uid.clone() {
                owned.insert(uid, obj);
            }
        }
        trace!(kind = %spec.kind, listed, "indexed kind");
    }
    debug!(owner = %owner.key(), owned = owned.len(), kinds = kinds.len(), "ownership index built");
    Ok(owned)
}
