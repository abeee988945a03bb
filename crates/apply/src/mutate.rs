//! Policy-driven merge of a desired object into the persisted one.
//!
//! Every kind shares the same metadata rules: labels and annotations merge additively
//! (desired wins per key), and a non-empty desired owner-reference list replaces the
//! existing one. Spec fields follow the kind's [`MutationPolicy`].

use std::collections::BTreeMap;

use kube::core::DynamicObject;
use serde_json::{Map, Value as Json};
use tether_core::{render_path, FieldPath, Immutable, ImmutableFieldChange, KeyError, KindRegistry, MutationPolicy};

use crate::diff::{is_blank, opt_eq};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MutateError {
    #[error(transparent)]
    Immutable(#[from] ImmutableFieldChange),
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Look up the kind's policy and merge `desired` into `existing`.
pub fn mutate(registry: &KindRegistry, existing: &mut DynamicObject, desired: &DynamicObject) -> Result<(), MutateError> {
    let spec = registry.spec_for(desired)?;
    apply_policy(&spec.policy, existing, desired)?;
    Ok(())
}

/// Merge `desired` into `existing` under `policy`.
///
/// Set-once rules are checked only when `existing` has been persisted. On error
/// `existing` is left untouched.
pub fn apply_policy(
    policy: &MutationPolicy,
    existing: &mut DynamicObject,
    desired: &DynamicObject,
) -> Result<(), ImmutableFieldChange> {
    let mut want = desired.data.clone();
    if existing.metadata.creation_timestamp.is_some() {
        check_immutable(policy.immutable, &existing.data, &mut want)?;
    }

    let mut next = existing.clone();
    merge_labels(&mut next.metadata.labels, desired.metadata.labels.as_ref());
    merge_labels(&mut next.metadata.annotations, desired.metadata.annotations.as_ref());
    if let Some(refs) = desired.metadata.owner_references.as_ref().filter(|r| !r.is_empty()) {
        next.metadata.owner_references = Some(refs.clone());
    }

    if !next.data.is_object() {
        next.data = Json::Object(Map::new());
    }
    for path in policy.replace {
        set_path(&mut next.data, path, get_path(&want, path).cloned());
    }
    for rule in policy.immutable {
        match rule {
            Immutable::Field(path) | Immutable::ClaimTemplates { path, .. } => {
                set_path(&mut next.data, path, get_path(&want, path).cloned())
            }
            Immutable::SelectorLabels { .. } => {}
        }
    }
    if let Some(template) = policy.pod_template {
        merge_pod_template(&mut next.data, &want, template);
    }

    *existing = next;
    Ok(())
}

fn check_immutable(rules: &[Immutable], existing: &Json, want: &mut Json) -> Result<(), ImmutableFieldChange> {
    for rule in rules {
        match *rule {
            Immutable::Field(path) => {
                if !opt_eq(get_path(existing, path), get_path(want, path)) {
                    return Err(changed(path));
                }
            }
            Immutable::SelectorLabels { selector, template_labels } => {
                let Some(sel) = get_path(existing, selector).and_then(Json::as_object) else { continue };
                let labels = get_path(want, template_labels).and_then(Json::as_object);
                let kept = sel.iter().all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v));
                if !kept {
                    return Err(changed(template_labels));
                }
            }
            Immutable::ClaimTemplates { path, backfilled } => {
                let have = get_path(existing, path).and_then(Json::as_array).cloned().unwrap_or_default();
                let Some(Json::Array(wanted)) = get_path_mut(want, path) else {
                    if have.is_empty() {
                        continue;
                    }
                    return Err(changed(path));
                };
                if wanted.len() != have.len() {
                    return Err(changed(path));
                }
                for (w, h) in wanted.iter_mut().zip(&have) {
                    backfill(w, h, backfilled);
                    let same = ["name", "labels", "annotations"]
                        .iter()
                        .all(|f| opt_eq(w.pointer(&format!("/metadata/{f}")), h.pointer(&format!("/metadata/{f}"))))
                        && opt_eq(w.get("spec"), h.get("spec"));
                    if !same {
                        return Err(changed(path));
                    }
                }
            }
        }
    }
    Ok(())
}

/// Server-defaulted claim spec keys left unset in desired take the persisted value.
fn backfill(wanted: &mut Json, have: &Json, keys: &[&str]) {
    for key in keys {
        let unset = wanted.pointer(&format!("/spec/{key}")).map_or(true, |v| is_blank(v) || v == "");
        let Some(value) = have.pointer(&format!("/spec/{key}")).filter(|v| !is_blank(v)) else { continue };
        if unset {
            set_path(wanted, &["spec", *key], Some(value.clone()));
        }
    }
}

fn changed(path: FieldPath) -> ImmutableFieldChange {
    ImmutableFieldChange { field: render_path(path) }
}

fn merge_pod_template(data: &mut Json, want: &Json, template: FieldPath) {
    for section in ["labels", "annotations"] {
        let path: Vec<&str> = template.iter().copied().chain(["metadata", section]).collect();
        let merged = merge_json_maps(get_path(data, &path), get_path(want, &path));
        set_path(data, &path, merged);
    }
    let spec: Vec<&str> = template.iter().copied().chain(["spec"]).collect();
    set_path(data, &spec, get_path(want, &spec).cloned());
}

/// Additive map merge: keys only in `existing` survive, desired wins per key.
pub fn merge_labels(existing: &mut Option<BTreeMap<String, String>>, desired: Option<&BTreeMap<String, String>>) {
    let Some(desired) = desired.filter(|d| !d.is_empty()) else { return };
    existing.get_or_insert_with(BTreeMap::new).extend(desired.iter().map(|(k, v)| (k.clone(), v.clone())));
}

fn merge_json_maps(existing: Option<&Json>, desired: Option<&Json>) -> Option<Json> {
    let mut out = existing.and_then(Json::as_object).cloned().unwrap_or_default();
    if let Some(d) = desired.and_then(Json::as_object) {
        out.extend(d.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    if out.is_empty() {
        return existing.cloned();
    }
    Some(Json::Object(out))
}

pub fn get_path<'a>(v: &'a Json, path: &[&str]) -> Option<&'a Json> {
    path.iter().try_fold(v, |cur, seg| cur.get(*seg))
}

fn get_path_mut<'a>(v: &'a mut Json, path: &[&str]) -> Option<&'a mut Json> {
    path.iter().try_fold(v, |cur, seg| cur.get_mut(*seg))
}

/// Set the value at `path`, creating intermediate maps; `None` removes the leaf.
pub fn set_path(v: &mut Json, path: &[&str], value: Option<Json>) {
    let Some((leaf, parents)) = path.split_last() else { return };
    let mut cur = v;
    for seg in parents {
        if value.is_none() && cur.get(*seg).is_none() {
            return;
        }
        if !cur.is_object() {
            *cur = Json::Object(Map::new());
        }
        let Json::Object(map) = cur else { return };
        cur = map.entry(seg.to_string()).or_insert_with(|| Json::Object(Map::new()));
    }
    if !cur.is_object() {
        if value.is_none() {
            return;
        }
        *cur = Json::Object(Map::new());
    }
    let Json::Object(map) = cur else { return };
    match value {
        Some(v) => {
            map.insert(leaf.to_string(), v);
        }
        None => {
            map.remove(*leaf);
        }
    }
}
