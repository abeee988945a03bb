//! Semantic comparison of object documents.
//!
//! Absent, `null`, `{}` and `[]` are the same value; numbers compare by value.

use kube::core::DynamicObject;
use serde::Serialize;
use serde_json::Value as Json;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

/// Null, an empty list, or a map whose every value is blank.
pub fn is_blank(v: &Json) -> bool {
    match v {
        Json::Null => true,
        Json::Array(a) => a.is_empty(),
        Json::Object(m) => m.values().all(is_blank),
        _ => false,
    }
}

pub fn semantic_eq(a: &Json, b: &Json) -> bool {
    match (a, b) {
        (Json::Object(x), Json::Object(y)) => {
            x.iter().all(|(k, v)| y.get(k).map_or_else(|| is_blank(v), |w| semantic_eq(v, w)))
                && y.iter().all(|(k, w)| x.contains_key(k) || is_blank(w))
        }
        (Json::Array(x), Json::Array(y)) => x.len() == y.len() && x.iter().zip(y).all(|(v, w)| semantic_eq(v, w)),
        (Json::Number(x), Json::Number(y)) => x == y || x.as_f64() == y.as_f64(),
        _ => a == b || (is_blank(a) && is_blank(b)),
    }
}

/// `semantic_eq` on optional values; a missing value is blank.
pub fn opt_eq(a: Option<&Json>, b: Option<&Json>) -> bool {
    semantic_eq(a.unwrap_or(&Json::Null), b.unwrap_or(&Json::Null))
}

/// Drop server-populated fields so that two reads of the same intent compare equal.
pub fn strip_server_fields(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        for f in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid"] {
            meta.remove(f);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

pub fn comparable(obj: &DynamicObject) -> Json {
    serde_json::to_value(obj).map(strip_server_fields).unwrap_or_default()
}

/// True when persisting `after` over `before` would change nothing.
pub fn unchanged(before: &DynamicObject, after: &DynamicObject) -> bool {
    semantic_eq(&comparable(before), &comparable(after))
}

/// Count leaf-level differences of `target` relative to `base`, ignoring blank-only changes.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        if semantic_eq(a, b) {
            return;
        }
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) => walk(av, bv, s),
                        None if !is_blank(av) => s.adds += 1,
                        None => {}
                    }
                }
                s.removes += bo.iter().filter(|(k, bv)| !ao.contains_key(*k) && !is_blank(bv)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb).filter(|(x, y)| !semantic_eq(x, y)).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, _) if is_blank(av) => s.removes += 1,
            (_, bv) if is_blank(bv) => s.adds += 1,
            _ => s.updates += 1,
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}
