//! Error taxonomy shared by the store, mutation and reconcile layers.

use std::fmt;

use crate::ObjKey;

/// Store failures. `NotFound` and `Conflict` must stay distinguishable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict writing {0}: the object has been modified")]
    Conflict(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("{key} is invalid: {reason}")]
    Invalid { key: String, reason: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound(_)) }

    pub fn is_conflict(&self) -> bool { matches!(self, Self::Conflict(_)) }

    /// Losing an optimistic-concurrency race: a stale version token or a concurrent create.
    pub fn is_retryable(&self) -> bool { matches!(self, Self::Conflict(_) | Self::AlreadyExists(_)) }
}

/// A persisted object would have a set-once field changed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("immutable field change attempted: {field}")]
pub struct ImmutableFieldChange {
    pub field: String,
}

/// An object could not be mapped onto the kind registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("object has no apiVersion/kind")]
    MissingType,
    #[error("{0} object has no metadata.name")]
    MissingName(String),
    #[error("no mutation policy registered for kind {0}")]
    Unsupported(String),
}

/// What the engine was doing to an object when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    CreateOrUpdate,
    Recreate,
    Prune,
    OwnerRef,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::CreateOrUpdate => "create-or-update",
            Action::Recreate => "recreate",
            Action::Prune => "prune",
            Action::OwnerRef => "owner-ref",
        };
        f.write_str(s)
    }
}

/// One object's failure within a batch. The source keeps its concrete type for downcasting.
#[derive(Debug, thiserror::Error)]
#[error("{action} {key}: {source}")]
pub struct ObjectError {
    pub key: ObjKey,
    pub action: Action,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl ObjectError {
    pub fn new<E>(key: ObjKey, action: Action, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self { key, action, source: Box::new(source) }
    }

    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.source.downcast_ref::<E>()
    }
}

/// Accumulated per-object failures of one pass, in the order they happened.
#[derive(Debug, Default)]
pub struct ErrorSet {
    errors: Vec<ObjectError>,
}

impl ErrorSet {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, err: ObjectError) { self.errors.push(err); }

    pub fn len(&self) -> usize { self.errors.len() }

    pub fn is_empty(&self) -> bool { self.errors.is_empty() }

    pub fn iter(&self) -> std::slice::Iter<'_, ObjectError> { self.errors.iter() }

    /// `Ok(())` when nothing failed, otherwise the whole set.
    pub fn into_result(self) -> Result<(), ErrorSet> {
        if self.errors.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl Extend<ObjectError> for ErrorSet {
    fn extend<T: IntoIterator<Item = ObjectError>>(&mut self, iter: T) { self.errors.extend(iter); }
}

impl IntoIterator for ErrorSet {
    type Item = ObjectError;
    type IntoIter = std::vec::IntoIter<ObjectError>;
    fn into_iter(self) -> Self::IntoIter { self.errors.into_iter() }
}

impl<'a> IntoIterator for &'a ErrorSet {
    type Item = &'a ObjectError;
    type IntoIter = std::slice::Iter<'a, ObjectError>;
    fn into_iter(self) -> Self::IntoIter { self.errors.iter() }
}

impl fmt::Display for ErrorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} object(s) failed", self.errors.len())?;
        for e in &self.errors {
            write!(f, "\n  - {}", e)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorSet {}
