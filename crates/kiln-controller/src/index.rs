//! Cross-kind dependency index
//!
//! Reconcilers record which objects they depend on (a Model on its base Model
//! and training Dataset, a Server on its Model, a Notebook on its Model and
//! Dataset). Secondary watches consult the index to find which dependents to
//! re-reconcile when a dependency changes.

use std::collections::BTreeSet;
use std::fmt;

use dashmap::DashMap;

use kiln_common::ObjectKind;

/// Namespaced identity of a Kiln object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Kind
    pub kind: ObjectKind,
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl ObjectKey {
    /// Create a key
    pub fn new(kind: ObjectKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Dependency edges between Kiln objects
#[derive(Debug, Default)]
pub struct DependencyIndex {
    /// dependent -> its dependencies
    forward: DashMap<ObjectKey, BTreeSet<ObjectKey>>,
    /// dependency -> objects depending on it
    reverse: DashMap<ObjectKey, BTreeSet<ObjectKey>>,
}

impl DependencyIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the dependencies of `dependent`
    pub fn record(&self, dependent: &ObjectKey, dependencies: impl IntoIterator<Item = ObjectKey>) {
        let next: BTreeSet<ObjectKey> = dependencies.into_iter().collect();
        let previous = self
            .forward
            .insert(dependent.clone(), next.clone())
            .unwrap_or_default();

        for gone in previous.difference(&next) {
            if let Some(mut dependents) = self.reverse.get_mut(gone) {
                dependents.remove(dependent);
            }
            self.reverse.remove_if(gone, |_, dependents| dependents.is_empty());
        }
        for added in next.difference(&previous) {
            self.reverse
                .entry(added.clone())
                .or_default()
                .insert(dependent.clone());
        }
    }

    /// Drop every edge out of `dependent`
    pub fn forget(&self, dependent: &ObjectKey) {
        self.record(dependent, std::iter::empty());
        self.forward.remove(dependent);
    }

    /// Names of objects of `kind` depending on `dependency`, sorted
    pub fn dependents(&self, dependency: &ObjectKey, kind: ObjectKind) -> Vec<String> {
        self.reverse
            .get(dependency)
            .map(|dependents| {
                dependents
                    .iter()
                    .filter(|key| key.kind == kind)
                    .map(|key| key.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every dependent with recorded dependencies
    pub fn indexed(&self) -> Vec<ObjectKey> {
        self.forward.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Dependencies recorded for `dependent`
    pub fn dependencies(&self, dependent: &ObjectKey) -> Vec<ObjectKey> {
        self.forward
            .get(dependent)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }
}
