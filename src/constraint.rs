//! Uniqueness constraints for live entities
//!
//! A [`ConstraintIndex`] keeps one hash set per dimension. Entities declare the
//! fields that must be unique among live instances of their dimension; a
//! registration either claims every field hash or none. The returned
//! [`ConstraintGuard`] gives the hashes back when the entity goes away.

use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{PoolError, Result};

/// One declared constraint field and the hash of its value
#[derive(Debug, Clone, PartialEq, Eq)]
struct ConstraintField {
    label: String,
    hash: u64,
}

/// The constraint fields of one entity
///
/// A field is either a single value or a group of values hashed jointly,
/// which makes the group unique as a whole (composite uniqueness). Each hash
/// is salted with the field label, so distinct fields never collide.
#[derive(Debug, Clone, Default)]
pub struct ConstraintSet {
    fields: Vec<ConstraintField>,
}

impl ConstraintSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a single-value field
    pub fn field<T: Hash + ?Sized>(mut self, name: &str, value: &T) -> Self {
        self.fields.push(ConstraintField {
            label: name.to_string(),
            hash: salted_hash(name, value),
        });
        self
    }

    /// Add a composite field; pass the values as a tuple
    pub fn group<T: Hash>(mut self, names: &[&str], values: T) -> Self {
        let label = names.join("+");
        self.fields.push(ConstraintField {
            hash: salted_hash(&label, &values),
            label,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn hashes(&self) -> Vec<u64> {
        self.fields.iter().map(|f| f.hash).collect()
    }

    fn describe(&self) -> String {
        self.fields
            .iter()
            .map(|f| f.label.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn salted_hash<T: Hash + ?Sized>(label: &str, value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    label.hash(&mut hasher);
    value.hash(&mut hasher);
    hasher.finish()
}

/// Per-dimension storage of live constraint hashes
///
/// Cloning is cheap and every clone shares the same storage. Pass one index
/// to every constructor that must honour the same uniqueness domain; tests
/// create their own to stay isolated.
#[derive(Clone, Default)]
pub struct ConstraintIndex {
    dimensions: Arc<DashMap<String, HashSet<u64>>>,
}

impl ConstraintIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim every field of `set` in `dimension`
    ///
    /// Fails with [`PoolError::DuplicateConstraint`] when any field is already
    /// held by a live entity; nothing is registered in that case.
    pub fn register(&self, dimension: &str, set: &ConstraintSet) -> Result<ConstraintGuard> {
        let hashes = set.hashes();

        {
            // entry lock is held for the whole check-and-insert
            let mut live = self.dimensions.entry(dimension.to_string()).or_default();
            if hashes.iter().any(|h| live.contains(h)) {
                warn!(
                    "Constraint violation in dimension {}: ({})",
                    dimension,
                    set.describe()
                );
                return Err(PoolError::DuplicateConstraint {
                    dimension: dimension.to_string(),
                    fields: set.describe(),
                });
            }
            live.extend(hashes.iter().copied());
        }

        debug!(
            "Registered {} constraint hashes in dimension {}",
            hashes.len(),
            dimension
        );

        Ok(ConstraintGuard {
            index: self.clone(),
            dimension: dimension.to_string(),
            hashes,
            released: false,
        })
    }

    /// Remove hashes from a dimension; unknown hashes are ignored
    pub fn unregister(&self, dimension: &str, hashes: &[u64]) {
        if let Some(mut live) = self.dimensions.get_mut(dimension) {
            for hash in hashes {
                live.remove(hash);
            }
        }
    }

    /// Whether every field of `set` is currently held in `dimension`
    pub fn contains(&self, dimension: &str, set: &ConstraintSet) -> bool {
        self.dimensions
            .get(dimension)
            .map(|live| set.hashes().iter().all(|h| live.contains(h)))
            .unwrap_or(false)
    }

    /// Number of live hashes in a dimension
    pub fn len(&self, dimension: &str) -> usize {
        self.dimensions
            .get(dimension)
            .map(|live| live.len())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for ConstraintIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstraintIndex")
            .field("dimensions", &self.dimensions.len())
            .finish()
    }
}

/// Hashes claimed by one live entity; released on drop
#[derive(Debug)]
pub struct ConstraintGuard {
    index: ConstraintIndex,
    dimension: String,
    hashes: Vec<u64>,
    released: bool,
}

impl ConstraintGuard {
    pub fn dimension(&self) -> &str {
        &self.dimension
    }

    /// Give the hashes back now instead of on drop
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.index.unregister(&self.dimension, &self.hashes);
            self.released = true;
        }
    }
}

impl Drop for ConstraintGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}
