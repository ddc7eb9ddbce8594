//! Document store contract consumed by the engine.
//!
//! The engine only needs three operations: point reads by id, upserts built
//! from `$set` / `$inc` / `$addToSet` clauses, and plain inserts. Field paths
//! are dot-separated; a segment must be non-empty and must not start with `$`.
//!
//! Implementations include:
//! - `eventagg-memory`: in-memory store for tests and development
//! - `eventagg-testing`: failure-injecting wrapper around any store

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::errors::{StoreError, StoreResult};

/// A stored document.
pub type Document = Map<String, Value>;

/// Field name holding a document's id.
pub const ID_FIELD: &str = "_id";

/// Atomic update applied to a single document.
///
/// Clauses are applied in `$set`, `$inc`, `$addToSet` order. Increments are
/// commutative, which is what lets concurrent requests update the same
/// document without coordination.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Update {
    /// Fields overwritten with the given value.
    #[serde(rename = "$set", skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, Value>,
    /// Numeric fields incremented by the given amount.
    #[serde(rename = "$inc", skip_serializing_if = "BTreeMap::is_empty")]
    pub inc: BTreeMap<String, f64>,
    /// Array fields extended with the values not already present.
    #[serde(rename = "$addToSet", skip_serializing_if = "BTreeMap::is_empty")]
    pub add_to_set: BTreeMap<String, Vec<Value>>,
}

impl Update {
    /// Create an empty update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a `$set` clause.
    #[must_use]
    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        let _ = self.set.insert(path.into(), value.into());
        self
    }

    /// Add an `$inc` clause, summing with any increment already on the path.
    #[must_use]
    pub fn inc(mut self, path: impl Into<String>, amount: f64) -> Self {
        *self.inc.entry(path.into()).or_insert(0.0) += amount;
        self
    }

    /// Add an `$addToSet` / `$each` clause.
    #[must_use]
    pub fn add_each<I, V>(mut self, path: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let entry = self.add_to_set.entry(path.into()).or_default();
        for value in values {
            let value = value.into();
            if !entry.contains(&value) {
                entry.push(value);
            }
        }
        self
    }

    /// True when the update has no clauses.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.inc.is_empty() && self.add_to_set.is_empty()
    }

    /// Every field path touched by the update.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.set
            .keys()
            .chain(self.inc.keys())
            .chain(self.add_to_set.keys())
            .map(String::as_str)
    }

    /// Check every path against the field naming rules.
    pub fn validate_paths(&self) -> StoreResult<()> {
        self.paths().try_for_each(validate_path)
    }
}

/// Reject a dot-separated path with an empty segment or a `$`-prefixed one.
pub fn validate_path(path: &str) -> StoreResult<()> {
    let valid = !path.is_empty()
        && path
            .split('.')
            .all(|segment| !segment.is_empty() && !segment.starts_with('$'));

    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidFieldPath(path.to_string()))
    }
}

/// Trait defining the contract for document store implementations.
///
/// Every method is a single-document operation. The store guarantees that
/// each update is atomic for its document; nothing spans documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch one document by id.
    ///
    /// `projection` lists the top-level fields to return; empty means all.
    /// The id field is always included.
    async fn find_one(
        &self,
        collection: &str,
        id: &str,
        projection: &[&str],
    ) -> StoreResult<Option<Document>>;

    /// Apply `update` to the document with `id`.
    ///
    /// With `upsert` a missing document is created first; without it an update
    /// to a missing document is a successful no-op.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        update: &Update,
        upsert: bool,
    ) -> StoreResult<()>;

    /// Insert a new document. The document must carry an `_id`.
    async fn insert(&self, collection: &str, document: Document) -> StoreResult<()>;
}
