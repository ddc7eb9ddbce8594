use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use eventagg::errors::{StoreError, StoreResult};
use eventagg::store::{Document, DocumentStore, Update, ID_FIELD};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::trace;

type Collection = BTreeMap<String, Document>;

/// Thread-safe in-memory document store for testing
#[derive(Clone, Default)]
pub struct InMemoryDocumentStore {
    // Maps collection names to their documents, keyed by id
    collections: Arc<RwLock<HashMap<String, Collection>>>,
}

impl InMemoryDocumentStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one document.
    pub fn document(&self, collection: &str, id: &str) -> Option<Document> {
        self.collections
            .read()
            .get(collection)
            .and_then(|documents| documents.get(id))
            .cloned()
    }

    /// Snapshot of every document in a collection, ordered by id.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .read()
            .get(collection)
            .map(|documents| documents.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of all collections holding at least one document.
    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Numeric field at a dot path, if present.
    pub fn number(&self, collection: &str, id: &str, path: &str) -> Option<f64> {
        let document = self.document(collection, id)?;
        let mut segments = path.split('.');
        let first = document.get(segments.next()?)?;
        segments
            .try_fold(first, |current, segment| current.as_object()?.get(segment))
            .and_then(Value::as_f64)
    }
}

fn slot<'a>(document: &'a mut Document, path: &str) -> Result<&'a mut Value, String> {
    let mut segments = path.split('.');
    let first = segments.next().unwrap_or_default();
    let mut current = document.entry(first.to_string()).or_insert(Value::Null);

    for segment in segments {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(fields) => fields.entry(segment.to_string()).or_insert(Value::Null),
            _ => return Err(format!("'{path}' crosses a non-object field")),
        };
    }
    Ok(current)
}

fn apply(document: &mut Document, update: &Update) -> Result<(), String> {
    for (path, value) in &update.set {
        *slot(document, path)? = value.clone();
    }

    for (path, amount) in &update.inc {
        let field = slot(document, path)?;
        let current = match field {
            Value::Null => 0.0,
            Value::Number(number) => number.as_f64().unwrap_or_default(),
            _ => return Err(format!("cannot increment non-numeric field '{path}'")),
        };
        *field = Value::from(current + amount);
    }

    for (path, values) in &update.add_to_set {
        let field = slot(document, path)?;
        if field.is_null() {
            *field = Value::Array(Vec::new());
        }
        let Value::Array(items) = field else {
            return Err(format!("cannot add to non-array field '{path}'"));
        };
        for value in values {
            if !items.contains(value) {
                items.push(value.clone());
            }
        }
    }

    Ok(())
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn find_one(
        &self,
        collection: &str,
        id: &str,
        projection: &[&str],
    ) -> StoreResult<Option<Document>> {
        let Some(document) = self.document(collection, id) else {
            return Ok(None);
        };
        if projection.is_empty() {
            return Ok(Some(document));
        }

        let projected = document
            .into_iter()
            .filter(|(field, _)| field == ID_FIELD || projection.contains(&field.as_str()))
            .collect();
        Ok(Some(projected))
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        update: &Update,
        upsert: bool,
    ) -> StoreResult<()> {
        update.validate_paths()?;

        let mut collections = self.collections.write();
        let existing = collections
            .get(collection)
            .and_then(|documents| documents.get(id))
            .cloned();

        // Work on a copy so a rejected update leaves the document untouched
        let mut document = match existing {
            Some(document) => document,
            None if upsert => {
                let mut fresh = Map::new();
                let _ = fresh.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
                fresh
            }
            None => return Ok(()),
        };

        apply(&mut document, update).map_err(|reason| StoreError::WriteRejected {
            collection: collection.to_string(),
            id: id.to_string(),
            reason,
        })?;

        let _ = collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), document);
        trace!(collection, id, "document updated");
        Ok(())
    }

    async fn insert(&self, collection: &str, document: Document) -> StoreResult<()> {
        let Some(id) = document.get(ID_FIELD).and_then(Value::as_str).map(str::to_string) else {
            return Err(StoreError::Malformed(format!(
                "document for '{collection}' has no string _id"
            )));
        };

        let mut collections = self.collections.write();
        let documents = collections.entry(collection.to_string()).or_default();
        if documents.contains_key(&id) {
            return Err(StoreError::DuplicateId(id));
        }
        let _ = documents.insert(id, document);
        Ok(())
    }
}
