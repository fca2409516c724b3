//! In-process document store.
//!
//! Documents are kept as raw JSON, the way a managed document database holds
//! them, and every typed read and write goes through [`Document::validate`].
//! Writers to a single document are serialized by the map entry lock and each
//! committed write is published on a broadcast channel that backs
//! [`Subscription`] streams.

mod subscription;

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{AppError, FieldError};

pub use subscription::{ChangeEvent, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Orders,
    DeliveryTracking,
    Drivers,
    Cooks,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Orders => "orders",
            Collection::DeliveryTracking => "delivery_tracking",
            Collection::Drivers => "drivers",
            Collection::Cooks => "cooks",
        }
    }
}

/// A typed view over one collection's JSON documents.
pub trait Document: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const COLLECTION: Collection;

    fn id(&self) -> String;

    fn validate(&self) -> Result<(), Vec<FieldError>> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RawChange {
    pub collection: Collection,
    pub id: String,
    pub revision: u64,
    /// `None` when the document was removed.
    pub data: Option<Value>,
}

struct StoredDocument {
    data: Value,
    revision: u64,
}

type DocKey = (Collection, String);

pub struct DocumentStore {
    documents: DashMap<DocKey, StoredDocument>,
    revision: AtomicU64,
    changes_tx: broadcast::Sender<RawChange>,
}

impl DocumentStore {
    pub fn new(event_buffer_size: usize) -> Self {
        let (changes_tx, _unused_rx) = broadcast::channel(event_buffer_size.max(1));

        Self {
            documents: DashMap::new(),
            revision: AtomicU64::new(0),
            changes_tx,
        }
    }

    pub fn len(&self, collection: Collection) -> usize {
        self.documents
            .iter()
            .filter(|entry| entry.key().0 == collection)
            .count()
    }

    pub fn get<D: Document>(&self, id: &str) -> Result<Option<D>, AppError> {
        let Some(stored) = self.documents.get(&(D::COLLECTION, id.to_string())) else {
            return Ok(None);
        };

        decode::<D>(id, &stored.data).map(Some)
    }

    /// Like [`DocumentStore::get`] but a missing document is an error.
    pub fn fetch<D: Document>(&self, id: &str) -> Result<D, AppError> {
        self.get::<D>(id)?.ok_or_else(|| {
            AppError::NotFound(format!("{} {} not found", singular(D::COLLECTION), id))
        })
    }

    /// Writes the whole document, replacing any previous version.
    pub fn set<D: Document>(&self, document: &D) -> Result<u64, AppError> {
        let data = encode(document)?;
        let key = (D::COLLECTION, document.id());

        match self.documents.entry(key) {
            Entry::Occupied(mut occupied) => {
                let revision = self.commit(D::COLLECTION, &occupied.key().1, Some(data.clone()));
                occupied.insert(StoredDocument { data, revision });
                Ok(revision)
            }
            Entry::Vacant(vacant) => {
                let revision = self.commit(D::COLLECTION, &vacant.key().1, Some(data.clone()));
                vacant.insert(StoredDocument { data, revision });
                Ok(revision)
            }
        }
    }

    /// Writes the document only if no document with the same id exists.
    pub fn create<D: Document>(&self, document: &D) -> Result<u64, AppError> {
        let data = encode(document)?;
        let key = (D::COLLECTION, document.id());

        match self.documents.entry(key) {
            Entry::Occupied(occupied) => Err(AppError::Conflict(format!(
                "{} {} already exists",
                singular(D::COLLECTION),
                occupied.key().1
            ))),
            Entry::Vacant(vacant) => {
                let revision = self.commit(D::COLLECTION, &vacant.key().1, Some(data.clone()));
                vacant.insert(StoredDocument { data, revision });
                Ok(revision)
            }
        }
    }

    /// Read-modify-write of a single document under its entry lock.
    pub fn update<D, F>(&self, id: &str, apply: F) -> Result<D, AppError>
    where
        D: Document,
        F: FnOnce(&mut D) -> Result<(), AppError>,
    {
        let mut stored = self
            .documents
            .get_mut(&(D::COLLECTION, id.to_string()))
            .ok_or_else(|| {
                AppError::NotFound(format!("{} {} not found", singular(D::COLLECTION), id))
            })?;

        let mut document = decode::<D>(id, &stored.data)?;
        apply(&mut document)?;
        let data = encode(&document)?;

        stored.revision = self.commit(D::COLLECTION, id, Some(data.clone()));
        stored.data = data;
        Ok(document)
    }

    /// Deep-merges `patch` into the stored document. The merged result must
    /// still decode and validate as `D` or nothing is written.
    pub fn merge<D: Document>(&self, id: &str, patch: Value) -> Result<D, AppError> {
        if !patch.is_object() {
            return Err(AppError::BadRequest("merge patch must be a JSON object".to_string()));
        }

        let mut stored = self
            .documents
            .get_mut(&(D::COLLECTION, id.to_string()))
            .ok_or_else(|| {
                AppError::NotFound(format!("{} {} not found", singular(D::COLLECTION), id))
            })?;

        let mut merged = stored.data.clone();
        merge_values(&mut merged, patch);

        let document: D = serde_json::from_value(merged.clone())
            .map_err(|err| AppError::BadRequest(format!("merged document is invalid: {err}")))?;
        document.validate().map_err(AppError::Validation)?;

        stored.revision = self.commit(D::COLLECTION, id, Some(merged.clone()));
        stored.data = merged;
        Ok(document)
    }

    pub fn delete<D: Document>(&self, id: &str) -> bool {
        let key = (D::COLLECTION, id.to_string());
        match self.documents.entry(key) {
            Entry::Occupied(occupied) => {
                self.commit(D::COLLECTION, id, None);
                occupied.remove();
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    pub fn query<D: Document>(&self) -> Query<'_, D> {
        Query {
            store: self,
            filters: Vec::new(),
            limit: None,
            _marker: PhantomData,
        }
    }

    /// Stores untyped data as-is, the way another client of a shared store
    /// might. Typed reads still validate it.
    pub fn put_raw(&self, collection: Collection, id: &str, data: Value) -> u64 {
        let key = (collection, id.to_string());
        match self.documents.entry(key) {
            Entry::Occupied(mut occupied) => {
                let revision = self.commit(collection, id, Some(data.clone()));
                occupied.insert(StoredDocument { data, revision });
                revision
            }
            Entry::Vacant(vacant) => {
                let revision = self.commit(collection, id, Some(data.clone()));
                vacant.insert(StoredDocument { data, revision });
                revision
            }
        }
    }

    /// Change stream for one document.
    pub fn subscribe<D: Document>(&self, id: &str) -> Subscription<D> {
        Subscription::new(self.changes_tx.subscribe(), Some(id.to_string()))
    }

    /// Change stream for every document in `D`'s collection.
    pub fn subscribe_collection<D: Document>(&self) -> Subscription<D> {
        Subscription::new(self.changes_tx.subscribe(), None)
    }

    /// Must be called while the entry for `id` is locked so that the
    /// broadcast order matches the write order for that document.
    fn commit(&self, collection: Collection, id: &str, data: Option<Value>) -> u64 {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            collection = collection.as_str(),
            id,
            revision,
            removed = data.is_none(),
            "document committed"
        );

        // No receivers is the normal idle case.
        let _ = self.changes_tx.send(RawChange {
            collection,
            id: id.to_string(),
            revision,
            data,
        });
        revision
    }
}

type Predicate<'a, D> = Box<dyn Fn(&D) -> bool + 'a>;

/// Composite filter over one collection. All filters must match.
pub struct Query<'a, D: Document> {
    store: &'a DocumentStore,
    filters: Vec<Predicate<'a, D>>,
    limit: Option<usize>,
    _marker: PhantomData<D>,
}

impl<'a, D: Document> Query<'a, D> {
    pub fn filter(mut self, predicate: impl Fn(&D) -> bool + 'a) -> Self {
        self.filters.push(Box::new(predicate));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Documents that fail validation are skipped and logged.
    pub fn fetch(self) -> Vec<D> {
        let mut results = Vec::new();

        for entry in self.store.documents.iter() {
            let (collection, id) = entry.key();
            if *collection != D::COLLECTION {
                continue;
            }

            let document = match decode::<D>(id, &entry.value().data) {
                Ok(document) => document,
                Err(err) => {
                    warn!(collection = collection.as_str(), id = %id, error = %err, "skipping invalid document");
                    continue;
                }
            };

            if self.filters.iter().all(|predicate| predicate(&document)) {
                results.push(document);
                if self.limit.is_some_and(|limit| results.len() >= limit) {
                    break;
                }
            }
        }

        results
    }
}

fn encode<D: Document>(document: &D) -> Result<Value, AppError> {
    document.validate().map_err(AppError::Validation)?;
    Ok(serde_json::to_value(document)?)
}

pub(crate) fn decode<D: Document>(id: &str, data: &Value) -> Result<D, AppError> {
    let document: D = serde_json::from_value(data.clone()).map_err(|err| {
        AppError::Internal(format!(
            "{}/{} does not match its schema: {err}",
            D::COLLECTION.as_str(),
            id
        ))
    })?;

    document.validate().map_err(|errors| {
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        AppError::Internal(format!(
            "{}/{} failed validation on {}",
            D::COLLECTION.as_str(),
            id,
            fields.join(", ")
        ))
    })?;

    Ok(document)
}

fn merge_values(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_values(existing, value)
                    }
                    _ => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

fn singular(collection: Collection) -> &'static str {
    match collection {
        Collection::Orders => "order",
        Collection::DeliveryTracking => "tracking for order",
        Collection::Drivers => "driver",
        Collection::Cooks => "cook",
    }
}
