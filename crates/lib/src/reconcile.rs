//! Reconciliation of change events into mirrors.
//!
//! [`ChangeReconciler`] maps one [`ChangeEvent`] to exactly one mirror call:
//! inserts and updates become `upsert`, deletes become `remove`. Because both are
//! idempotent, replaying an event leaves the mirror unchanged, which is what makes
//! at-least-once delivery from the change feed safe.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::{
    Result,
    backend::{DataError, SubscriptionError},
    mirror::{CollectionMirror, Mirrors},
    records::{Collection, Record, RecordId},
};

/// One change delivered by a change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Backend table name. Kept as a string so unknown collections can be skipped.
    pub collection: String,
    pub change: Change,
}

/// The change carried by a [`ChangeEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "UPPERCASE")]
pub enum Change {
    Insert(Value),
    Update(Value),
    Delete(RecordId),
}

/// Kind of change, used by subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl Change {
    pub fn kind(&self) -> ChangeKind {
        match self {
            Change::Insert(_) => ChangeKind::Insert,
            Change::Update(_) => ChangeKind::Update,
            Change::Delete(_) => ChangeKind::Delete,
        }
    }
}

impl ChangeEvent {
    pub fn new(collection: Collection, change: Change) -> Self {
        Self {
            collection: collection.name().to_string(),
            change,
        }
    }

    pub fn insert(collection: Collection, record: Value) -> Self {
        Self::new(collection, Change::Insert(record))
    }

    pub fn update(collection: Collection, record: Value) -> Self {
        Self::new(collection, Change::Update(record))
    }

    pub fn delete(collection: Collection, id: impl Into<RecordId>) -> Self {
        Self::new(collection, Change::Delete(id.into()))
    }

    /// The known collection this event targets, if any.
    pub fn target(&self) -> Option<Collection> {
        Collection::from_name(&self.collection)
    }
}

/// Outcome of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Upserted,
    Removed,
    /// The event was for a collection this client does not mirror.
    UnknownCollection,
    /// The record belongs to a different user and was dropped.
    ForeignOwner,
}

/// Applies change events and bulk loads to a set of mirrors on behalf of one user.
#[derive(Debug, Clone)]
pub struct ChangeReconciler {
    mirrors: Arc<Mirrors>,
    owner: Option<String>,
}

impl ChangeReconciler {
    /// Create a reconciler that only admits records owned by `owner`.
    ///
    /// Records that carry no owner are admitted; the backend scopes rows per user.
    pub fn new(mirrors: Arc<Mirrors>, owner: Option<String>) -> Self {
        Self { mirrors, owner }
    }

    pub fn mirrors(&self) -> &Arc<Mirrors> {
        &self.mirrors
    }

    fn admits(&self, record_owner: Option<&str>) -> bool {
        match (self.owner.as_deref(), record_owner) {
            (Some(expected), Some(actual)) => expected == actual,
            _ => true,
        }
    }

    /// Apply one change event.
    pub fn apply(&self, event: &ChangeEvent) -> Result<Applied> {
        let Some(collection) = event.target() else {
            debug!(collection = %event.collection, "Ignoring change for unknown collection");
            return Ok(Applied::UnknownCollection);
        };
        match collection {
            Collection::Projects => self.apply_to(&self.mirrors.projects, &event.change),
            Collection::Assets => self.apply_to(&self.mirrors.assets, &event.change),
            Collection::Feedback => self.apply_to(&self.mirrors.feedback, &event.change),
        }
    }

    fn apply_to<T: Record>(&self, mirror: &CollectionMirror<T>, change: &Change) -> Result<Applied> {
        let collection = T::COLLECTION.name();
        match change {
            Change::Insert(raw) | Change::Update(raw) => {
                let record: T = serde_json::from_value(raw.clone()).map_err(|e| {
                    SubscriptionError::MalformedEvent {
                        collection: collection.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                if !self.admits(record.owner()) {
                    warn!(collection, id = %record.id(), "Dropping change for a record owned by another user");
                    return Ok(Applied::ForeignOwner);
                }
                trace!(collection, id = %record.id(), "Upserting record");
                mirror.upsert(record);
                Ok(Applied::Upserted)
            }
            Change::Delete(id) => {
                trace!(collection, id = %id, "Removing record");
                mirror.remove(id);
                Ok(Applied::Removed)
            }
        }
    }

    /// Replace the mirror for `collection` with a bulk-loaded row set.
    ///
    /// Every row is decoded before the mirror is touched, so a malformed row leaves
    /// the previous content in place. Returns the number of records installed.
    pub fn replace(&self, collection: Collection, rows: Vec<Value>) -> Result<usize> {
        match collection {
            Collection::Projects => self.replace_in(&self.mirrors.projects, rows),
            Collection::Assets => self.replace_in(&self.mirrors.assets, rows),
            Collection::Feedback => self.replace_in(&self.mirrors.feedback, rows),
        }
    }

    fn replace_in<T: Record>(&self, mirror: &CollectionMirror<T>, rows: Vec<Value>) -> Result<usize> {
        let collection = T::COLLECTION.name();
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let record: T = serde_json::from_value(row).map_err(|e| DataError::Malformed {
                collection: collection.to_string(),
                reason: e.to_string(),
            })?;
            if self.admits(record.owner()) {
                records.push(record);
            } else {
                warn!(collection, id = %record.id(), "Dropping loaded record owned by another user");
            }
        }
        let count = records.len();
        mirror.replace_all(records);
        Ok(count)
    }
}
