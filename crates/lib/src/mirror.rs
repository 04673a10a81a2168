//! Local mirrors of server-owned collections.
//!
//! A [`CollectionMirror`] maps record ids to records and keeps an ordered view for
//! readers. Only the sync engine writes to mirrors; views read them through
//! [`CollectionMirror::snapshot`], which always returns an owned copy.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::records::{Asset, Collection, FeedbackItem, Project, Record, RecordId};

/// Order of the sequence returned by [`CollectionMirror::snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOrder {
    /// Load order, with records first seen later appended at the end.
    Arrival,
    /// Newest `created_at` first; records first seen later are placed ahead of
    /// older records with the same timestamp.
    NewestFirst,
}

#[derive(Debug)]
struct MirrorState<T> {
    /// id -> (position, record)
    entries: HashMap<RecordId, (i64, T)>,
    first: i64,
    next: i64,
}

impl<T> MirrorState<T> {
    fn empty() -> Self {
        Self {
            entries: HashMap::new(),
            first: 0,
            next: 0,
        }
    }
}

/// In-memory mirror of one collection.
#[derive(Debug)]
pub struct CollectionMirror<T: Record> {
    order: SnapshotOrder,
    state: RwLock<MirrorState<T>>,
}

impl<T: Record> Default for CollectionMirror<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Record> CollectionMirror<T> {
    /// Create an empty mirror ordered the way `T`'s collection is displayed.
    pub fn new() -> Self {
        let order = match T::COLLECTION {
            Collection::Feedback => SnapshotOrder::NewestFirst,
            _ => SnapshotOrder::Arrival,
        };
        Self::with_order(order)
    }

    /// Create an empty mirror whose snapshots use `order`.
    pub fn with_order(order: SnapshotOrder) -> Self {
        Self {
            order,
            state: RwLock::new(MirrorState::empty()),
        }
    }

    /// Order used by [`snapshot`](Self::snapshot).
    pub fn order(&self) -> SnapshotOrder {
        self.order
    }

    /// Discard the current content and install `records`.
    ///
    /// Later duplicates of an id overwrite earlier ones but keep the earlier position.
    pub fn replace_all(&self, records: impl IntoIterator<Item = T>) {
        let mut fresh = MirrorState::empty();
        for record in records {
            let id = record.id().clone();
            match fresh.entries.get_mut(&id) {
                Some(slot) => slot.1 = record,
                None => {
                    fresh.entries.insert(id, (fresh.next, record));
                    fresh.next += 1;
                }
            }
        }
        *self.state.write().unwrap() = fresh;
    }

    /// Insert `record`, or overwrite the record with the same id.
    ///
    /// Returns `true` when the id was not present before.
    pub fn upsert(&self, record: T) -> bool {
        let mut state = self.state.write().unwrap();
        let id = record.id().clone();
        if let Some(slot) = state.entries.get_mut(&id) {
            slot.1 = record;
            return false;
        }
        let position = match self.order {
            SnapshotOrder::Arrival => {
                let p = state.next;
                state.next += 1;
                p
            }
            SnapshotOrder::NewestFirst => {
                state.first -= 1;
                state.first
            }
        };
        state.entries.insert(id, (position, record));
        true
    }

    /// Remove the record with `id`. Removing an absent id is a no-op.
    ///
    /// Returns `true` when a record was removed.
    pub fn remove(&self, id: &RecordId) -> bool {
        self.state.write().unwrap().entries.remove(id).is_some()
    }

    pub fn get(&self, id: &RecordId) -> Option<T> {
        self.state
            .read()
            .unwrap()
            .entries
            .get(id)
            .map(|(_, record)| record.clone())
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.state.read().unwrap().entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        *self.state.write().unwrap() = MirrorState::empty();
    }

    /// Ordered copy of the current content.
    pub fn snapshot(&self) -> Vec<T> {
        let state = self.state.read().unwrap();
        let mut rows: Vec<&(i64, T)> = state.entries.values().collect();
        match self.order {
            SnapshotOrder::Arrival => rows.sort_by_key(|(position, _)| *position),
            SnapshotOrder::NewestFirst => {
                rows.sort_by_key(|(position, record)| (Reverse(record.created_at()), *position))
            }
        }
        rows.into_iter().map(|(_, record)| record.clone()).collect()
    }
}

/// The full set of mirrors kept for a session.
#[derive(Debug, Default)]
pub struct Mirrors {
    pub projects: CollectionMirror<Project>,
    pub assets: CollectionMirror<Asset>,
    pub feedback: CollectionMirror<FeedbackItem>,
}

impl Mirrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records mirrored for `collection`.
    pub fn len(&self, collection: Collection) -> usize {
        match collection {
            Collection::Projects => self.projects.len(),
            Collection::Assets => self.assets.len(),
            Collection::Feedback => self.feedback.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        Collection::ALL.iter().all(|c| self.len(*c) == 0)
    }

    pub fn clear_all(&self) {
        self.projects.clear();
        self.assets.clear();
        self.feedback.clear();
    }
}
