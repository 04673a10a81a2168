//! Change detection by snapshot comparison.
//!
//! Backends without a push channel produce change events by polling a collection
//! and diffing consecutive snapshots. The resulting events are applied through the
//! same reconciler as pushed events, so a diff only needs to be correct, not minimal.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use super::EventFilter;
use crate::{
    reconcile::{Change, ChangeEvent, ChangeKind},
    records::{Collection, RecordId},
};

/// Compute the events that turn `previous` into `next`.
///
/// Inserts and updates are emitted in `next` order, followed by deletes in
/// `previous` order. Rows without a usable `id` are skipped.
pub fn diff_snapshots(
    collection: Collection,
    previous: &[Value],
    next: &[Value],
    filter: EventFilter,
) -> Vec<ChangeEvent> {
    let before: HashMap<RecordId, &Value> = previous
        .iter()
        .filter_map(|row| RecordId::from_record(row).map(|id| (id, row)))
        .collect();

    let mut events = Vec::new();
    let mut seen = HashSet::with_capacity(next.len());
    for row in next {
        let Some(id) = RecordId::from_record(row) else {
            continue;
        };
        let change = match before.get(&id) {
            None => Some(Change::Insert(row.clone())),
            Some(old) if *old != row => Some(Change::Update(row.clone())),
            Some(_) => None,
        };
        seen.insert(id);
        if let Some(change) = change
            && filter.admits(change.kind())
        {
            events.push(ChangeEvent::new(collection, change));
        }
    }

    for row in previous {
        let Some(id) = RecordId::from_record(row) else {
            continue;
        };
        if filter.admits(ChangeKind::Delete) && seen.insert(id.clone()) {
            events.push(ChangeEvent::delete(collection, id));
        }
    }
    events
}
