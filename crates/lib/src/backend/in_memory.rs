//! In-memory backend implementation
//!
//! This module provides an in-process implementation of the collaborator traits,
//! suitable for testing and local development. Rows are scoped per user the way a
//! hosted backend's row-level security would scope them, and change feeds deliver
//! every committed write to matching subscribers.
//!
//! Fault injection hooks (`fail_next_*`, `duplicate_events`, `drop_events`,
//! `select_delay`) make retry, resubscription and delivery paths testable.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;
use uuid::Uuid;

use super::{
    AuthProvider, ChangeFeed, DataError, DataSource, EventFilter, FeedItem, Subscription,
    SubscriptionError, SubscriptionId,
};
use crate::{
    Result,
    clock::{Clock, SystemClock},
    reconcile::{Change, ChangeEvent},
    records::{Collection, OrderBy, RecordId},
    session::{AuthError, Session},
};

#[derive(Debug, Clone)]
struct Account {
    user_id: String,
    password: String,
    confirmed: bool,
}

#[derive(Debug)]
struct Subscriber {
    id: SubscriptionId,
    collection: Collection,
    filter: EventFilter,
    user_id: String,
    tx: mpsc::UnboundedSender<FeedItem>,
}

#[derive(Debug, Default)]
struct State {
    /// email -> account
    accounts: HashMap<String, Account>,
    /// access token -> user id
    tokens: HashMap<String, String>,
    /// Session persisted for `get_session`
    current: Option<Session>,
    tables: HashMap<Collection, Vec<Value>>,
    next_row_id: u64,
    subscribers: Vec<Subscriber>,
    next_subscription: u64,
}

#[derive(Debug, Default)]
struct Faults {
    offline: bool,
    fail_selects: u32,
    fail_writes: u32,
    fail_subscribes: u32,
    duplicate_events: bool,
    drop_events: bool,
    select_delay: Option<Duration>,
}

/// Call counters, useful for asserting what the engine asked for.
#[derive(Debug, Default)]
pub struct CallCounts {
    pub selects: AtomicUsize,
    pub inserts: AtomicUsize,
    pub deletes: AtomicUsize,
    pub subscribes: AtomicUsize,
}

impl CallCounts {
    pub fn selects(&self) -> usize {
        self.selects.load(AtomicOrdering::SeqCst)
    }

    pub fn inserts(&self) -> usize {
        self.inserts.load(AtomicOrdering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(AtomicOrdering::SeqCst)
    }

    pub fn subscribes(&self) -> usize {
        self.subscribes.load(AtomicOrdering::SeqCst)
    }

    /// Total number of collaborator calls that touch data.
    pub fn data_calls(&self) -> usize {
        self.selects() + self.inserts() + self.deletes()
    }
}

/// In-process backend.
#[derive(Debug)]
pub struct InMemoryBackend {
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    faults: Mutex<Faults>,
    session_tx: broadcast::Sender<Option<Session>>,
    calls: CallCounts,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a backend that stamps `created_at` from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (session_tx, _) = broadcast::channel(16);
        Self {
            clock,
            state: Mutex::new(State::default()),
            faults: Mutex::new(Faults::default()),
            session_tx,
            calls: CallCounts::default(),
        }
    }

    pub fn calls(&self) -> &CallCounts {
        &self.calls
    }

    // === Test and setup hooks ===

    /// Create a confirmed account and return its user id.
    pub fn add_user(&self, email: &str, password: &str) -> String {
        let user_id = Uuid::new_v4().to_string();
        self.state.lock().unwrap().accounts.insert(
            email.to_string(),
            Account {
                user_id: user_id.clone(),
                password: password.to_string(),
                confirmed: true,
            },
        );
        user_id
    }

    /// Mark a registered account as verified.
    pub fn confirm_email(&self, email: &str) -> bool {
        match self.state.lock().unwrap().accounts.get_mut(email) {
            Some(account) => {
                account.confirmed = true;
                true
            }
            None => false,
        }
    }

    /// Store rows for `user_id` without emitting change events.
    ///
    /// Rows without an `id` get one assigned. Rows keep any `user_id` they carry.
    pub fn seed(&self, collection: Collection, user_id: &str, rows: Vec<Value>) {
        let mut state = self.state.lock().unwrap();
        for row in rows {
            let row = Self::prepare_row(&mut state, &*self.clock, collection, user_id, row, false);
            state.tables.entry(collection).or_default().push(row);
        }
    }

    /// All rows stored for `collection`, across users.
    pub fn rows(&self, collection: Collection) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(&collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Write a row as if another client had inserted or updated it.
    ///
    /// Emits an `Insert` for new ids and an `Update` for existing ones.
    pub fn upsert_remote(&self, collection: Collection, user_id: &str, row: Value) {
        let mut state = self.state.lock().unwrap();
        let row = Self::prepare_row(&mut state, &*self.clock, collection, user_id, row, false);
        let id = RecordId::from_record(&row);
        let table = state.tables.entry(collection).or_default();
        let change = match table
            .iter_mut()
            .find(|existing| RecordId::from_record(existing) == id)
        {
            Some(existing) => {
                *existing = row.clone();
                Change::Update(row)
            }
            None => {
                table.push(row.clone());
                Change::Insert(row)
            }
        };
        self.broadcast(&mut state, collection, user_id, change);
    }

    /// Delete a row as if another client had removed it.
    pub fn delete_remote(&self, collection: Collection, user_id: &str, id: &RecordId) {
        let mut state = self.state.lock().unwrap();
        if let Some(table) = state.tables.get_mut(&collection) {
            table.retain(|row| RecordId::from_record(row).as_ref() != Some(id));
        }
        self.broadcast(&mut state, collection, user_id, Change::Delete(id.clone()));
    }

    /// Send a raw event to every subscriber of `collection` belonging to `user_id`.
    pub fn emit(&self, collection: Collection, user_id: &str, change: Change) {
        let mut state = self.state.lock().unwrap();
        self.broadcast(&mut state, collection, user_id, change);
    }

    /// End every open subscription for `collection` with a delivery error.
    pub fn interrupt_subscriptions(&self, collection: Collection) {
        let mut state = self.state.lock().unwrap();
        state.subscribers.retain(|sub| {
            if sub.collection != collection {
                return true;
            }
            let _ = sub.tx.send(Err(SubscriptionError::Interrupted {
                collection: collection.name().to_string(),
                reason: "connection reset".to_string(),
            }));
            false
        });
    }

    /// Revoke the current session as if it had expired on the server.
    pub fn invalidate_session(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(session) = state.current.take() {
                state.tokens.remove(&session.access_token);
            }
        }
        let _ = self.session_tx.send(None);
    }

    /// Number of open subscriptions, pruning ones whose receiver was dropped.
    pub fn open_subscriptions(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.subscribers.retain(|sub| !sub.tx.is_closed());
        state.subscribers.len()
    }

    /// Fail every query until switched off again.
    pub fn fail_all_selects(&self, enabled: bool) {
        self.faults.lock().unwrap().offline = enabled;
    }

    pub fn fail_next_selects(&self, count: u32) {
        self.faults.lock().unwrap().fail_selects = count;
    }

    pub fn fail_next_writes(&self, count: u32) {
        self.faults.lock().unwrap().fail_writes = count;
    }

    pub fn fail_next_subscribes(&self, count: u32) {
        self.faults.lock().unwrap().fail_subscribes = count;
    }

    /// Deliver every change event twice.
    pub fn duplicate_events(&self, enabled: bool) {
        self.faults.lock().unwrap().duplicate_events = enabled;
    }

    /// Stop delivering change events. Writes still land in the tables.
    pub fn drop_events(&self, enabled: bool) {
        self.faults.lock().unwrap().drop_events = enabled;
    }

    /// Delay every `select_all` response by `delay`.
    ///
    /// The rows are read when the query is issued, so writes made during the
    /// delay are not part of the response.
    pub fn select_delay(&self, delay: Option<Duration>) {
        self.faults.lock().unwrap().select_delay = delay;
    }

    // === Internals ===

    fn take_fault(counter: &mut u32) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }

    fn authorize(&self, session: &Session) -> Result<String> {
        let state = self.state.lock().unwrap();
        match state.tokens.get(&session.access_token) {
            Some(user_id) => Ok(user_id.clone()),
            None => Err(AuthError::SessionExpired.into()),
        }
    }

    fn prepare_row(
        state: &mut State,
        clock: &dyn Clock,
        collection: Collection,
        user_id: &str,
        row: Value,
        force_owner: bool,
    ) -> Value {
        let mut object = match row {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        match object.get("id").and_then(Value::as_u64) {
            Some(id) => state.next_row_id = state.next_row_id.max(id),
            None if !object.contains_key("id") => {
                state.next_row_id += 1;
                object.insert("id".to_string(), Value::from(state.next_row_id));
            }
            None => {}
        }
        if force_owner || !object.contains_key("user_id") {
            object.insert("user_id".to_string(), Value::from(user_id));
        }
        if collection == Collection::Feedback && !object.contains_key("created_at") {
            object.insert("created_at".to_string(), Value::from(clock.now_utc().to_rfc3339()));
        }
        Value::Object(object)
    }

    fn broadcast(&self, state: &mut State, collection: Collection, user_id: &str, change: Change) {
        let copies = {
            let faults = self.faults.lock().unwrap();
            if faults.drop_events {
                return;
            }
            if faults.duplicate_events { 2 } else { 1 }
        };
        let kind = change.kind();
        let event = ChangeEvent::new(collection, change);
        state.subscribers.retain(|sub| {
            if sub.collection != collection || sub.user_id != user_id || !sub.filter.admits(kind) {
                return !sub.tx.is_closed();
            }
            (0..copies).all(|_| sub.tx.send(Ok(event.clone())).is_ok())
        });
    }
}

fn compare_column(a: &Value, b: &Value, column: &str) -> Ordering {
    match (a.get(column), b.get(column)) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

#[async_trait]
impl AuthProvider for InMemoryBackend {
    async fn get_session(&self) -> Result<Option<Session>> {
        Ok(self.state.lock().unwrap().current.clone())
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let session = {
            let mut state = self.state.lock().unwrap();
            let account = match state.accounts.get(email) {
                Some(account) if account.password == password => account.clone(),
                _ => return Err(AuthError::InvalidCredentials.into()),
            };
            if !account.confirmed {
                return Err(AuthError::SignInFailed {
                    reason: "Email not confirmed".to_string(),
                }
                .into());
            }
            let token = Uuid::new_v4().to_string();
            state.tokens.insert(token.clone(), account.user_id.clone());
            let session = Session::new(token, account.user_id).with_email(email);
            state.current = Some(session.clone());
            session
        };
        let _ = self.session_tx.send(Some(session.clone()));
        Ok(session)
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.accounts.contains_key(email) {
            return Err(AuthError::UserAlreadyExists {
                email: email.to_string(),
            }
            .into());
        }
        state.accounts.insert(
            email.to_string(),
            Account {
                user_id: Uuid::new_v4().to_string(),
                password: password.to_string(),
                confirmed: false,
            },
        );
        Ok(())
    }

    async fn sign_out(&self) -> Result<()> {
        let had_session = {
            let mut state = self.state.lock().unwrap();
            match state.current.take() {
                Some(session) => {
                    state.tokens.remove(&session.access_token);
                    true
                }
                None => false,
            }
        };
        if had_session {
            let _ = self.session_tx.send(None);
        }
        Ok(())
    }

    fn on_session_change(&self) -> broadcast::Receiver<Option<Session>> {
        self.session_tx.subscribe()
    }
}

#[async_trait]
impl DataSource for InMemoryBackend {
    async fn select_all(
        &self,
        session: &Session,
        collection: Collection,
        order: Option<OrderBy>,
    ) -> Result<Vec<Value>> {
        self.calls.selects.fetch_add(1, AtomicOrdering::SeqCst);
        let (fail, delay) = {
            let mut faults = self.faults.lock().unwrap();
            let fail = faults.offline || Self::take_fault(&mut faults.fail_selects);
            (fail, faults.select_delay)
        };
        if fail {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            return Err(DataError::QueryFailed {
                collection: collection.name().to_string(),
                reason: "injected failure".to_string(),
            }
            .into());
        }

        // Rows are read when the query is issued and delivered after the delay
        let user_id = self.authorize(session)?;
        let mut rows: Vec<Value> = {
            let state = self.state.lock().unwrap();
            state
                .tables
                .get(&collection)
                .map(|table| {
                    table
                        .iter()
                        .filter(|row| row.get("user_id").and_then(Value::as_str) == Some(user_id.as_str()))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        if let Some(order) = order {
            rows.sort_by(|a, b| {
                let ord = compare_column(a, b, order.column);
                if order.descending { ord.reverse() } else { ord }
            });
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        debug!(collection = %collection, rows = rows.len(), "Served bulk load");
        Ok(rows)
    }

    async fn insert(&self, session: &Session, collection: Collection, record: Value) -> Result<()> {
        self.calls.inserts.fetch_add(1, AtomicOrdering::SeqCst);
        if Self::take_fault(&mut self.faults.lock().unwrap().fail_writes) {
            return Err(DataError::WriteFailed {
                collection: collection.name().to_string(),
                reason: "injected failure".to_string(),
            }
            .into());
        }
        let user_id = self.authorize(session)?;
        if let Some(owner) = record.get("user_id").and_then(Value::as_str)
            && owner != user_id
        {
            return Err(DataError::Unauthorized {
                reason: format!("cannot insert rows for user {owner}"),
            }
            .into());
        }

        let mut state = self.state.lock().unwrap();
        let row = Self::prepare_row(&mut state, &*self.clock, collection, &user_id, record, true);
        state.tables.entry(collection).or_default().push(row.clone());
        self.broadcast(&mut state, collection, &user_id, Change::Insert(row));
        Ok(())
    }

    async fn delete_by_id(&self, session: &Session, collection: Collection, id: &RecordId) -> Result<()> {
        self.calls.deletes.fetch_add(1, AtomicOrdering::SeqCst);
        if Self::take_fault(&mut self.faults.lock().unwrap().fail_writes) {
            return Err(DataError::WriteFailed {
                collection: collection.name().to_string(),
                reason: "injected failure".to_string(),
            }
            .into());
        }
        let user_id = self.authorize(session)?;

        let mut state = self.state.lock().unwrap();
        let Some(table) = state.tables.get_mut(&collection) else {
            return Ok(());
        };
        let before = table.len();
        table.retain(|row| {
            RecordId::from_record(row).as_ref() != Some(id)
                || row.get("user_id").and_then(Value::as_str) != Some(user_id.as_str())
        });
        // Deleting an id that matches nothing succeeds, as a filtered DELETE would
        if table.len() != before {
            self.broadcast(&mut state, collection, &user_id, Change::Delete(id.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for InMemoryBackend {
    async fn subscribe(
        &self,
        session: &Session,
        collection: Collection,
        filter: EventFilter,
    ) -> Result<Subscription> {
        self.calls.subscribes.fetch_add(1, AtomicOrdering::SeqCst);
        if Self::take_fault(&mut self.faults.lock().unwrap().fail_subscribes) {
            return Err(SubscriptionError::OpenFailed {
                collection: collection.name().to_string(),
                reason: "injected failure".to_string(),
            }
            .into());
        }
        let user_id = self.authorize(session)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        state.next_subscription += 1;
        let id = SubscriptionId(state.next_subscription);
        state.subscribers.push(Subscriber {
            id,
            collection,
            filter,
            user_id,
            tx,
        });
        debug!(collection = %collection, subscription = %id, "Opened subscription");
        Ok(Subscription::new(id, collection, rx))
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .subscribers
            .retain(|sub| sub.id != id);
        Ok(())
    }
}
