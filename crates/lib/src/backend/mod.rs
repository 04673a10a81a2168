//! The external collaborator: authentication, collection storage and change feeds.
//!
//! The sync engine only depends on the traits in this module. Two implementations
//! are provided:
//!
//! * [`InMemoryBackend`]: an in-process backend with per-user row scoping, live
//!   change feeds and fault injection. Used for tests and local development.
//! * [`RestBackend`]: a hosted auth + REST data API reached over HTTP, with change
//!   feeds produced by polling.

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::{
    Result,
    reconcile::{ChangeEvent, ChangeKind},
    records::{Collection, OrderBy, RecordId},
    session::Session,
};

mod errors;
pub mod in_memory;
pub mod poll;
pub mod rest;

pub use errors::{DataError, SubscriptionError};
pub use in_memory::InMemoryBackend;
pub use rest::RestBackend;

/// Item delivered on a change subscription.
pub type FeedItem = std::result::Result<ChangeEvent, SubscriptionError>;

/// Authentication half of the collaborator.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Session persisted by the backend client, if any.
    async fn get_session(&self) -> Result<Option<Session>>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session>;

    /// Create an account. Email verification happens out of band.
    async fn sign_up(&self, email: &str, password: &str) -> Result<()>;

    async fn sign_out(&self) -> Result<()>;

    /// Stream of session changes originating in the backend (refresh, revocation).
    ///
    /// Fires at most once per actual change. No ordering is guaranteed relative to
    /// in-flight local calls.
    fn on_session_change(&self) -> broadcast::Receiver<Option<Session>>;
}

/// Query and mutation half of the collaborator.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Every row of `collection` visible to the session's user.
    async fn select_all(
        &self,
        session: &Session,
        collection: Collection,
        order: Option<OrderBy>,
    ) -> Result<Vec<Value>>;

    /// Insert one row. The backend assigns the id.
    async fn insert(&self, session: &Session, collection: Collection, record: Value) -> Result<()>;

    async fn delete_by_id(&self, session: &Session, collection: Collection, id: &RecordId) -> Result<()>;
}

/// Change-notification half of the collaborator.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a change subscription for `collection`.
    ///
    /// Delivery is at-least-once and ordered within the subscription only.
    async fn subscribe(
        &self,
        session: &Session,
        collection: Collection,
        filter: EventFilter,
    ) -> Result<Subscription>;

    /// Stop delivery for a subscription. Unknown ids are ignored.
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;
}

/// A complete collaborator.
pub trait Backend: AuthProvider + DataSource + ChangeFeed {}

impl<T: AuthProvider + DataSource + ChangeFeed> Backend for T {}

/// Which change kinds a subscription delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventFilter {
    #[default]
    All,
    Only(ChangeKind),
}

impl EventFilter {
    pub fn admits(&self, kind: ChangeKind) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Only(only) => *only == kind,
        }
    }

    /// Filter used by the portal for each collection.
    ///
    /// The feedback log only ever grows from the portal's point of view.
    pub fn for_collection(collection: Collection) -> Self {
        match collection {
            Collection::Feedback => EventFilter::Only(ChangeKind::Insert),
            _ => EventFilter::All,
        }
    }
}

/// Identifier of an open subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Handle for an open change subscription.
///
/// Events are received with [`Subscription::next`]. Dropping the handle stops
/// delivery as well; backends notice the closed channel on their next send.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    collection: Collection,
    events: mpsc::UnboundedReceiver<FeedItem>,
}

impl Subscription {
    pub fn new(
        id: SubscriptionId,
        collection: Collection,
        events: mpsc::UnboundedReceiver<FeedItem>,
    ) -> Self {
        Self {
            id,
            collection,
            events,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    /// Next event, or `None` once the backend closed the stream.
    pub async fn next(&mut self) -> Option<FeedItem> {
        self.events.recv().await
    }
}
