//!
//! Portal: the client-side session and realtime synchronization engine for the
//! client portal.
//!
//! ## Core Concepts
//!
//! * **Sessions (`session::SessionStore`)**: The authenticated identity context and
//!   its generation counter. Every asynchronous result is stamped with the generation
//!   it started under so that work from an older session can be discarded.
//! * **Mirrors (`mirror::CollectionMirror`)**: Local, ordered copies of the server-owned
//!   collections (projects, assets and the feedback log).
//! * **Reconciliation (`reconcile::ChangeReconciler`)**: Idempotent application of
//!   server change events to the mirrors.
//! * **Sync engine (`sync::SyncEngine`)**: Bulk-loads the mirrors when a session
//!   appears, keeps them live through change subscriptions and tears everything down
//!   when the session goes away.
//! * **Mutation gateway (`gateway::MutationGateway`)**: Validated writes with an
//!   explicit consistency policy per mutation.
//! * **Backends (`backend::Backend`)**: The external collaborator providing auth,
//!   queries, writes and change feeds. `InMemoryBackend` and `RestBackend` are provided.

pub mod backend;
pub mod clock;
pub mod config;
pub mod gateway;
pub mod mirror;
pub mod notify;
pub mod portal;
pub mod reconcile;
pub mod records;
pub mod session;
pub mod sync;
pub mod validation;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::PortalConfig;
pub use portal::{Portal, REGISTRATION_NOTICE, SubscriptionLevel};

/// Result type used throughout the Portal library.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the Portal library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A record or payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Locally detected input problems; never reach the backend
    #[error(transparent)]
    Validation(validation::ValidationError),

    /// Login, registration and session failures
    #[error(transparent)]
    Auth(session::AuthError),

    /// Bulk-load and mutation failures reported by the backend
    #[error(transparent)]
    Data(backend::DataError),

    /// Change stream open and delivery failures
    #[error(transparent)]
    Subscription(backend::SubscriptionError),

    /// Sync engine lifecycle errors
    #[error(transparent)]
    Sync(sync::SyncError),

    /// Missing or invalid configuration
    #[error(transparent)]
    Config(config::ConfigError),
}

impl Error {
    /// Get the originating module for this error.
    pub fn module(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::Auth(_) => "session",
            Error::Data(_) => "backend",
            Error::Subscription(_) => "backend",
            Error::Sync(_) => "sync",
            Error::Config(_) => "config",
            Error::Serialize(_) => "serialize",
        }
    }

    /// Check if this error was detected locally from user input.
    pub fn is_validation_error(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    /// Check if this error is authentication-related.
    pub fn is_authentication_error(&self) -> bool {
        matches!(self, Error::Auth(_))
    }

    /// Check if this error is a backend data failure.
    pub fn is_data_error(&self) -> bool {
        matches!(self, Error::Data(_))
    }

    /// Check if this error came from a change subscription.
    pub fn is_subscription_error(&self) -> bool {
        matches!(self, Error::Subscription(_))
    }

    /// Check if this error indicates the sync engine is no longer running.
    pub fn is_engine_stopped(&self) -> bool {
        match self {
            Error::Sync(sync_err) => sync_err.is_engine_stopped(),
            _ => false,
        }
    }

    /// Check if this error indicates a resource was not found.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Data(data_err) => data_err.is_not_found(),
            _ => false,
        }
    }

    /// Check if retrying the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Data(data_err) => data_err.is_transient(),
            Error::Subscription(sub_err) => sub_err.is_transient(),
            _ => false,
        }
    }
}
