//! Error types for backend data access and change feeds.

use thiserror::Error;

/// Errors from bulk-loads and mutations.
///
/// # Stability
///
/// - New variants may be added in minor versions (enum is `#[non_exhaustive]`)
/// - Helper methods like `is_*()` provide stable APIs
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DataError {
    /// Bulk-load of a collection failed.
    #[error("Failed to load {collection}: {reason}")]
    QueryFailed { collection: String, reason: String },

    /// Insert or delete was rejected.
    #[error("Failed to write to {collection}: {reason}")]
    WriteFailed { collection: String, reason: String },

    /// Record with the given id does not exist.
    #[error("Record {id} not found in {collection}")]
    NotFound { collection: String, id: String },

    /// A row could not be decoded into its record type.
    #[error("Malformed record in {collection}: {reason}")]
    Malformed { collection: String, reason: String },

    /// The backend refused access to the data.
    #[error("Access denied: {reason}")]
    Unauthorized { reason: String },

    /// The backend could not be reached.
    #[error("Backend unavailable: {reason}")]
    Unavailable { reason: String },
}

impl DataError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DataError::NotFound { .. })
    }

    /// Check if a retry could succeed without any change on our side.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DataError::QueryFailed { .. } | DataError::Unavailable { .. }
        )
    }

    /// Name of the collection involved, if any.
    pub fn collection(&self) -> Option<&str> {
        match self {
            DataError::QueryFailed { collection, .. }
            | DataError::WriteFailed { collection, .. }
            | DataError::NotFound { collection, .. }
            | DataError::Malformed { collection, .. } => Some(collection),
            _ => None,
        }
    }
}

impl From<DataError> for crate::Error {
    fn from(err: DataError) -> Self {
        crate::Error::Data(err)
    }
}

/// Errors from change subscriptions.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// The subscription could not be opened.
    #[error("Failed to subscribe to {collection}: {reason}")]
    OpenFailed { collection: String, reason: String },

    /// The change stream ended or failed while delivering.
    #[error("Change stream for {collection} interrupted: {reason}")]
    Interrupted { collection: String, reason: String },

    /// An event payload could not be decoded.
    #[error("Malformed change event for {collection}: {reason}")]
    MalformedEvent { collection: String, reason: String },

    /// Resubscription attempts were exhausted.
    #[error("Change stream for {collection} failed after {attempts} attempts")]
    Exhausted { collection: String, attempts: u32 },
}

impl SubscriptionError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SubscriptionError::OpenFailed { .. } | SubscriptionError::Interrupted { .. }
        )
    }
}

impl From<SubscriptionError> for crate::Error {
    fn from(err: SubscriptionError) -> Self {
        crate::Error::Subscription(err)
    }
}
