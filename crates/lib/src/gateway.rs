//! Validated writes against the backend.
//!
//! Every mutation follows the same path: validate locally, require a session,
//! write through the backend, then restore consistency according to the
//! mutation's [`ConsistencyPolicy`]. Failures are raised on the
//! [`Notifier`](crate::notify::Notifier) and returned; the mirrors are never
//! touched directly from here.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::{
    Result,
    backend::Backend,
    notify::Notifier,
    records::{Collection, NewAsset, NewFeedback, NewProject, RecordId},
    session::{AuthError, Session, SessionStore},
    sync::SyncEngine,
    validation::require_non_empty,
};

/// How the mirrors catch up after a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyPolicy {
    /// Await a full refresh before returning.
    RefreshAfterWrite,
    /// Return immediately; the change feed delivers the new record.
    StreamConverges,
}

/// The mutations offered by the portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    CreateProject,
    DeleteProject,
    CreateAsset,
    DeleteAsset,
    SubmitFeedback,
}

impl Mutation {
    pub fn collection(&self) -> Collection {
        match self {
            Mutation::CreateProject | Mutation::DeleteProject => Collection::Projects,
            Mutation::CreateAsset | Mutation::DeleteAsset => Collection::Assets,
            Mutation::SubmitFeedback => Collection::Feedback,
        }
    }
}

/// Consistency policy used for `mutation`.
pub fn policy_for(mutation: Mutation) -> ConsistencyPolicy {
    match mutation {
        Mutation::SubmitFeedback => ConsistencyPolicy::StreamConverges,
        _ => ConsistencyPolicy::RefreshAfterWrite,
    }
}

/// Entry point for user-initiated writes.
#[derive(Clone)]
pub struct MutationGateway {
    backend: Arc<dyn Backend>,
    sessions: Arc<SessionStore>,
    engine: Arc<SyncEngine>,
    notifier: Notifier,
}

impl MutationGateway {
    pub fn new(
        backend: Arc<dyn Backend>,
        sessions: Arc<SessionStore>,
        engine: Arc<SyncEngine>,
        notifier: Notifier,
    ) -> Self {
        Self {
            backend,
            sessions,
            engine,
            notifier,
        }
    }

    /// Create a project named `name` with status `active`.
    pub async fn create_project(&self, name: &str) -> Result<()> {
        let name = require_non_empty("Project name", name)?;
        self.run(Mutation::CreateProject, |session| {
            Ok(serde_json::to_value(NewProject {
                name,
                user_id: &session.user_id,
                status: "active",
            })?)
        })
        .await
    }

    pub async fn delete_project(&self, id: impl Into<RecordId>) -> Result<()> {
        self.delete(Mutation::DeleteProject, id.into()).await
    }

    /// Create an asset of type `kind` with an empty value.
    pub async fn create_asset(&self, kind: &str) -> Result<()> {
        let kind = require_non_empty("Asset type", kind)?;
        self.run(Mutation::CreateAsset, |session| {
            Ok(serde_json::to_value(NewAsset {
                kind,
                user_id: &session.user_id,
                value: json!({}),
            })?)
        })
        .await
    }

    pub async fn delete_asset(&self, id: impl Into<RecordId>) -> Result<()> {
        self.delete(Mutation::DeleteAsset, id.into()).await
    }

    /// Append `text` to the feedback log.
    pub async fn submit_feedback(&self, text: &str) -> Result<()> {
        let text = require_non_empty("Feedback", text)?;
        self.run(Mutation::SubmitFeedback, |session| {
            Ok(serde_json::to_value(NewFeedback {
                text,
                user_id: &session.user_id,
            })?)
        })
        .await
    }

    async fn delete(&self, mutation: Mutation, id: RecordId) -> Result<()> {
        require_non_empty("Record id", id.as_str())?;
        let session = self.require_session()?;
        let collection = mutation.collection();
        debug!(%collection, %id, "Deleting record");
        let result = self.backend.delete_by_id(&session, collection, &id).await;
        self.finish(mutation, result).await
    }

    async fn run<F>(&self, mutation: Mutation, build: F) -> Result<()>
    where
        F: FnOnce(&Session) -> Result<Value>,
    {
        let session = self.require_session()?;
        let collection = mutation.collection();
        let result = match build(&session) {
            Ok(record) => {
                debug!(%collection, "Inserting record");
                self.backend.insert(&session, collection, record).await
            }
            Err(e) => Err(e),
        };
        self.finish(mutation, result).await
    }

    fn require_session(&self) -> Result<Session> {
        match self.sessions.current().session() {
            Some(session) => Ok(session.clone()),
            None => {
                let err = AuthError::NotAuthenticated.into();
                self.notifier.raise_error(&err);
                Err(err)
            }
        }
    }

    async fn finish(&self, mutation: Mutation, result: Result<()>) -> Result<()> {
        if let Err(e) = result {
            warn!(?mutation, "Mutation failed: {e}");
            self.notifier.raise_error(&e);
            return Err(e);
        }
        info!(?mutation, "Mutation committed");

        match policy_for(mutation) {
            ConsistencyPolicy::RefreshAfterWrite => {
                // The write itself succeeded; a failed refresh is retried by the engine
                if let Err(e) = self.engine.refresh().await {
                    warn!(?mutation, "Refresh after write failed: {e}");
                }
            }
            ConsistencyPolicy::StreamConverges => {}
        }
        Ok(())
    }
}
