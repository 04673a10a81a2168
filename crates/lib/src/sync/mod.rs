//! Realtime synchronization of the collection mirrors.
//!
//! [`SyncEngine`] is a thin handle around a background task that owns every
//! mirror mutation. The task reacts to session changes from the
//! [`SessionStore`](crate::session::SessionStore):
//!
//! * a session appears: bulk-load every collection concurrently, replace the
//!   mirrors, open one change subscription per collection, go [`SyncState::Live`];
//! * the session goes away: abort loads and subscriptions, clear the mirrors,
//!   go [`SyncState::Idle`].
//!
//! Every asynchronous result is stamped with the session generation it was started
//! under and discarded if the generation has moved on.
//!
//! ## State machine
//!
//! ```text
//!  Idle ──session──▶ Loading ──load ok──▶ Live
//!                     │  ▲                 │
//!        3 failures   │  └─────refresh─────┘
//!                     ▼  │
//!                  Suspended ──refresh──▶ Loading
//! ```
//!
//! Session loss returns to `Idle` from any state.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::{
    Result,
    backend::Backend,
    config::SyncConfig,
    mirror::Mirrors,
    notify::Notifier,
    session::{SessionChange, SessionStore},
};

mod background;
mod error;
mod fence;
mod retry;

use background::{EngineCommand, SyncWorker};
use fence::MirrorFence;
pub use error::SyncError;
pub use retry::RetryPolicy;

/// Lifecycle state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// No session; mirrors are empty
    #[default]
    Idle,
    /// Bulk-loading, or waiting to retry a failed load
    Loading,
    /// Mirrors are loaded and change subscriptions are open
    Live,
    /// Loading failed too many times; waits for a manual refresh
    Suspended,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Idle => "idle",
            SyncState::Loading => "loading",
            SyncState::Live => "live",
            SyncState::Suspended => "suspended",
        };
        f.write_str(name)
    }
}

/// Published engine status.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncStatus {
    pub state: SyncState,
    /// Session generation the engine is working for
    pub generation: u64,
    /// Most recent load failure, cleared when a load succeeds
    pub last_error: Option<String>,
}

/// Handle to the sync engine task.
///
/// Dropping the handle stops the engine.
#[derive(Debug)]
pub struct SyncEngine {
    commands: mpsc::UnboundedSender<EngineCommand>,
    status: watch::Receiver<SyncStatus>,
    mirrors: Arc<Mirrors>,
}

impl SyncEngine {
    /// Start the engine and attach it to `sessions`.
    ///
    /// A session that is already active is picked up immediately. The mirrors
    /// are cleared inside every identity change, before the store returns.
    pub fn start(
        backend: Arc<dyn Backend>,
        sessions: &SessionStore,
        mirrors: Arc<Mirrors>,
        notifier: Notifier,
        config: SyncConfig,
    ) -> Self {
        let fence = Arc::new(MirrorFence::new(mirrors.clone()));
        let (commands, status) =
            SyncWorker::start(backend, mirrors.clone(), fence.clone(), notifier, config);

        let observer_tx = commands.clone();
        let observer_fence = fence.clone();
        sessions.subscribe(Arc::new(move |change: &SessionChange| -> Result<()> {
            if change.identity_changed() {
                observer_fence.advance(change.generation);
            }
            if observer_tx
                .send(EngineCommand::SessionChanged(change.clone()))
                .is_err()
            {
                debug!("Sync engine stopped, ignoring session change");
            }
            Ok(())
        }));

        let (current, generation) = sessions.snapshot();
        fence.advance(generation);
        if current.is_active() {
            let _ = commands.send(EngineCommand::SessionChanged(SessionChange {
                previous: Default::default(),
                current,
                generation,
            }));
        }

        Self {
            commands,
            status,
            mirrors,
        }
    }

    /// Reload every collection and wait for the result.
    ///
    /// Resolves only from a load that started after the call, so a write made
    /// just before is always reflected; a load already in flight is followed by
    /// one more. While live, subscriptions stay open and their events are
    /// applied after the new content is installed. From `Suspended` this starts
    /// over with a fresh retry budget.
    pub async fn refresh(&self) -> Result<()> {
        let (response, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::Refresh { response })
            .map_err(|e| SyncError::CommandSendError(e.to_string()))?;
        rx.await.map_err(|_| SyncError::EngineStopped)?
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> SyncState {
        self.status.borrow().state
    }

    /// Receiver for status updates.
    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Wait until the engine reaches `state`.
    pub async fn wait_for(&self, state: SyncState) -> Result<SyncStatus> {
        let mut rx = self.status.clone();
        let status = rx
            .wait_for(|status| status.state == state)
            .await
            .map_err(|_| SyncError::EngineStopped)?;
        Ok(status.clone())
    }

    pub fn mirrors(&self) -> &Arc<Mirrors> {
        &self.mirrors
    }

    /// Stop the engine. Subscriptions are closed and the mirrors cleared.
    pub fn shutdown(&self) {
        let _ = self.commands.send(EngineCommand::Shutdown);
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
