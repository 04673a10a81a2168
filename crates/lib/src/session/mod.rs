//! Session tracking
//!
//! [`SessionStore`] owns the authentication session and the session generation.
//! Every transition is total: any event from any state yields a defined next
//! state. The generation is bumped whenever the session identity changes so that
//! asynchronous work started for an older session can be recognised and discarded.

use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

mod errors;
mod observer;

pub use errors::AuthError;
pub use observer::{ObserverSet, SessionObserver};

/// An authenticated session issued by the backend.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Opaque bearer token for backend calls
    pub access_token: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl Session {
    pub fn new(access_token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            user_id: user_id.into(),
            email: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

// Tokens must not end up in logs.
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("email", &self.email)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Current authentication state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Absent,
    Active(Session),
}

impl SessionState {
    pub fn from_option(session: Option<Session>) -> Self {
        match session {
            Some(session) => SessionState::Active(session),
            None => SessionState::Absent,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Active(_))
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            SessionState::Active(session) => Some(session),
            SessionState::Absent => None,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.session().map(|s| s.user_id.as_str())
    }
}

/// Authentication transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Sign-in succeeded with the given session.
    LoginSucceeded(Session),
    /// Registration succeeded; the account still needs email verification.
    RegisterSucceeded,
    /// The user asked to log out.
    LogoutRequested,
    /// The backend reported a session change (refresh, revocation, other tab).
    ExternalChange(Option<Session>),
}

/// Notification delivered to observers after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionChange {
    pub previous: SessionState,
    pub current: SessionState,
    /// Generation after the transition
    pub generation: u64,
}

impl SessionChange {
    /// True when the transition moved to a different user or to/from `Absent`.
    pub fn identity_changed(&self) -> bool {
        self.previous.user_id() != self.current.user_id()
    }
}

#[derive(Debug, Default)]
struct StoreState {
    state: SessionState,
    generation: u64,
}

/// Holder of the current session.
#[derive(Default)]
pub struct SessionStore {
    inner: Mutex<StoreState>,
    observers: RwLock<ObserverSet>,
    /// Serialises transitions so observers see changes in order
    transition_lock: Mutex<()>,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("SessionStore")
            .field("state", &inner.state)
            .field("generation", &inner.generation)
            .finish()
    }
}

impl SessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn current(&self) -> SessionState {
        self.inner.lock().unwrap().state.clone()
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().unwrap().generation
    }

    /// State and generation read together.
    pub fn snapshot(&self) -> (SessionState, u64) {
        let inner = self.inner.lock().unwrap();
        (inner.state.clone(), inner.generation)
    }

    /// Register an observer for all future transitions.
    pub fn subscribe(&self, observer: Arc<dyn SessionObserver>) {
        self.observers.write().unwrap().add(observer);
    }

    /// Apply `event` and notify observers. Returns the new state.
    pub fn transition(&self, event: SessionEvent) -> SessionState {
        let _serial = self.transition_lock.lock().unwrap();

        let change = {
            let mut inner = self.inner.lock().unwrap();
            let previous = inner.state.clone();
            let current = match event {
                SessionEvent::LoginSucceeded(session) => SessionState::Active(session),
                SessionEvent::RegisterSucceeded => previous.clone(),
                SessionEvent::LogoutRequested => SessionState::Absent,
                SessionEvent::ExternalChange(session) => SessionState::from_option(session),
            };
            if previous.user_id() != current.user_id() {
                inner.generation += 1;
                info!(
                    generation = inner.generation,
                    user = current.user_id().unwrap_or("<none>"),
                    "Session identity changed"
                );
            }
            inner.state = current.clone();
            SessionChange {
                previous,
                current,
                generation: inner.generation,
            }
        };

        // State lock is released before observers run so they can read it
        let observers = self.observers.read().unwrap().clone();
        let _ = observers.notify(&change);

        change.current
    }
}
