//! The client portal: authentication flows wired to the sync engine.
//!
//! [`Portal`] owns one of everything: the session store, the mirrors, the
//! notifier, the sync engine and the mutation gateway, all sharing one backend.
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> portal::Result<()> {
//! use portal::{Portal, PortalConfig};
//!
//! let portal = Portal::connect(&PortalConfig::from_env()?)?;
//! portal.start().await;
//! portal.login("client@example.com", "secret").await?;
//! portal.gateway().create_project("Vision model").await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    Result,
    backend::{Backend, RestBackend},
    config::{PortalConfig, SyncConfig},
    gateway::MutationGateway,
    mirror::Mirrors,
    notify::Notifier,
    session::{Session, SessionEvent, SessionState, SessionStore},
    sync::{SyncEngine, SyncStatus},
    validation::{check_login, check_registration},
};

/// Message shown after a successful registration.
pub const REGISTRATION_NOTICE: &str =
    "Registration successful. Please check your email for verification.";

/// Account tier shown in the portal header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SubscriptionLevel {
    Premium,
}

impl fmt::Display for SubscriptionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionLevel::Premium => f.write_str("Premium"),
        }
    }
}

/// A running client portal.
pub struct Portal {
    backend: Arc<dyn Backend>,
    sessions: Arc<SessionStore>,
    notifier: Notifier,
    engine: Arc<SyncEngine>,
    gateway: MutationGateway,
    session_forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Portal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Portal")
            .field("session", &self.sessions.current())
            .field("status", &self.engine.status())
            .finish()
    }
}

impl Portal {
    /// Create a portal on top of `backend`. Must be called within a Tokio runtime.
    pub fn new(backend: Arc<dyn Backend>, config: SyncConfig) -> Self {
        let sessions = SessionStore::new();
        let mirrors = Arc::new(Mirrors::new());
        let notifier = Notifier::new();
        let engine = Arc::new(SyncEngine::start(
            backend.clone(),
            &sessions,
            mirrors,
            notifier.clone(),
            config,
        ));
        let gateway = MutationGateway::new(
            backend.clone(),
            sessions.clone(),
            engine.clone(),
            notifier.clone(),
        );
        Self {
            backend,
            sessions,
            notifier,
            engine,
            gateway,
            session_forwarder: Mutex::new(None),
        }
    }

    /// Create a portal talking to the hosted backend described by `config`.
    pub fn connect(config: &PortalConfig) -> Result<Self> {
        let backend = RestBackend::new(
            &config.backend,
            Duration::from_millis(config.sync.poll_interval_ms),
        )?;
        Ok(Self::new(Arc::new(backend), config.sync.clone()))
    }

    /// Adopt the backend's persisted session and follow its session changes.
    ///
    /// Calling `start` again replaces the previous session listener.
    pub async fn start(&self) {
        // Listen before reading so a change in between is not lost
        let mut changes = self.backend.on_session_change();

        match self.backend.get_session().await {
            Ok(session) => {
                debug!(active = session.is_some(), "Restored persisted session");
                self.sessions.transition(SessionEvent::ExternalChange(session));
            }
            Err(e) => {
                warn!("Failed to read persisted session: {e}");
                self.notifier.raise_error(&e);
            }
        }

        let sessions = self.sessions.clone();
        let backend = self.backend.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(session) => {
                        sessions.transition(SessionEvent::ExternalChange(session));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed session changes, re-reading session");
                        if let Ok(session) = backend.get_session().await {
                            sessions.transition(SessionEvent::ExternalChange(session));
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        if let Some(old) = self.session_forwarder.lock().unwrap().replace(forwarder) {
            old.abort();
        }
    }

    /// Sign in with email and password.
    pub async fn login(&self, email: &str, password: &str) -> Result<Session> {
        check_login(email, password)?;
        match self.backend.sign_in(email.trim(), password).await {
            Ok(session) => {
                info!(user = %session.user_id, "Logged in");
                self.sessions
                    .transition(SessionEvent::LoginSucceeded(session.clone()));
                self.notifier.dismiss();
                Ok(session)
            }
            Err(e) => {
                warn!("Login failed: {e}");
                self.notifier.raise_error(&e);
                Err(e)
            }
        }
    }

    /// Create an account. The user must verify their email before logging in.
    pub async fn register(&self, email: &str, password: &str, confirm: &str) -> Result<()> {
        check_registration(email, password, confirm)?;
        match self.backend.sign_up(email.trim(), password).await {
            Ok(()) => {
                info!("Registered new account");
                self.sessions.transition(SessionEvent::RegisterSucceeded);
                self.notifier.info(REGISTRATION_NOTICE);
                Ok(())
            }
            Err(e) => {
                warn!("Registration failed: {e}");
                self.notifier.raise_error(&e);
                Err(e)
            }
        }
    }

    /// Sign out. The local session is cleared even if the backend call fails.
    pub async fn logout(&self) -> Result<()> {
        let result = self.backend.sign_out().await;
        if let Err(e) = &result {
            warn!("Sign out failed: {e}");
            self.notifier.raise_error(e);
        }
        self.sessions.transition(SessionEvent::LogoutRequested);
        info!("Logged out");
        result
    }

    pub fn subscription_level(&self) -> SubscriptionLevel {
        SubscriptionLevel::Premium
    }

    pub fn session(&self) -> SessionState {
        self.sessions.current()
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn mirrors(&self) -> &Arc<Mirrors> {
        self.engine.mirrors()
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn status(&self) -> SyncStatus {
        self.engine.status()
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn gateway(&self) -> &MutationGateway {
        &self.gateway
    }
}

impl Drop for Portal {
    fn drop(&mut self) {
        if let Ok(slot) = self.session_forwarder.get_mut()
            && let Some(forwarder) = slot.take()
        {
            forwarder.abort();
        }
        self.engine.shutdown();
    }
}
