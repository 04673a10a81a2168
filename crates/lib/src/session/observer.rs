//! Observers notified after every session transition.
//!
//! The [`SessionStore`](super::SessionStore) calls every registered observer
//! synchronously once the new state is in place. Observers may read the store from
//! inside the callback, but must not call `transition` (the store holds its
//! transition lock while notifying).

use std::sync::Arc;

use super::SessionChange;
use crate::Result;

/// Trait for components that react to session transitions.
pub trait SessionObserver: Send + Sync {
    /// Called after the session state has been updated.
    ///
    /// Failures are logged by the store; they never roll back the transition.
    fn on_session_changed(&self, change: &SessionChange) -> Result<()>;
}

impl<F> SessionObserver for F
where
    F: Fn(&SessionChange) -> Result<()> + Send + Sync,
{
    fn on_session_changed(&self, change: &SessionChange) -> Result<()> {
        self(change)
    }
}

/// Ordered set of observers.
#[derive(Default, Clone)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn SessionObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
        }
    }

    pub fn add(&mut self, observer: Arc<dyn SessionObserver>) {
        self.observers.push(observer);
    }

    /// Notify every observer in registration order.
    ///
    /// A failing observer does not stop the remaining ones. Returns the first error.
    pub fn notify(&self, change: &SessionChange) -> Result<()> {
        let mut first_error = None;

        for observer in &self.observers {
            if let Err(e) = observer.on_session_changed(change) {
                tracing::error!("Session observer failed: {e}");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}
