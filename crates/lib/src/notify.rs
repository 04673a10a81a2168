//! User-facing notices.
//!
//! The portal shows at most one notice at a time. Raising a notice replaces the
//! previous one, so the latest failure is always what the user sees.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::Error;

/// Category of a notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Auth,
    Data,
    Subscription,
    Info,
}

/// A message for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
}

impl Notice {
    pub fn new(kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(NoticeKind::Info, message)
    }

    /// The notice to show for `error`.
    ///
    /// Validation errors are returned inline to the caller and produce no notice.
    pub fn from_error(error: &Error) -> Option<Self> {
        let kind = match error {
            Error::Validation(_) => return None,
            Error::Auth(_) => NoticeKind::Auth,
            Error::Subscription(_) => NoticeKind::Subscription,
            Error::Data(_) | Error::Sync(_) | Error::Config(_) | Error::Serialize(_) => {
                NoticeKind::Data
            }
        };
        Some(Self::new(kind, error.to_string()))
    }
}

/// Single-slot notice channel.
#[derive(Debug, Clone)]
pub struct Notifier {
    slot: Arc<watch::Sender<Option<Notice>>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot: Arc::new(slot),
        }
    }

    /// Show `notice`, replacing whatever was shown before.
    pub fn raise(&self, notice: Notice) {
        debug!(kind = ?notice.kind, message = %notice.message, "Raising notice");
        self.slot.send_replace(Some(notice));
    }

    /// Show the notice for `error`, if it warrants one.
    pub fn raise_error(&self, error: &Error) {
        if let Some(notice) = Notice::from_error(error) {
            self.raise(notice);
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.raise(Notice::info(message));
    }

    pub fn dismiss(&self) {
        self.slot.send_replace(None);
    }

    pub fn current(&self) -> Option<Notice> {
        self.slot.borrow().clone()
    }

    /// Receiver that observes every change to the slot.
    pub fn subscribe(&self) -> watch::Receiver<Option<Notice>> {
        self.slot.subscribe()
    }
}
