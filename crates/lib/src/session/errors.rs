//! Error types for authentication and session handling.

use thiserror::Error;

/// Errors from login, registration and session management.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum AuthError {
    /// The backend rejected the email/password pair.
    #[error("Invalid login credentials")]
    InvalidCredentials,

    /// An account with this email already exists.
    #[error("User already registered: {email}")]
    UserAlreadyExists { email: String },

    /// The operation needs an active session.
    #[error("Not signed in")]
    NotAuthenticated,

    /// The session token was rejected or has expired.
    #[error("Session expired or revoked")]
    SessionExpired,

    #[error("Sign-in failed: {reason}")]
    SignInFailed { reason: String },

    #[error("Registration failed: {reason}")]
    SignUpFailed { reason: String },

    #[error("Sign-out failed: {reason}")]
    SignOutFailed { reason: String },

    /// The current session could not be read from the backend.
    #[error("Failed to read session: {reason}")]
    SessionUnavailable { reason: String },
}

impl AuthError {
    /// Check if the user needs to sign in (again).
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            AuthError::NotAuthenticated | AuthError::SessionExpired | AuthError::InvalidCredentials
        )
    }

    /// Check if this is a credential rejection rather than a transport failure.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            AuthError::InvalidCredentials | AuthError::UserAlreadyExists { .. }
        )
    }
}

impl From<AuthError> for crate::Error {
    fn from(err: AuthError) -> Self {
        crate::Error::Auth(err)
    }
}
