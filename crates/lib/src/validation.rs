//! Local input validation.
//!
//! Validation runs before any backend call. A [`ValidationError`] is returned
//! inline to the caller and is never raised as a notification.

use thiserror::Error;

/// Errors for missing or mismatched user input.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A single required field was blank.
    #[error("{field} is required")]
    Required { field: &'static str },

    /// Login form is incomplete.
    #[error("Email and Password are required")]
    MissingCredentials,

    /// Registration form is incomplete or the passwords differ.
    #[error("Email, Password, and confirmation are required and must match")]
    RegistrationMismatch,
}

impl ValidationError {
    /// Name of the offending field, when the error concerns a single field.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            ValidationError::Required { field } => Some(field),
            _ => None,
        }
    }
}

impl From<ValidationError> for crate::Error {
    fn from(err: ValidationError) -> Self {
        crate::Error::Validation(err)
    }
}

/// Return the trimmed value, or `Required` if nothing is left.
pub fn require_non_empty<'a>(field: &'static str, value: &'a str) -> Result<&'a str, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Required { field });
    }
    Ok(trimmed)
}

/// Validate login input.
pub fn check_login(email: &str, password: &str) -> Result<(), ValidationError> {
    if email.trim().is_empty() || password.is_empty() {
        return Err(ValidationError::MissingCredentials);
    }
    Ok(())
}

/// Validate registration input.
pub fn check_registration(email: &str, password: &str, confirm: &str) -> Result<(), ValidationError> {
    if email.trim().is_empty() || password.is_empty() || password != confirm {
        return Err(ValidationError::RegistrationMismatch);
    }
    Ok(())
}
