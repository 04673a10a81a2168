//! Portal configuration
//!
//! Backend coordinates come from the environment (`PORTAL_URL`, `PORTAL_ANON_KEY`)
//! or from JSON. Sync tuning has defaults for every field.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::records::Collection;
pub use crate::sync::RetryPolicy;

/// Environment variable holding the backend base URL.
pub const URL_VAR: &str = "PORTAL_URL";
/// Environment variable holding the public (anonymous) API key.
pub const ANON_KEY_VAR: &str = "PORTAL_ANON_KEY";

/// Configuration errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Missing configuration value: {name}")]
    Missing { name: &'static str },

    #[error("Invalid backend URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

impl From<ConfigError> for crate::Error {
    fn from(err: ConfigError) -> Self {
        crate::Error::Config(err)
    }
}

/// How the engine treats a remote change for one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteChangePolicy {
    /// Apply the event to the mirror.
    #[default]
    Reconcile,
    /// Treat any event as a signal to reload everything.
    Reload,
}

/// Per-collection remote change policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteChanges {
    pub projects: RemoteChangePolicy,
    pub assets: RemoteChangePolicy,
    pub feedback: RemoteChangePolicy,
}

impl RemoteChanges {
    pub fn for_collection(&self, collection: Collection) -> RemoteChangePolicy {
        match collection {
            Collection::Projects => self.projects,
            Collection::Assets => self.assets,
            Collection::Feedback => self.feedback,
        }
    }

    /// Reload on any project or asset change, reconcile feedback.
    pub fn reload_owned() -> Self {
        Self {
            projects: RemoteChangePolicy::Reload,
            assets: RemoteChangePolicy::Reload,
            feedback: RemoteChangePolicy::Reconcile,
        }
    }
}

/// Where the hosted backend lives.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub url: String,
    pub anon_key: String,
}

impl BackendConfig {
    pub fn new(url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            anon_key: anon_key.into(),
        }
    }

    /// Read the backend coordinates from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = std::env::var(URL_VAR).map_err(|_| ConfigError::Missing { name: URL_VAR })?;
        let anon_key =
            std::env::var(ANON_KEY_VAR).map_err(|_| ConfigError::Missing { name: ANON_KEY_VAR })?;
        let config = Self { url, anon_key };
        config.base_url()?;
        Ok(config)
    }

    /// The validated base URL.
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::Missing { name: URL_VAR });
        }
        let url = Url::parse(&self.url).map_err(|e| ConfigError::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        if url.cannot_be_a_base() {
            return Err(ConfigError::InvalidUrl {
                url: self.url.clone(),
                reason: "not a base URL".to_string(),
            });
        }
        Ok(url)
    }
}

/// Sync engine tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Backoff for bulk loads and resubscription
    pub retry: RetryPolicy,
    /// How often polling change feeds query the backend
    pub poll_interval_ms: u64,
    pub remote_changes: RemoteChanges,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            poll_interval_ms: 2000,
            remote_changes: RemoteChanges::default(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    pub backend: BackendConfig,
    pub sync: SyncConfig,
}

impl PortalConfig {
    /// Backend coordinates from the environment, default sync tuning.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            backend: BackendConfig::from_env()?,
            sync: SyncConfig::default(),
        })
    }

    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }
}
