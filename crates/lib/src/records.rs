//! Record types for the server-owned collections.
//!
//! Records are owned by the backend: ids are assigned on insert and may arrive as
//! JSON numbers or strings. [`RecordId`] normalises both to a string key.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use serde_json::Value;

/// The collections mirrored by the portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Projects,
    Assets,
    Feedback,
}

impl Collection {
    /// Every collection, in load order.
    pub const ALL: [Collection; 3] = [Collection::Projects, Collection::Assets, Collection::Feedback];

    /// Table name used by the backend.
    pub fn name(&self) -> &'static str {
        match self {
            Collection::Projects => "projects",
            Collection::Assets => "assets",
            Collection::Feedback => "intelligence",
        }
    }

    /// Resolve a backend table name. Unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        Collection::ALL.into_iter().find(|c| c.name() == name)
    }

    /// Ordering requested from the backend on bulk-load.
    pub fn load_order(&self) -> Option<OrderBy> {
        match self {
            Collection::Feedback => Some(OrderBy::descending("created_at")),
            _ => None,
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordering parameter for `select_all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBy {
    pub column: &'static str,
    pub descending: bool,
}

impl OrderBy {
    pub fn ascending(column: &'static str) -> Self {
        Self {
            column,
            descending: false,
        }
    }

    pub fn descending(column: &'static str) -> Self {
        Self {
            column,
            descending: true,
        }
    }
}

/// Stable record identifier assigned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Read the `id` field of a raw record.
    pub fn from_record(record: &Value) -> Option<Self> {
        match record.get("id")? {
            Value::String(s) => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(serde_json::Number),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => RecordId(s),
            Raw::Number(n) => RecordId(n.to_string()),
        })
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u64> for RecordId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

/// A record that can live in a [`CollectionMirror`](crate::mirror::CollectionMirror).
pub trait Record: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The collection this record type belongs to.
    const COLLECTION: Collection;

    fn id(&self) -> &RecordId;

    /// Owning user, if the backend included it.
    fn owner(&self) -> Option<&str>;

    /// Creation time used for newest-first ordering.
    fn created_at(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// An AI project belonging to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: RecordId,
    pub name: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

fn default_status() -> String {
    "active".to_string()
}

impl Record for Project {
    const COLLECTION: Collection = Collection::Projects;

    fn id(&self) -> &RecordId {
        &self.id
    }

    fn owner(&self) -> Option<&str> {
        self.user_id.as_deref()
    }
}

/// A digital asset belonging to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: RecordId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Record for Asset {
    const COLLECTION: Collection = Collection::Assets;

    fn id(&self) -> &RecordId {
        &self.id
    }

    fn owner(&self) -> Option<&str> {
        self.user_id.as_deref()
    }
}

/// One entry of the feedback log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackItem {
    pub id: RecordId,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Record for FeedbackItem {
    const COLLECTION: Collection = Collection::Feedback;

    fn id(&self) -> &RecordId {
        &self.id
    }

    fn owner(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }
}

/// Insert payload for a project.
#[derive(Debug, Clone, Serialize)]
pub struct NewProject<'a> {
    pub name: &'a str,
    pub user_id: &'a str,
    pub status: &'a str,
}

/// Insert payload for an asset.
#[derive(Debug, Clone, Serialize)]
pub struct NewAsset<'a> {
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub user_id: &'a str,
    pub value: Value,
}

/// Insert payload for a feedback item.
#[derive(Debug, Clone, Serialize)]
pub struct NewFeedback<'a> {
    pub text: &'a str,
    pub user_id: &'a str,
}
