//! Flotilla persistence: versioned SQLite store for BundleDeployment rows and
//! the append-only watch-event log.
//!
//! Every write assigns a fresh store-wide resource version and appends one
//! event row in the same transaction. Rows hold serialized JSON columns; the
//! [`codec`] module converts between rows and typed objects.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod codec;
mod sqlite;

pub use sqlite::{default_db_path, SqliteStore, DEFAULT_EVENT_RETENTION};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bundledeployment {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },
    #[error("bundledeployment {namespace}/{name} already exists")]
    AlreadyExists { namespace: String, name: String },
    #[error("resource version conflict on {namespace}/{name}: expected {expected}, stored {actual}")]
    Conflict { namespace: String, name: String, expected: i64, actual: i64 },
    #[error("decoding {field} of {namespace}/{name}: {source}")]
    Codec {
        namespace: String,
        name: String,
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid record: {0}")]
    Invalid(String),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StoreError {
    pub fn not_found(namespace: &str, name: &str) -> Self {
        StoreError::NotFound { namespace: namespace.to_string(), name: name.to_string() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// One `bundledeployments` row. JSON columns are kept serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub namespace: String,
    pub name: String,
    pub resource_version: i64,
    pub uid: String,
    /// Unix seconds.
    pub creation_timestamp: i64,
    pub deletion_timestamp: Option<i64>,
    pub generation: i64,
    pub labels: Option<String>,
    pub annotations: Option<String>,
    pub finalizers: Option<String>,
    pub owner_references: Option<String>,
    pub spec: String,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Added => "ADDED",
            EventType::Modified => "MODIFIED",
            EventType::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADDED" => Ok(EventType::Added),
            "MODIFIED" => Ok(EventType::Modified),
            "DELETED" => Ok(EventType::Deleted),
            other => Err(StoreError::Invalid(format!("unknown event type '{other}'"))),
        }
    }
}

/// One `watch_events` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEventRecord {
    pub id: i64,
    pub resource_version: i64,
    pub event_type: EventType,
    pub namespace: String,
    pub name: String,
    /// Unix seconds.
    pub timestamp: i64,
}

/// Versioned record storage. Implementations serialize all writes; reads may
/// run concurrently with them.
pub trait RecordStore: Send + Sync + 'static {
    /// Bump and persist the store-wide counter without writing a row.
    fn next_resource_version(&self) -> StoreResult<i64>;
    /// Greatest version assigned so far (0 on an empty store).
    fn current_resource_version(&self) -> i64;
    fn get(&self, namespace: &str, name: &str) -> StoreResult<Record>;
    /// Rows in `namespace` (all namespaces when `None`) and the counter value
    /// read in the same critical section.
    fn list(&self, namespace: Option<&str>) -> StoreResult<(Vec<Record>, i64)>;
    fn create(&self, record: Record) -> StoreResult<Record>;
    /// Overwrite an existing row. With `expected_rv` set the stored version
    /// must match or [`StoreError::Conflict`] is returned.
    fn update(&self, record: Record, expected_rv: Option<i64>) -> StoreResult<Record>;
    /// Remove a row, returning its last contents stamped with the deletion version.
    fn delete(&self, namespace: &str, name: &str) -> StoreResult<Record>;
    /// Events with a version greater than `rv`, ascending, at most `limit`.
    fn events_since(&self, rv: i64, namespace: Option<&str>, limit: usize) -> StoreResult<Vec<WatchEventRecord>>;
    /// Smallest version still retained in the event log.
    fn oldest_event_version(&self) -> StoreResult<Option<i64>>;
}
