//! The wire-facing representation of one change notification.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Format of the `timestamp` field in a wire frame.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// The verb of an upstream change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Added => "ADDED",
            ChangeKind::Modified => "MODIFIED",
            ChangeKind::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalized change notification.
///
/// Values are produced only by [`Normalizer`](crate::normalize::Normalizer)
/// and are never re-inspected or rewritten downstream of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub change_kind: ChangeKind,
    /// Type of the changed entity, e.g. `Pod`.
    pub resource_kind: String,
    /// Empty for cluster-scoped entities.
    pub namespace: String,
    pub name: String,
    /// Empty when the source record carries no message.
    pub message: String,
    pub observed_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct Frame<'a> {
    #[serde(rename = "type")]
    change_kind: ChangeKind,
    object: FrameObject<'a>,
    timestamp: String,
}

#[derive(Serialize)]
struct FrameObject<'a> {
    kind: &'a str,
    name: &'a str,
    namespace: &'a str,
    message: &'a str,
}

impl Event {
    /// Encodes this event as the JSON document sent in one text frame.
    pub fn to_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(&Frame {
            change_kind: self.change_kind,
            object: FrameObject {
                kind: &self.resource_kind,
                name: &self.name,
                namespace: &self.namespace,
                message: &self.message,
            },
            timestamp: self.observed_at.format(TIMESTAMP_FORMAT).to_string(),
        })
    }
}
