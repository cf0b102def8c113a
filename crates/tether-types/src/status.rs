//! Run status records: labeled, versioned progress objects attached to a run.
//!
//! Updates are partial overwrites: omitted fields keep their prior value and
//! provided fields (including the whole `data` object) replace it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// StatusState
// ---------------------------------------------------------------------------

/// `"loading" | "success" | "failure"` or any caller-defined string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatusState {
    Loading,
    Success,
    Failure,
    Custom(String),
}

impl StatusState {
    pub fn as_str(&self) -> &str {
        match self {
            StatusState::Loading => "loading",
            StatusState::Success => "success",
            StatusState::Failure => "failure",
            StatusState::Custom(s) => s,
        }
    }
}

impl From<&str> for StatusState {
    fn from(s: &str) -> Self {
        match s {
            "loading" => StatusState::Loading,
            "success" => StatusState::Success,
            "failure" => StatusState::Failure,
            other => StatusState::Custom(other.to_string()),
        }
    }
}

impl std::fmt::Display for StatusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for StatusState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for StatusState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(StatusState::from(s.as_str()))
    }
}

// ---------------------------------------------------------------------------
// StatusUpdate
// ---------------------------------------------------------------------------

/// A full or partial overwrite of a status record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StatusState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl StatusUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn state(mut self, state: impl Into<StatusState>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn data(mut self, data: Map<String, Value>) -> Self {
        self.data = Some(data);
        self
    }
}

// ---------------------------------------------------------------------------
// StatusRecord
// ---------------------------------------------------------------------------

/// Current value of one status key within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub run_id: Uuid,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StatusState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    /// Increases by one on every applied update, starting at 1.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl StatusRecord {
    /// An empty record at version 0, before its first update.
    pub fn empty(run_id: Uuid, key: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            run_id,
            key: key.into(),
            label: None,
            state: None,
            data: None,
            version: 0,
            updated_at: now,
        }
    }

    /// Merge `update` into this record and bump the version.
    pub fn apply(&mut self, update: &StatusUpdate, now: DateTime<Utc>) {
        if let Some(label) = &update.label {
            self.label = Some(label.clone());
        }
        if let Some(state) = &update.state {
            self.state = Some(state.clone());
        }
        if let Some(data) = &update.data {
            self.data = Some(data.clone());
        }
        self.version += 1;
        self.updated_at = now;
    }
}
