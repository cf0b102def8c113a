//! Run records: one execution of a job for one trigger occurrence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::step::ErrorInfo;
use crate::trigger::TriggerKind;

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

/// Life-cycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Persisted but not yet driven.
    Pending,
    /// The job body is currently being replayed/executed.
    Running,
    /// Suspended on a timer, retry or child invocation.
    Waiting,
    Completed,
    Failed,
}

impl RunStatus {
    /// Completed and failed runs never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Waiting => "waiting",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "waiting" => Ok(RunStatus::Waiting),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("invalid run status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// ParentLink / RunCursor
// ---------------------------------------------------------------------------

/// Causal edge from a parent run's invocation step to a child run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub run_id: Uuid,
    /// Step key of the invocation inside the parent run.
    pub step_key: String,
    /// Position of this child in the parent's payload list (0 for single invokes).
    pub index: usize,
    /// Whether the parent is suspended until this child finishes.
    pub wait: bool,
}

/// Where the latest replay of a run stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCursor {
    /// Number of steps that resolved during the latest replay.
    pub resolved_steps: u32,
    /// Step the run is suspended on, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_on: Option<String>,
}

// ---------------------------------------------------------------------------
// RunRecord
// ---------------------------------------------------------------------------

/// A single execution instance of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// UUIDv7 run ID.
    pub id: Uuid,
    pub job_id: String,
    pub job_version: String,
    /// Which trigger kind created the run.
    pub trigger: TriggerKind,
    /// Validated input payload.
    pub payload: Value,
    pub status: RunStatus,
    #[serde(default)]
    pub cursor: RunCursor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    /// Build a fresh `Pending` run.
    pub fn new(
        id: Uuid,
        job_id: impl Into<String>,
        job_version: impl Into<String>,
        trigger: TriggerKind,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            job_id: job_id.into(),
            job_version: job_version.into(),
            trigger,
            payload,
            status: RunStatus::Pending,
            cursor: RunCursor::default(),
            parent: None,
            callback_url: None,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}
